//! Session-level error taxonomy.

use std::fmt;

use crate::registry::RegistryError;
use crate::topology::TopologyError;

/// What went wrong, coarse enough for a launcher to decide on a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad worker count or configuration. Never retried.
    InvalidArgument,
    /// A worker's handshake kept failing past the retry limit.
    Handshake,
    /// Not every worker connected before the deadline.
    RendezvousTimeout,
    /// Topology could not be delivered to every worker.
    Dispatch,
    /// The spawn backend failed to start the workers.
    Spawn,
    /// Listener could not be bound or stopped accepting.
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::Handshake => "handshake_error",
            Self::RendezvousTimeout => "rendezvous_timeout",
            Self::Dispatch => "dispatch_error",
            Self::Spawn => "spawn_error",
            Self::Io => "io_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure of a bootstrap session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct BootstrapError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl BootstrapError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, detail)
    }

    pub fn handshake(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Handshake, detail)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::RendezvousTimeout, detail)
    }

    pub fn dispatch(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Dispatch, detail)
    }

    pub fn spawn(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Spawn, detail)
    }

    pub fn io(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, detail)
    }
}

impl From<TopologyError> for BootstrapError {
    fn from(e: TopologyError) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

impl From<RegistryError> for BootstrapError {
    fn from(e: RegistryError) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

//! Worker side of the bootstrap handshake.
//!
//! A worker dials the tracker, claims a rank, waits for its release and
//! acknowledges it, then blocks until the tracker starts the whole group.

use std::io;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::bridge::codec::WorkerCodec;
use crate::bridge::protocol::{Rank, RankClaim, SessionId, TrackerMessage, WorkerMessage};
use crate::config::{DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_RENDEZVOUS_TIMEOUT};
use crate::env::{ENV_PORT, ENV_SESSION, ENV_URI, WorkerEnv};

pub const ARG_URI: &str = "tracker_uri";
pub const ARG_PORT: &str = "tracker_port";
pub const ARG_SESSION: &str = "tracker_session";

/// Default wait for Start after acknowledging the release.
///
/// The tracker holds Start until every worker has acknowledged, giving each
/// one up to its handshake timeout, so this has to exceed that timeout.
pub const DEFAULT_START_TIMEOUT: Duration = DEFAULT_HANDSHAKE_TIMEOUT.saturating_mul(2);

#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("invalid tracker address: {0}")]
    InvalidAddress(String),
    #[error("rejected by tracker: {0}")]
    Rejected(String),
    #[error("aborted by tracker: {0}")]
    Aborted(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("tracker closed the connection while waiting for {0}")]
    Disconnected(&'static str),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Where the tracker listens, as handed to a worker by the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerAddr {
    pub host: String,
    pub port: u16,
    pub session: Option<SessionId>,
}

impl TrackerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            session: None,
        }
    }

    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    /// Parse `tracker_uri=`, `tracker_port=` and `tracker_session=` from a
    /// worker's command line. Other arguments are ignored.
    pub fn from_args<I, S>(args: I) -> Result<Self, JoinError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<(String, String)> = args
            .into_iter()
            .filter_map(|arg| {
                arg.as_ref()
                    .split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();
        Self::from_lookup(|key| {
            let key = match key {
                ENV_URI => ARG_URI,
                ENV_PORT => ARG_PORT,
                ENV_SESSION => ARG_SESSION,
                other => other,
            };
            args.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v.clone())
        })
    }

    /// Read `TRACKER_URI`, `TRACKER_PORT` and `TRACKER_SESSION`.
    pub fn from_env() -> Result<Self, JoinError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, JoinError> {
        let host = lookup(ENV_URI)
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| JoinError::InvalidAddress("tracker host is not set".to_string()))?;
        let port = lookup(ENV_PORT)
            .ok_or_else(|| JoinError::InvalidAddress("tracker port is not set".to_string()))?;
        let port = port
            .trim()
            .parse()
            .map_err(|_| JoinError::InvalidAddress(format!("port {port:?} is not a number")))?;
        let session = lookup(ENV_SESSION)
            .map(|s| {
                SessionId::parse(s.trim())
                    .map_err(|e| JoinError::InvalidAddress(format!("session {s:?}: {e}")))
            })
            .transpose()?;

        Ok(Self {
            host,
            port,
            session,
        })
    }

    /// Inverse of `from_args`.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("{ARG_URI}={}", self.host),
            format!("{ARG_PORT}={}", self.port),
        ];
        if let Some(session) = self.session {
            args.push(format!("{ARG_SESSION}={session}"));
        }
        args
    }
}

/// Joins one worker to a bootstrap session.
#[derive(Debug, Clone)]
pub struct WorkerJoin {
    tracker: TrackerAddr,
    addr: String,
    claim: RankClaim,
    timeout: Duration,
    release_timeout: Duration,
    start_timeout: Duration,
}

impl WorkerJoin {
    /// `addr` is the `host:port` peers should use to reach this worker.
    pub fn new(tracker: TrackerAddr, addr: impl Into<String>) -> Self {
        Self {
            tracker,
            addr: addr.into(),
            claim: RankClaim::AutoAssign,
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            release_timeout: DEFAULT_RENDEZVOUS_TIMEOUT,
            start_timeout: DEFAULT_START_TIMEOUT,
        }
    }

    pub fn with_rank(mut self, rank: Rank) -> Self {
        self.claim = RankClaim::RequestRank { rank };
        self
    }

    /// Timeout for connecting and for each single reply.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// How long to wait for the rest of the group once a rank is assigned.
    pub fn with_release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = timeout;
        self
    }

    /// How long to wait for Start once the release is acknowledged.
    ///
    /// Keep it above the tracker's handshake timeout: the slowest worker may
    /// take that long to acknowledge before anyone is started.
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub async fn join(self) -> Result<WorkerEnv, JoinError> {
        let target = (self.tracker.host.as_str(), self.tracker.port);
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(target))
            .await
            .map_err(|_| JoinError::Timeout("connection"))??;
        stream.set_nodelay(true)?;
        let mut conn = Framed::new(stream, WorkerCodec::new());

        let hello = WorkerMessage::Hello {
            claim: self.claim,
            addr: self.addr.clone(),
            session: self.tracker.session,
        };
        tokio::time::timeout(self.timeout, conn.send(hello))
            .await
            .map_err(|_| JoinError::Timeout("hello"))??;

        let (rank, world_size) = match recv(&mut conn, self.timeout, "assignment").await? {
            TrackerMessage::Assigned { rank, world_size } => (rank, world_size),
            other => return Err(unexpected(other, "assigned")),
        };
        tracing::debug!(%rank, world_size, "Rank assigned, waiting for release");

        let env = match recv(&mut conn, self.release_timeout, "release").await? {
            TrackerMessage::Release {
                rank: released,
                world_size,
                tracker,
                neighbors,
            } if released == rank => WorkerEnv {
                rank,
                world_size,
                tracker,
                neighbors,
            },
            TrackerMessage::Release { rank: released, .. } => {
                return Err(JoinError::Protocol(format!(
                    "assigned rank {rank} but released as {released}"
                )));
            }
            other => return Err(unexpected(other, "release")),
        };

        tokio::time::timeout(self.timeout, conn.send(WorkerMessage::Ack))
            .await
            .map_err(|_| JoinError::Timeout("ack"))??;

        match recv(&mut conn, self.start_timeout, "start").await? {
            TrackerMessage::Start => {
                tracing::info!(%rank, neighbors = env.neighbors.len(), "Worker started");
                Ok(env)
            }
            other => Err(unexpected(other, "start")),
        }
    }
}

async fn recv(
    conn: &mut Framed<TcpStream, WorkerCodec>,
    timeout: Duration,
    phase: &'static str,
) -> Result<TrackerMessage, JoinError> {
    match tokio::time::timeout(timeout, conn.next()).await {
        Err(_) => Err(JoinError::Timeout(phase)),
        Ok(None) => Err(JoinError::Disconnected(phase)),
        Ok(Some(Err(e))) => Err(JoinError::Io(e)),
        Ok(Some(Ok(message))) => Ok(message),
    }
}

fn unexpected(message: TrackerMessage, expected: &str) -> JoinError {
    match message {
        TrackerMessage::Rejected { reason } => JoinError::Rejected(reason),
        TrackerMessage::Abort { reason } => JoinError::Aborted(reason),
        other => JoinError::Protocol(format!("expected {expected}, got {other:?}")),
    }
}

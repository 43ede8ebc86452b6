//! One bootstrap session: bind, gather N workers, release or abort.

use std::net::SocketAddr;

use crate::bridge::protocol::SessionId;
use crate::config::BootstrapConfig;
use crate::env::WorkerEnv;
use crate::error::BootstrapError;
use crate::server::{AbortHandle, RendezvousServer};
use crate::state::SessionStatus;

pub struct BootstrapSession {
    config: BootstrapConfig,
}

impl BootstrapSession {
    pub fn new(config: BootstrapConfig) -> Result<Self, BootstrapError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Bind the tracker without waiting for workers.
    pub async fn bind(self) -> Result<BoundSession, BootstrapError> {
        let server = RendezvousServer::bind(self.config).await?;
        Ok(BoundSession { server })
    }

    /// Run to completion. Returns only once the session is RELEASED or ABORTED.
    pub async fn run(self) -> Result<Vec<WorkerEnv>, BootstrapError> {
        self.bind().await?.run().await
    }
}

/// A session whose listener is bound and waiting to be driven.
pub struct BoundSession {
    server: RendezvousServer,
}

impl BoundSession {
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn tracker_addr(&self) -> &str {
        self.server.tracker_addr()
    }

    pub fn session_id(&self) -> SessionId {
        self.server.session_id()
    }

    pub fn status(&self) -> SessionStatus {
        self.server.status()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.server.abort_handle()
    }

    /// One `WorkerEnv` per rank in rank order, or the reason for the abort.
    pub async fn run(self) -> Result<Vec<WorkerEnv>, BootstrapError> {
        self.server.run().await
    }
}

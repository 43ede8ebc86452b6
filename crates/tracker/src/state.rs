//! Session lifecycle state and its observers.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Lifecycle of one bootstrap session.
///
/// `Listening → Assigning → TopologyReady → Released`, any state → `Aborted`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Socket bound, no worker accepted yet
    #[default]
    Listening,
    /// At least one worker registered
    Assigning,
    /// Every rank connected, topology computed, dispatch in progress
    TopologyReady,
    /// Every worker has its topology and was told to start
    Released,
    /// Session failed
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Aborted)
    }
}

/// Read-only view of a session's state, cheap to clone.
///
/// The server's event loop is the only writer.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    rx: watch::Receiver<SessionState>,
}

impl SessionStatus {
    pub(crate) fn channel() -> (watch::Sender<SessionState>, Self) {
        let (tx, rx) = watch::channel(SessionState::Listening);
        (tx, Self { rx })
    }

    pub fn current(&self) -> SessionState {
        *self.rx.borrow()
    }

    /// Wait until the session reaches `state`, or a terminal state.
    pub async fn wait_for(&mut self, state: SessionState) -> SessionState {
        let reached = match self
            .rx
            .wait_for(|s| *s == state || s.is_terminal())
            .await
        {
            Ok(s) => Some(*s),
            Err(_) => None,
        };
        // Writer gone: the last published value is final.
        reached.unwrap_or_else(|| *self.rx.borrow())
    }

    pub async fn wait_terminal(&mut self) -> SessionState {
        self.wait_for(SessionState::Released).await
    }
}

//! Wire protocol types for worker-tracker communication.
//!
//! One TCP connection per worker, used only during bootstrap:
//! - worker → tracker: `Hello`, then `Ack` once the release has been received
//! - tracker → worker: `Assigned` or `Rejected`, then `Release` + `Start`, or `Abort`

use std::fmt;

use serde::{Deserialize, Serialize};

/// A worker's stable identity within the group, in `[0, world_size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rank(u32);

impl Rank {
    pub const fn new(rank: u32) -> Self {
        Self(rank)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Rank for a slot index. Callers only pass indices below the world size,
    /// which is bounded by `u32::MAX` at config validation.
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32)
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one bootstrap session.
///
/// Handed to workers through their command line so that a straggler from an
/// earlier submission cannot join the wrong group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a worker asks for its rank.
///
/// A session serves one policy only: the first accepted claim decides it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RankClaim {
    /// Tracker hands out the lowest free rank.
    #[serde(rename = "auto")]
    AutoAssign,
    /// Worker already knows its rank (e.g. from `OMPI_COMM_WORLD_RANK`).
    #[serde(rename = "rank")]
    RequestRank { rank: Rank },
}

impl RankClaim {
    pub fn requested_rank(&self) -> Option<Rank> {
        match self {
            Self::AutoAssign => None,
            Self::RequestRank { rank } => Some(*rank),
        }
    }

    pub fn is_auto(&self) -> bool {
        matches!(self, Self::AutoAssign)
    }
}

/// A neighbor in the computed topology together with the address it advertised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub rank: Rank,
    pub addr: String,
}

/// Messages from worker to tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// First message on every connection.
    Hello {
        claim: RankClaim,
        /// `host:port` other workers will use to reach this one.
        addr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<SessionId>,
    },

    /// Release received; the worker is waiting for `Start`.
    Ack,
}

/// Messages from tracker to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackerMessage {
    Assigned {
        rank: Rank,
        world_size: u32,
    },

    /// Topology for this worker. Sent only after every rank has connected.
    Release {
        rank: Rank,
        world_size: u32,
        /// Tracker address for post-bootstrap control traffic.
        tracker: String,
        neighbors: Vec<Peer>,
    },

    /// Every worker acknowledged its release; computation may begin.
    Start,

    /// Handshake refused. The worker may reconnect.
    Rejected {
        reason: String,
    },

    /// Session failed; the worker must not wait for topology any longer.
    Abort {
        reason: String,
    },
}

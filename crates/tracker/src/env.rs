//! What a worker learns from bootstrap.

use serde::{Deserialize, Serialize};

use crate::bridge::protocol::{Peer, Rank, TrackerMessage};

pub const ENV_RANK: &str = "TRACKER_RANK";
pub const ENV_WORLD_SIZE: &str = "TRACKER_WORLD_SIZE";
pub const ENV_URI: &str = "TRACKER_URI";
pub const ENV_PORT: &str = "TRACKER_PORT";
pub const ENV_NEIGHBORS: &str = "TRACKER_NEIGHBORS";
pub const ENV_SESSION: &str = "TRACKER_SESSION";

/// Rank, group size, tracker address and topology neighbors of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEnv {
    pub rank: Rank,
    pub world_size: u32,
    /// `host:port` of the tracker.
    pub tracker: String,
    pub neighbors: Vec<Peer>,
}

impl WorkerEnv {
    pub(crate) fn release_message(&self) -> TrackerMessage {
        TrackerMessage::Release {
            rank: self.rank,
            world_size: self.world_size,
            tracker: self.tracker.clone(),
            neighbors: self.neighbors.clone(),
        }
    }

    pub fn neighbor_ranks(&self) -> Vec<Rank> {
        self.neighbors.iter().map(|p| p.rank).collect()
    }

    /// Environment variables carrying this worker's bootstrap result.
    ///
    /// Neighbors are encoded as comma separated `rank@host:port`.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let (uri, port) = self
            .tracker
            .rsplit_once(':')
            .unwrap_or((self.tracker.as_str(), ""));
        let neighbors = self
            .neighbors
            .iter()
            .map(|p| format!("{}@{}", p.rank, p.addr))
            .collect::<Vec<_>>()
            .join(",");

        vec![
            (ENV_RANK.to_string(), self.rank.to_string()),
            (ENV_WORLD_SIZE.to_string(), self.world_size.to_string()),
            (ENV_URI.to_string(), uri.to_string()),
            (ENV_PORT.to_string(), port.to_string()),
            (ENV_NEIGHBORS.to_string(), neighbors),
        ]
    }
}

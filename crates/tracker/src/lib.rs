//! tracker: rendezvous service that bootstraps a fixed-size group of workers.
//!
//! Workers dial the tracker, receive a rank in `[0, N)`, and once all N are
//! connected every worker is released together with its topology neighbors.

pub mod bridge;
pub mod config;
pub mod env;
pub mod error;
pub mod launch;
pub mod registry;
pub mod server;
pub mod session;
pub mod state;
pub mod topology;
pub mod worker;

pub use bridge::protocol::{Peer, Rank, RankClaim, SessionId};
pub use config::BootstrapConfig;
pub use env::WorkerEnv;
pub use error::{BootstrapError, ErrorKind};
pub use launch::{
    FnSpawner, LocalSpawner, MpiSpawner, SpawnError, WorkerSpawner, submit, submit_with_config,
};
pub use server::{AbortHandle, RendezvousServer};
pub use session::{BootstrapSession, BoundSession};
pub use state::{SessionState, SessionStatus};
pub use topology::{Topology, TopologyKind, build_topology};
pub use worker::{JoinError, TrackerAddr, WorkerJoin};

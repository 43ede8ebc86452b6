//! Communication topology among ranks.
//!
//! Computed once, after every rank has connected, and shared read-only by all
//! release messages.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bridge::protocol::Rank;

/// Shape of the graph handed to workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologyKind {
    /// Binary tree rooted at rank 0. Suited to reduce/broadcast.
    #[default]
    Tree,
    /// Bidirectional ring. Suited to ring allreduce.
    Ring,
}

impl fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tree => f.write_str("tree"),
            Self::Ring => f.write_str("ring"),
        }
    }
}

impl FromStr for TopologyKind {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tree" => Ok(Self::Tree),
            "ring" => Ok(Self::Ring),
            other => Err(TopologyError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    #[error("invalid topology: world size must be at least 1, got {0}")]
    InvalidTopology(usize),
    #[error("unknown topology kind '{0}', expected 'tree' or 'ring'")]
    UnknownKind(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeRole {
    /// `a` is the parent of `b`.
    ParentChild,
    Peer,
}

/// Undirected edge between two ranks. For peers, `a < b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyEdge {
    pub a: Rank,
    pub b: Rank,
    pub role: EdgeRole,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    kind: TopologyKind,
    neighbors: Vec<Vec<Rank>>,
    parents: Vec<Option<Rank>>,
}

impl Topology {
    pub fn kind(&self) -> TopologyKind {
        self.kind
    }

    pub fn world_size(&self) -> usize {
        self.neighbors.len()
    }

    /// Neighbors of `rank`; for trees the parent comes first, then children.
    pub fn neighbors(&self, rank: Rank) -> &[Rank] {
        self.neighbors
            .get(rank.index())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn parent(&self, rank: Rank) -> Option<Rank> {
        self.parents.get(rank.index()).copied().flatten()
    }

    /// Children of `rank` in a tree. Empty for rings.
    pub fn children(&self, rank: Rank) -> Vec<Rank> {
        match self.kind {
            TopologyKind::Tree => self
                .neighbors(rank)
                .iter()
                .copied()
                .filter(|n| Some(*n) != self.parent(rank))
                .collect(),
            TopologyKind::Ring => Vec::new(),
        }
    }

    /// Every edge exactly once.
    pub fn edges(&self) -> Vec<TopologyEdge> {
        let mut edges = Vec::new();
        for (index, neighbors) in self.neighbors.iter().enumerate() {
            let rank = Rank::from_index(index);
            for &other in neighbors {
                match self.kind {
                    TopologyKind::Tree if self.parent(other) == Some(rank) => {
                        edges.push(TopologyEdge {
                            a: rank,
                            b: other,
                            role: EdgeRole::ParentChild,
                        });
                    }
                    TopologyKind::Ring if rank < other => {
                        edges.push(TopologyEdge {
                            a: rank,
                            b: other,
                            role: EdgeRole::Peer,
                        });
                    }
                    _ => {}
                }
            }
        }
        edges
    }
}

/// Build the topology for `n` ranks.
///
/// Pure and deterministic: equal inputs give equal graphs.
pub fn build_topology(n: usize, kind: TopologyKind) -> Result<Topology, TopologyError> {
    if n < 1 {
        return Err(TopologyError::InvalidTopology(n));
    }

    let (neighbors, parents) = match kind {
        TopologyKind::Tree => tree(n),
        TopologyKind::Ring => ring(n),
    };

    Ok(Topology {
        kind,
        neighbors,
        parents,
    })
}

fn tree(n: usize) -> (Vec<Vec<Rank>>, Vec<Option<Rank>>) {
    let mut neighbors = Vec::with_capacity(n);
    let mut parents = Vec::with_capacity(n);

    for r in 0..n {
        let parent = (r > 0).then(|| Rank::from_index((r - 1) / 2));
        let mut adjacent: Vec<Rank> = parent.into_iter().collect();
        adjacent.extend(
            [2 * r + 1, 2 * r + 2]
                .into_iter()
                .filter(|&c| c < n)
                .map(Rank::from_index),
        );
        neighbors.push(adjacent);
        parents.push(parent);
    }

    (neighbors, parents)
}

fn ring(n: usize) -> (Vec<Vec<Rank>>, Vec<Option<Rank>>) {
    let neighbors = (0..n)
        .map(|r| {
            let mut adjacent: Vec<Rank> = [(r + n - 1) % n, (r + 1) % n]
                .into_iter()
                .filter(|&other| other != r)
                .map(Rank::from_index)
                .collect();
            adjacent.dedup();
            adjacent
        })
        .collect();

    (neighbors, vec![None; n])
}

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::id::{ChunkId, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkReplica {
    pub node_id: NodeId,
    /// The part index for erasure-coded chunks. Always zero for regular chunks.
    pub replica_index: usize,
}

impl ChunkReplica {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            replica_index: 0,
        }
    }

    pub fn part(node_id: NodeId, replica_index: usize) -> Self {
        Self {
            node_id,
            replica_index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ErasureCodec {
    #[default]
    None,
    Erasure {
        data_parts: usize,
        parity_parts: usize,
    },
}

/// Decides whether a chunk with the given replicas cannot be read.
///
/// A regular chunk is unavailable when no replica is known.
/// An erasure-coded chunk is unavailable when some data part has no replica,
/// or when some parity part has no replica and `check_parity_replicas` is set.
pub fn is_unavailable(
    replicas: &[ChunkReplica],
    codec: ErasureCodec,
    check_parity_replicas: bool,
) -> bool {
    match codec {
        ErasureCodec::None => replicas.is_empty(),
        ErasureCodec::Erasure {
            data_parts,
            parity_parts,
        } => {
            let parts = replicas
                .iter()
                .map(|r| r.replica_index)
                .collect::<HashSet<_>>();
            let required = if check_parity_replicas {
                data_parts + parity_parts
            } else {
                data_parts
            };
            (0..required).any(|i| !parts.contains(&i))
        }
    }
}

/// An input chunk as seen by the controller at preparation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputChunkSpec {
    pub chunk_id: ChunkId,
    pub replicas: Vec<ChunkReplica>,
    pub codec: ErasureCodec,
    pub data_weight: u64,
}

/// A piece of a chunk assigned to a stripe.
/// A chunk may be sliced into several slices across stripes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSlice {
    pub chunk_id: ChunkId,
    pub data_weight: u64,
    pub replicas: Vec<ChunkReplica>,
}

impl ChunkSlice {
    pub fn is_on_node(&self, node_id: NodeId) -> bool {
        self.replicas.iter().any(|r| r.node_id == node_id)
    }
}

/// A batch of chunk slices processed by one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkStripe {
    pub slices: Vec<ChunkSlice>,
    /// Whether the slices are intermediate chunks produced by another task.
    pub intermediate: bool,
}

impl ChunkStripe {
    pub fn new(slices: Vec<ChunkSlice>) -> Self {
        Self {
            slices,
            intermediate: false,
        }
    }

    pub fn intermediate(slices: Vec<ChunkSlice>) -> Self {
        Self {
            slices,
            intermediate: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn data_weight(&self) -> u64 {
        self.slices.iter().map(|s| s.data_weight).sum()
    }

    /// The data weight of the slices that have a replica on the node.
    pub fn locality(&self, node_id: NodeId) -> u64 {
        self.slices
            .iter()
            .filter(|s| s.is_on_node(node_id))
            .map(|s| s.data_weight)
            .sum()
    }

    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        let mut seen = HashSet::new();
        self.slices
            .iter()
            .map(|s| s.chunk_id)
            .filter(|id| seen.insert(*id))
            .collect()
    }

    pub fn nodes(&self) -> HashSet<NodeId> {
        self.slices
            .iter()
            .flat_map(|s| s.replicas.iter().map(|r| r.node_id))
            .collect()
    }
}

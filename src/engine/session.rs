use crate::analysis::{CommunityCheckpoint, CommunityGraph, FinalGraph};
use crate::graph::{EdgeKey, GraphCheckpoint, TransactionGraph};
use crate::types::Transfer;
use alloy_primitives::Address;
use std::collections::BTreeSet;

/// Graph state that lives across batches.
///
/// A batch updates the global and community graphs in place after taking a [`SessionCheckpoint`]
/// of the parts it can touch. If any stage fails the checkpoint is rolled back, so a failed batch
/// never leaves a half-updated graph behind.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub global_graph: TransactionGraph,
    pub communities: CommunityGraph,
    /// Final graph as of the last committed batch. Each batch reloads it from its artifact.
    pub final_graph: FinalGraph,
    pub batch_number: u64,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resume_at(batch_number: u64) -> Self {
        Self { batch_number, ..Self::default() }
    }

    /// Checkpoint covering every edge and address the given transfers can touch.
    pub fn checkpoint(&self, transfers: &[Transfer]) -> SessionCheckpoint {
        let edges: BTreeSet<EdgeKey> = transfers.iter().map(|t| (t.sender, t.receiver)).collect();
        let addresses: BTreeSet<Address> = transfers.iter().flat_map(|t| [t.sender, t.receiver]).collect();
        SessionCheckpoint {
            graph: self.global_graph.checkpoint(&edges),
            communities: self.communities.checkpoint(&addresses),
        }
    }

    pub fn rollback(&mut self, checkpoint: SessionCheckpoint) {
        self.global_graph.rollback(checkpoint.graph);
        self.communities.rollback(checkpoint.communities);
    }
}

#[derive(Debug, Clone)]
pub struct SessionCheckpoint {
    pub graph: GraphCheckpoint,
    pub communities: CommunityCheckpoint,
}

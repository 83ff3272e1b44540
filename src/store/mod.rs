/// Persistence layer for the raw transaction log and the durable EOA / cluster tables.
///
/// The detector only talks to [`PersistenceStore`]; [`InMemoryStore`] is the reference
/// implementation used by tests and the demo.
pub mod memory;
pub mod migration;

pub use memory::InMemoryStore;
pub use migration::{LegacyClusterRow, LegacyEoaRow, MigratedTables, migrate_legacy_ids};

use crate::analysis::SuspiciousCluster;
use crate::error::Result;
use crate::types::{ContractTransaction, TransactionKind, Transfer};
use alloy_primitives::Address;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EoaRow {
    pub id: u64,
    pub address: Address,
    pub cluster_id: Option<u64>,
}

/// Table form of a cluster. Members are stored as canonical JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspiciousClusterRow {
    pub id: u64,
    pub members: String,
    pub score: f64,
    pub classification: String,
    pub first_seen: u64,
    pub last_seen: u64,
    pub detections: u64,
    pub merged_into: Option<u64>,
}

impl SuspiciousClusterRow {
    pub fn from_cluster(cluster: &SuspiciousCluster) -> Result<Self> {
        let members: Vec<String> = cluster.members.iter().map(|m| m.to_string()).collect();
        Ok(Self {
            id: cluster.id,
            members: serde_json::to_string(&members)?,
            score: cluster.score,
            classification: cluster.classification.to_string(),
            first_seen: cluster.first_seen,
            last_seen: cluster.last_seen,
            detections: cluster.detections,
            merged_into: cluster.merged_into,
        })
    }

    pub fn member_addresses(&self) -> Result<Vec<Address>> {
        let members: Vec<Address> = serde_json::from_str(&self.members)?;
        Ok(members)
    }
}

/// Everything a successful batch writes, applied in one transaction.
#[derive(Debug, Clone, Default)]
pub struct BatchCommit {
    pub transfer_ids: Vec<u64>,
    pub contract_transaction_ids: Vec<u64>,
    /// Addresses to upsert with their current cluster reference
    pub eoas: Vec<(Address, Option<u64>)>,
    pub clusters: Vec<SuspiciousClusterRow>,
    /// Cluster ids first assigned by this batch. Every other cluster row must already exist.
    pub new_cluster_ids: BTreeSet<u64>,
}

#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Appends a transfer and returns its id. A failure leaves nothing behind.
    async fn insert_transfer(&self, row: Transfer) -> Result<u64>;

    async fn insert_contract_transaction(&self, row: ContractTransaction) -> Result<u64>;

    /// Unprocessed transfers ordered by block, timestamp and id.
    async fn query_unprocessed_transfers(&self) -> Result<Vec<Transfer>>;

    async fn query_unprocessed_contract_transactions(&self) -> Result<Vec<ContractTransaction>>;

    /// Marks the batch processed and upserts its EOA and cluster rows, all or nothing.
    async fn commit_batch(&self, commit: BatchCommit) -> Result<()>;

    /// Deletes processed rows with a timestamp before `cutoff`. Unprocessed rows are never removed.
    async fn evict_older_than(&self, cutoff: u64, kind: TransactionKind) -> Result<usize>;

    async fn committed_batches(&self) -> Result<u64>;

    async fn eoa(&self, address: &Address) -> Result<Option<EoaRow>>;

    async fn clusters(&self) -> Result<Vec<SuspiciousClusterRow>>;

    /// Highest cluster id in the table, migrated rows included.
    async fn max_cluster_id(&self) -> Result<Option<u64>>;
}

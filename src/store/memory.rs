use super::migration::MigratedTables;
use super::{BatchCommit, EoaRow, PersistenceStore, SuspiciousClusterRow};
use crate::error::{Result, SybilError};
use crate::types::{ContractTransaction, TransactionKind, Transfer};
use alloy_primitives::Address;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
struct Tables {
    transfers: BTreeMap<u64, Transfer>,
    contract_transactions: BTreeMap<u64, ContractTransaction>,
    eoas: BTreeMap<Address, EoaRow>,
    clusters: BTreeMap<u64, SuspiciousClusterRow>,
    next_transfer_id: u64,
    next_contract_transaction_id: u64,
    next_eoa_id: u64,
    committed_batches: u64,
}

/// Store keeping every table in memory behind one lock, so each call is its own transaction.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn transfer(&self, id: u64) -> Option<Transfer> {
        self.tables.read().await.transfers.get(&id).cloned()
    }

    pub async fn transfer_count(&self) -> usize {
        self.tables.read().await.transfers.len()
    }

    pub async fn contract_transaction_count(&self) -> usize {
        self.tables.read().await.contract_transactions.len()
    }

    /// Loads migrated legacy tables. Only allowed on an empty store.
    pub async fn import_migrated(&self, migrated: MigratedTables) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.eoas.is_empty() || !tables.clusters.is_empty() {
            return Err(SybilError::Store("migration target already holds EOA or cluster rows".to_string()));
        }
        tables.next_eoa_id = migrated.eoas.iter().map(|row| row.id).max().unwrap_or_default();
        tables.eoas = migrated.eoas.into_iter().map(|row| (row.address, row)).collect();
        tables.clusters = migrated.clusters.into_iter().map(|row| (row.id, row)).collect();
        Ok(())
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn insert_transfer(&self, mut row: Transfer) -> Result<u64> {
        let mut tables = self.tables.write().await;
        tables.next_transfer_id += 1;
        row.id = tables.next_transfer_id;
        row.processed = false;
        tables.transfers.insert(row.id, row);
        Ok(tables.next_transfer_id)
    }

    async fn insert_contract_transaction(&self, mut row: ContractTransaction) -> Result<u64> {
        let mut tables = self.tables.write().await;
        tables.next_contract_transaction_id += 1;
        row.id = tables.next_contract_transaction_id;
        row.processed = false;
        tables.contract_transactions.insert(row.id, row);
        Ok(tables.next_contract_transaction_id)
    }

    async fn query_unprocessed_transfers(&self) -> Result<Vec<Transfer>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<Transfer> = tables.transfers.values().filter(|row| !row.processed).cloned().collect();
        rows.sort_by_key(|row| (row.block_number, row.timestamp, row.id));
        Ok(rows)
    }

    async fn query_unprocessed_contract_transactions(&self) -> Result<Vec<ContractTransaction>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<ContractTransaction> =
            tables.contract_transactions.values().filter(|row| !row.processed).cloned().collect();
        rows.sort_by_key(|row| (row.block_number, row.timestamp, row.id));
        Ok(rows)
    }

    async fn commit_batch(&self, commit: BatchCommit) -> Result<()> {
        let mut tables = self.tables.write().await;

        // validate first, nothing is applied unless every row checks out
        for id in &commit.transfer_ids {
            match tables.transfers.get(id) {
                Some(row) if !row.processed => {}
                Some(_) => return Err(SybilError::Store(format!("transfer {id} already processed"))),
                None => return Err(SybilError::Store(format!("transfer {id} not found"))),
            }
        }
        for id in &commit.contract_transaction_ids {
            if !tables.contract_transactions.contains_key(id) {
                return Err(SybilError::Store(format!("contract transaction {id} not found")));
            }
        }
        for row in &commit.clusters {
            let exists = tables.clusters.contains_key(&row.id);
            match (commit.new_cluster_ids.contains(&row.id), exists) {
                (true, true) => return Err(SybilError::Store(format!("cluster {} already exists", row.id))),
                (false, false) => return Err(SybilError::Store(format!("cluster {} not found", row.id))),
                _ => {}
            }
        }

        for id in &commit.transfer_ids {
            if let Some(row) = tables.transfers.get_mut(id) {
                row.processed = true;
            }
        }
        for id in &commit.contract_transaction_ids {
            if let Some(row) = tables.contract_transactions.get_mut(id) {
                row.processed = true;
            }
        }
        for (address, cluster_id) in commit.eoas {
            if let Some(row) = tables.eoas.get_mut(&address) {
                row.cluster_id = cluster_id.or(row.cluster_id);
                continue;
            }
            tables.next_eoa_id += 1;
            let id = tables.next_eoa_id;
            tables.eoas.insert(address, EoaRow { id, address, cluster_id });
        }
        for row in commit.clusters {
            tables.clusters.insert(row.id, row);
        }
        tables.committed_batches += 1;
        debug!("Committed batch {}", tables.committed_batches);
        Ok(())
    }

    async fn evict_older_than(&self, cutoff: u64, kind: TransactionKind) -> Result<usize> {
        let mut tables = self.tables.write().await;
        let removed = match kind {
            TransactionKind::Transfer => {
                let before = tables.transfers.len();
                tables.transfers.retain(|_, row| !row.processed || row.timestamp >= cutoff);
                before - tables.transfers.len()
            }
            TransactionKind::ContractTransaction => {
                let before = tables.contract_transactions.len();
                tables.contract_transactions.retain(|_, row| !row.processed || row.timestamp >= cutoff);
                before - tables.contract_transactions.len()
            }
        };
        Ok(removed)
    }

    async fn committed_batches(&self) -> Result<u64> {
        Ok(self.tables.read().await.committed_batches)
    }

    async fn eoa(&self, address: &Address) -> Result<Option<EoaRow>> {
        Ok(self.tables.read().await.eoas.get(address).cloned())
    }

    async fn clusters(&self) -> Result<Vec<SuspiciousClusterRow>> {
        Ok(self.tables.read().await.clusters.values().cloned().collect())
    }

    async fn max_cluster_id(&self) -> Result<Option<u64>> {
        Ok(self.tables.read().await.clusters.keys().next_back().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionEvent;
    use alloy_primitives::U256;
    use std::collections::BTreeSet;

    fn transfer_at(timestamp: u64) -> Transfer {
        let event = TransactionEvent::new(Address::repeat_byte(1), Address::repeat_byte(2), U256::from(1), timestamp, timestamp);
        Transfer::from_event(&event)
    }

    #[tokio::test]
    async fn test_unprocessed_are_ordered() -> eyre::Result<()> {
        let store = InMemoryStore::new();
        store.insert_transfer(transfer_at(30)).await?;
        store.insert_transfer(transfer_at(10)).await?;
        store.insert_transfer(transfer_at(20)).await?;

        let rows = store.query_unprocessed_transfers().await?;
        let timestamps: Vec<u64> = rows.iter().map(|row| row.timestamp).collect();
        assert_eq!(timestamps, vec![10, 20, 30]);
        Ok(())
    }

    #[tokio::test]
    async fn test_eviction_never_removes_unprocessed() -> eyre::Result<()> {
        let store = InMemoryStore::new();
        let old_processed = store.insert_transfer(transfer_at(10)).await?;
        let old_unprocessed = store.insert_transfer(transfer_at(11)).await?;
        let recent_processed = store.insert_transfer(transfer_at(500)).await?;
        store
            .commit_batch(BatchCommit { transfer_ids: vec![old_processed, recent_processed], ..BatchCommit::default() })
            .await?;

        let removed = store.evict_older_than(100, TransactionKind::Transfer).await?;

        assert_eq!(removed, 1);
        assert!(store.transfer(old_processed).await.is_none());
        assert!(store.transfer(old_unprocessed).await.is_some());
        assert!(store.transfer(recent_processed).await.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_commit_is_all_or_nothing() -> eyre::Result<()> {
        let store = InMemoryStore::new();
        let id = store.insert_transfer(transfer_at(1)).await?;

        let result = store
            .commit_batch(BatchCommit {
                transfer_ids: vec![id, 999],
                eoas: vec![(Address::repeat_byte(1), None)],
                ..BatchCommit::default()
            })
            .await;

        assert!(result.is_err());
        assert!(!store.transfer(id).await.unwrap().processed);
        assert!(store.eoa(&Address::repeat_byte(1)).await?.is_none());
        assert_eq!(store.committed_batches().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_eoa_ids_are_stable_integers() -> eyre::Result<()> {
        let store = InMemoryStore::new();
        let a = Address::repeat_byte(1);
        let b = Address::repeat_byte(2);
        store.commit_batch(BatchCommit { eoas: vec![(a, None), (b, None)], ..BatchCommit::default() }).await?;
        store.commit_batch(BatchCommit { eoas: vec![(b, Some(3))], ..BatchCommit::default() }).await?;

        assert_eq!(store.eoa(&a).await?.unwrap().id, 1);
        let row_b = store.eoa(&b).await?.unwrap();
        assert_eq!((row_b.id, row_b.cluster_id), (2, Some(3)));
        assert_eq!(store.committed_batches().await?, 2);
        Ok(())
    }

    fn cluster_row(id: u64, first_seen: u64) -> SuspiciousClusterRow {
        SuspiciousClusterRow {
            id,
            members: "[]".to_string(),
            score: 0.7,
            classification: "CyclicTransfers".to_string(),
            first_seen,
            last_seen: first_seen,
            detections: 1,
            merged_into: None,
        }
    }

    #[tokio::test]
    async fn test_commit_never_replaces_foreign_cluster() -> eyre::Result<()> {
        let store = InMemoryStore::new();
        store
            .commit_batch(BatchCommit {
                clusters: vec![cluster_row(1, 10)],
                new_cluster_ids: BTreeSet::from([1]),
                ..BatchCommit::default()
            })
            .await?;
        let id = store.insert_transfer(transfer_at(20)).await?;

        // a second "new" cluster 1 would overwrite the first one
        let result = store
            .commit_batch(BatchCommit {
                transfer_ids: vec![id],
                clusters: vec![cluster_row(1, 50)],
                new_cluster_ids: BTreeSet::from([1]),
                ..BatchCommit::default()
            })
            .await;
        assert!(matches!(result, Err(SybilError::Store(_))));

        // updating a cluster the table never had is rejected too
        let result = store
            .commit_batch(BatchCommit { transfer_ids: vec![id], clusters: vec![cluster_row(9, 50)], ..BatchCommit::default() })
            .await;
        assert!(matches!(result, Err(SybilError::Store(_))));

        assert_eq!(store.clusters().await?, vec![cluster_row(1, 10)]);
        assert!(!store.transfer(id).await.unwrap().processed);
        assert_eq!(store.max_cluster_id().await?, Some(1));
        Ok(())
    }
}

use super::{EoaRow, SuspiciousClusterRow};
use crate::error::{Result, SybilError};
use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// EOA row from the older schema, keyed by an opaque string id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyEoaRow {
    pub id: String,
    pub address: Address,
    pub cluster_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyClusterRow {
    pub id: String,
    pub members: String,
    pub score: f64,
    pub classification: String,
    pub first_seen: u64,
    pub last_seen: u64,
}

/// Integer-keyed tables plus the id mapping that produced them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigratedTables {
    pub eoas: Vec<EoaRow>,
    pub clusters: Vec<SuspiciousClusterRow>,
    pub eoa_ids: BTreeMap<String, u64>,
    pub cluster_ids: BTreeMap<String, u64>,
}

fn assign_ids<'a>(table: &str, ids: impl Iterator<Item = &'a String>) -> Result<BTreeMap<String, u64>> {
    let mut mapping = BTreeMap::new();
    for (position, legacy) in ids.enumerate() {
        let next = position as u64 + 1;
        if mapping.insert(legacy.clone(), next).is_some() {
            return Err(SybilError::Store(format!("duplicate {table} id {legacy}")));
        }
    }
    Ok(mapping)
}

/// Rewrites string-keyed EOA and cluster rows into integer-keyed rows.
///
/// Integers are assigned from 1 in input order. Every EOA cluster reference is rewritten in
/// the same pass; a duplicate id, duplicate address or dangling reference fails the whole
/// migration and nothing is returned.
pub fn migrate_legacy_ids(eoas: &[LegacyEoaRow], clusters: &[LegacyClusterRow]) -> Result<MigratedTables> {
    let cluster_ids = assign_ids("cluster", clusters.iter().map(|row| &row.id))?;
    let eoa_ids = assign_ids("eoa", eoas.iter().map(|row| &row.id))?;

    let mut seen_addresses = BTreeSet::new();
    let mut migrated_eoas = Vec::with_capacity(eoas.len());
    for row in eoas {
        if !seen_addresses.insert(row.address) {
            return Err(SybilError::Store(format!("duplicate eoa address {}", row.address)));
        }
        let cluster_id = match &row.cluster_id {
            Some(legacy) => Some(*cluster_ids.get(legacy).ok_or_else(|| {
                SybilError::Store(format!("eoa {} references unknown cluster {legacy}", row.id))
            })?),
            None => None,
        };
        migrated_eoas.push(EoaRow { id: eoa_ids[&row.id], address: row.address, cluster_id });
    }

    let migrated_clusters = clusters
        .iter()
        .map(|row| SuspiciousClusterRow {
            id: cluster_ids[&row.id],
            members: row.members.clone(),
            score: row.score,
            classification: row.classification.clone(),
            first_seen: row.first_seen,
            last_seen: row.last_seen,
            detections: 1,
            merged_into: None,
        })
        .collect();

    info!("Migrated {} EOA rows and {} cluster rows to integer ids", eoas.len(), clusters.len());
    Ok(MigratedTables { eoas: migrated_eoas, clusters: migrated_clusters, eoa_ids, cluster_ids })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, PersistenceStore};

    fn legacy_cluster(id: &str) -> LegacyClusterRow {
        LegacyClusterRow {
            id: id.to_string(),
            members: "[]".to_string(),
            score: 0.75,
            classification: "SharedFunding".to_string(),
            first_seen: 10,
            last_seen: 20,
        }
    }

    fn legacy_eoa(id: &str, byte: u8, cluster: Option<&str>) -> LegacyEoaRow {
        LegacyEoaRow { id: id.to_string(), address: Address::repeat_byte(byte), cluster_id: cluster.map(str::to_string) }
    }

    #[tokio::test]
    async fn test_references_are_rewritten() -> eyre::Result<()> {
        let clusters = vec![legacy_cluster("c-zeta"), legacy_cluster("c-alpha")];
        let eoas = vec![legacy_eoa("e-1", 1, Some("c-alpha")), legacy_eoa("e-2", 2, None), legacy_eoa("e-3", 3, Some("c-zeta"))];

        let migrated = migrate_legacy_ids(&eoas, &clusters)?;

        assert_eq!(migrated.cluster_ids["c-zeta"], 1);
        assert_eq!(migrated.cluster_ids["c-alpha"], 2);
        assert_eq!(migrated.eoas[0].cluster_id, Some(2));
        assert_eq!(migrated.eoas[1].cluster_id, None);
        assert_eq!(migrated.eoas[2].cluster_id, Some(1));

        let store = InMemoryStore::new();
        store.import_migrated(migrated).await?;
        assert_eq!(store.eoa(&Address::repeat_byte(3)).await?.unwrap().id, 3);
        assert_eq!(store.clusters().await?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_dangling_reference_aborts() {
        let clusters = vec![legacy_cluster("c-1")];
        let eoas = vec![legacy_eoa("e-1", 1, Some("c-1")), legacy_eoa("e-2", 2, Some("c-missing"))];

        let err = migrate_legacy_ids(&eoas, &clusters).unwrap_err();
        assert!(matches!(err, SybilError::Store(msg) if msg.contains("c-missing")));
    }

    #[test]
    fn test_duplicate_ids_abort() {
        let clusters = vec![legacy_cluster("c-1"), legacy_cluster("c-1")];
        assert!(migrate_legacy_ids(&[], &clusters).is_err());

        let eoas = vec![legacy_eoa("e-1", 1, None), legacy_eoa("e-2", 1, None)];
        assert!(migrate_legacy_ids(&eoas, &[]).is_err());
    }

    #[tokio::test]
    async fn test_import_requires_empty_store() -> eyre::Result<()> {
        let store = InMemoryStore::new();
        let migrated = migrate_legacy_ids(&[legacy_eoa("e-1", 1, None)], &[])?;
        store.import_migrated(migrated.clone()).await?;

        assert!(store.import_migrated(migrated).await.is_err());
        Ok(())
    }
}

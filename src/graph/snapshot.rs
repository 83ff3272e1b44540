use super::attributes::{AttrKind, AttrMap, AttrValue, Scalar};
use crate::error::{Result, SybilError};
use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotNode {
    pub address: Address,
    pub attributes: AttrMap,
}

impl SnapshotNode {
    pub fn new(address: Address, attributes: AttrMap) -> Self {
        Self { address, attributes }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEdge {
    pub source: Address,
    pub target: Address,
    pub attributes: AttrMap,
}

impl SnapshotEdge {
    pub fn new(source: Address, target: Address, attributes: AttrMap) -> Self {
        Self { source, target, attributes }
    }
}

/// In-memory form of a graph artifact, attributes still typed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GraphSnapshot {
    pub directed: bool,
    pub nodes: Vec<SnapshotNode>,
    pub edges: Vec<SnapshotEdge>,
    /// Graph-level entries not attached to any node, e.g. clusters folded into another
    pub records: Vec<AttrMap>,
}

/// On-disk form: every attribute is a scalar, its type declared once per key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedGraph {
    directed: bool,
    node_keys: BTreeMap<String, AttrKind>,
    edge_keys: BTreeMap<String, AttrKind>,
    nodes: Vec<PersistedNode>,
    edges: Vec<PersistedEdge>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    record_keys: BTreeMap<String, AttrKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    records: Vec<BTreeMap<String, Scalar>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedNode {
    id: Address,
    data: BTreeMap<String, Scalar>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedEdge {
    source: Address,
    target: Address,
    data: BTreeMap<String, Scalar>,
}

impl GraphSnapshot {
    pub fn new(directed: bool, nodes: Vec<SnapshotNode>, edges: Vec<SnapshotEdge>) -> Self {
        Self { directed, nodes, edges, records: Vec::new() }
    }

    pub fn with_records(mut self, records: Vec<AttrMap>) -> Self {
        self.records = records;
        self
    }

    pub fn to_json(&self) -> Result<String> {
        let persisted = self.encode()?;
        Ok(serde_json::to_string_pretty(&persisted)?)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let persisted: PersistedGraph = serde_json::from_str(contents)?;
        Self::decode(persisted)
    }

    fn encode(&self) -> Result<PersistedGraph> {
        let mut node_keys = BTreeMap::new();
        let mut edge_keys = BTreeMap::new();
        let mut record_keys = BTreeMap::new();

        let nodes = self
            .nodes
            .iter()
            .map(|node| Ok(PersistedNode { id: node.address, data: encode_attributes(&node.attributes, &mut node_keys)? }))
            .collect::<Result<Vec<_>>>()?;
        let edges = self
            .edges
            .iter()
            .map(|edge| {
                Ok(PersistedEdge {
                    source: edge.source,
                    target: edge.target,
                    data: encode_attributes(&edge.attributes, &mut edge_keys)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let records = self
            .records
            .iter()
            .map(|record| encode_attributes(record, &mut record_keys))
            .collect::<Result<Vec<_>>>()?;

        Ok(PersistedGraph { directed: self.directed, node_keys, edge_keys, nodes, edges, record_keys, records })
    }

    fn decode(persisted: PersistedGraph) -> Result<Self> {
        let nodes = persisted
            .nodes
            .into_iter()
            .map(|node| Ok(SnapshotNode::new(node.id, decode_attributes(node.data, &persisted.node_keys)?)))
            .collect::<Result<Vec<_>>>()?;
        let edges = persisted
            .edges
            .into_iter()
            .map(|edge| Ok(SnapshotEdge::new(edge.source, edge.target, decode_attributes(edge.data, &persisted.edge_keys)?)))
            .collect::<Result<Vec<_>>>()?;
        let records = persisted
            .records
            .into_iter()
            .map(|record| decode_attributes(record, &persisted.record_keys))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { directed: persisted.directed, nodes, edges, records })
    }
}

fn encode_attributes(attributes: &AttrMap, keys: &mut BTreeMap<String, AttrKind>) -> Result<BTreeMap<String, Scalar>> {
    let mut data = BTreeMap::new();
    for (key, value) in attributes {
        let kind = value.kind();
        match keys.get(key) {
            Some(declared) if *declared != kind => {
                return Err(SybilError::Serialization {
                    key: key.clone(),
                    reason: format!("declared {declared}, got {kind}"),
                });
            }
            Some(_) => {}
            None => {
                keys.insert(key.clone(), kind);
            }
        }
        data.insert(key.clone(), value.to_scalar(key)?);
    }
    Ok(data)
}

fn decode_attributes(data: BTreeMap<String, Scalar>, keys: &BTreeMap<String, AttrKind>) -> Result<AttrMap> {
    let mut attributes = AttrMap::new();
    for (key, scalar) in data {
        let Some(kind) = keys.get(&key) else {
            return Err(SybilError::GraphLoad { path: String::new(), reason: format!("undeclared attribute `{key}`") });
        };
        let value = AttrValue::from_scalar(*kind, scalar, &key)?;
        attributes.insert(key, value);
    }
    Ok(attributes)
}

/// Snapshot file written next to its final location, not yet visible under the artifact name.
#[derive(Debug)]
pub struct StagedSnapshot {
    target: PathBuf,
    staged: PathBuf,
}

/// Artifacts that were moved into place; holds backups until the batch commits.
#[derive(Debug, Default)]
pub struct Promotion {
    replaced: Vec<(PathBuf, Option<PathBuf>)>,
}

/// Named graph artifacts in one directory, overwritten each batch.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// `Ok(None)` only when the artifact does not exist. Unreadable or corrupt files are errors.
    pub async fn load(&self, name: &str) -> Result<Option<GraphSnapshot>> {
        let path = self.path(name);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(load_error(&path, e.to_string())),
        };
        GraphSnapshot::from_json(&contents).map(Some).map_err(|e| load_error(&path, e.to_string()))
    }

    pub async fn save(&self, name: &str, snapshot: &GraphSnapshot) -> Result<()> {
        let staged = self.stage(name, snapshot).await?;
        let promotion = self.promote(vec![staged]).await?;
        promotion.finish().await;
        Ok(())
    }

    /// Encodes and writes the snapshot to `<name>.tmp`. Encoding failures leave nothing on disk.
    pub async fn stage(&self, name: &str, snapshot: &GraphSnapshot) -> Result<StagedSnapshot> {
        let contents = snapshot.to_json()?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let target = self.path(name);
        let staged = with_suffix(&target, "tmp");
        tokio::fs::write(&staged, contents).await?;
        debug!("Staged snapshot {}", staged.display());
        Ok(StagedSnapshot { target, staged })
    }

    /// Moves staged files over their targets, keeping the previous versions as `.bak`.
    ///
    /// On failure everything promoted so far is restored and remaining staged files are removed.
    pub async fn promote(&self, staged: Vec<StagedSnapshot>) -> Result<Promotion> {
        let mut promotion = Promotion::default();
        let mut pending = staged.into_iter();

        while let Some(item) = pending.next() {
            if let Err(e) = promote_one(&item, &mut promotion).await {
                let _ = tokio::fs::remove_file(&item.staged).await;
                for rest in pending {
                    let _ = tokio::fs::remove_file(&rest.staged).await;
                }
                promotion.rollback().await?;
                return Err(e);
            }
        }
        Ok(promotion)
    }

    pub async fn discard(&self, staged: Vec<StagedSnapshot>) {
        for item in staged {
            if let Err(e) = tokio::fs::remove_file(&item.staged).await {
                warn!("Failed to remove staged snapshot {}: {}", item.staged.display(), e);
            }
        }
    }
}

async fn promote_one(item: &StagedSnapshot, promotion: &mut Promotion) -> Result<()> {
    let backup = match tokio::fs::try_exists(&item.target).await? {
        true => {
            let backup = with_suffix(&item.target, "bak");
            tokio::fs::rename(&item.target, &backup).await?;
            Some(backup)
        }
        false => None,
    };
    if let Err(e) = tokio::fs::rename(&item.staged, &item.target).await {
        if let Some(backup) = &backup {
            tokio::fs::rename(backup, &item.target).await?;
        }
        return Err(e.into());
    }
    promotion.replaced.push((item.target.clone(), backup));
    Ok(())
}

impl Promotion {
    /// Puts the previous artifacts back. Targets that did not exist before are removed.
    pub async fn rollback(self) -> Result<()> {
        for (target, backup) in self.replaced.into_iter().rev() {
            match backup {
                Some(backup) => tokio::fs::rename(&backup, &target).await?,
                None => tokio::fs::remove_file(&target).await?,
            }
        }
        Ok(())
    }

    /// Drops the backups once the batch is committed.
    pub async fn finish(self) {
        for (_, backup) in self.replaced {
            if let Some(backup) = backup {
                if let Err(e) = tokio::fs::remove_file(&backup).await {
                    warn!("Failed to remove snapshot backup {}: {}", backup.display(), e);
                }
            }
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn load_error(path: &Path, reason: String) -> SybilError {
    SybilError::GraphLoad { path: path.display().to_string(), reason }
}

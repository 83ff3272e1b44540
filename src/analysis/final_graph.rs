use super::community_merger::CommunityGraph;
use super::suspicion::{ClusterCandidate, SuspicionClass};
use crate::error::{Result, SybilError};
use crate::graph::{AttrMap, AttrValue, FastHashMap, GraphSnapshot, SnapshotEdge, SnapshotNode, SnapshotStore};
use crate::types::{Finding, Severity};
use crate::utils::constants::FINAL_GRAPH_FILE;
use alloy_primitives::{Address, U256};
use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Append-only audit record of a detected cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct SuspiciousCluster {
    pub id: u64,
    pub members: BTreeSet<Address>,
    pub score: f64,
    pub classification: SuspicionClass,
    pub first_seen: u64,
    pub last_seen: u64,
    pub detections: u64,
    /// Older cluster ids folded into this one
    pub absorbed: BTreeSet<u64>,
    /// Set when this cluster was folded into an older one
    pub merged_into: Option<u64>,
}

impl SuspiciousCluster {
    fn from_candidate(id: u64, candidate: &ClusterCandidate) -> Self {
        Self {
            id,
            members: candidate.members.clone(),
            score: candidate.score,
            classification: candidate.classification,
            first_seen: candidate.first_seen,
            last_seen: candidate.last_seen,
            detections: 1,
            absorbed: BTreeSet::new(),
            merged_into: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.merged_into.is_none()
    }

    pub fn severity(&self) -> Severity {
        Severity::from_score(self.score)
    }

    /// Widens the detection window and keeps the strongest evidence.
    fn absorb_detection(&mut self, members: &BTreeSet<Address>, score: f64, classification: SuspicionClass, first_seen: u64, last_seen: u64) {
        self.members.extend(members.iter().copied());
        self.first_seen = self.first_seen.min(first_seen);
        self.last_seen = self.last_seen.max(last_seen);
        if score > self.score {
            self.score = score;
            self.classification = classification;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterEdge {
    pub weight: U256,
    pub count: u64,
}

/// Durable graph of every confirmed cluster across all batches.
///
/// Nodes are member addresses, edges are the transfers observed inside a cluster.
#[derive(Debug, Clone, Default)]
pub struct FinalGraph {
    pub graph: UnGraph<Address, ClusterEdge, usize>,
    pub address_index: FastHashMap<Address, NodeIndex<usize>>,
    clusters: BTreeMap<u64, SuspiciousCluster>,
    // address -> active cluster id
    cluster_of: BTreeMap<Address, u64>,
    next_id: u64,
}

impl FinalGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clusters(&self) -> &BTreeMap<u64, SuspiciousCluster> {
        &self.clusters
    }

    pub fn cluster(&self, id: u64) -> Option<&SuspiciousCluster> {
        self.clusters.get(&id)
    }

    pub fn active_clusters(&self) -> impl Iterator<Item = &SuspiciousCluster> {
        self.clusters.values().filter(|cluster| cluster.is_active())
    }

    pub fn cluster_of(&self, address: &Address) -> Option<u64> {
        self.cluster_of.get(address).copied()
    }

    /// Id the next new cluster will get.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Keeps new ids clear of ids already taken elsewhere, e.g. by migrated cluster rows.
    pub fn reserve_ids_through(&mut self, id: u64) {
        self.next_id = self.next_id.max(id.saturating_add(1));
    }

    pub fn findings(&self, ids: &BTreeSet<u64>) -> Vec<Finding> {
        ids.iter()
            .filter_map(|id| self.clusters.get(id))
            .filter(|cluster| cluster.is_active())
            .map(|cluster| Finding {
                cluster_id: cluster.id,
                members: cluster.members.clone(),
                evidence: format!(
                    "{} score={:.3} detections={} window={}..{}",
                    cluster.classification, cluster.score, cluster.detections, cluster.first_seen, cluster.last_seen
                ),
                severity: cluster.severity(),
            })
            .collect()
    }

    fn add_or_get_node(&mut self, address: Address) -> NodeIndex<usize> {
        *self.address_index.entry(address).or_insert_with(|| self.graph.add_node(address))
    }

    fn upsert_edge(&mut self, a: Address, b: Address, edge: ClusterEdge) {
        let from = self.add_or_get_node(a);
        let to = self.add_or_get_node(b);
        self.graph.update_edge(from, to, edge);
    }

    /// Folds `other` into `target`. The absorbed record stays, pointing at its new home.
    fn absorb_cluster(&mut self, target: u64, other: u64) {
        let Some(absorbed) = self.clusters.get_mut(&other) else {
            return;
        };
        absorbed.merged_into = Some(target);
        let absorbed = absorbed.clone();

        if let Some(cluster) = self.clusters.get_mut(&target) {
            cluster.absorb_detection(
                &absorbed.members,
                absorbed.score,
                absorbed.classification,
                absorbed.first_seen,
                absorbed.last_seen,
            );
            cluster.detections += absorbed.detections;
            cluster.absorbed.insert(other);
            cluster.absorbed.extend(absorbed.absorbed.iter().copied());
        }
        for member in absorbed.members {
            self.cluster_of.insert(member, target);
        }
    }

    pub fn to_snapshot(&self) -> GraphSnapshot {
        let nodes = self
            .graph
            .node_weights()
            .filter_map(|address| {
                let cluster = self.cluster_of.get(address).and_then(|id| self.clusters.get(id))?;
                Some(SnapshotNode::new(*address, cluster_attributes(cluster)))
            })
            .collect();

        let edges = self
            .graph
            .edge_references()
            .map(|edge| {
                let mut attributes = AttrMap::new();
                attributes.insert("weight".to_string(), AttrValue::Text(edge.weight().weight.to_string()));
                attributes.insert("count".to_string(), AttrValue::Integer(edge.weight().count as i64));
                SnapshotEdge::new(self.graph[edge.source()], self.graph[edge.target()], attributes)
            })
            .collect();

        // folded clusters have no nodes of their own
        let records = self
            .clusters
            .values()
            .filter_map(|cluster| {
                let target = cluster.merged_into?;
                let mut attributes = cluster_attributes(cluster);
                attributes.insert("merged_into".to_string(), AttrValue::Integer(target as i64));
                Some(attributes)
            })
            .collect();

        GraphSnapshot::new(false, nodes, edges).with_records(records)
    }

    /// Rebuilds the graph from a persisted snapshot, folded cluster records included.
    pub fn from_snapshot(snapshot: &GraphSnapshot) -> Result<Self> {
        let mut final_graph = FinalGraph::new();
        let mut max_id: Option<u64> = None;

        for node in &snapshot.nodes {
            let cluster = cluster_from_attributes(&node.attributes)?;
            if !cluster.members.contains(&node.address) {
                return Err(snapshot_error(format!("{} is not listed in cluster {}", node.address, cluster.id)));
            }
            for id in std::iter::once(cluster.id).chain(cluster.absorbed.iter().copied()) {
                max_id = Some(max_id.map_or(id, |current| current.max(id)));
            }
            final_graph.add_or_get_node(node.address);
            final_graph.cluster_of.insert(node.address, cluster.id);
            final_graph.clusters.entry(cluster.id).or_insert(cluster);
        }

        for record in &snapshot.records {
            let mut cluster = cluster_from_attributes(record)?;
            cluster.merged_into = Some(required_integer(record, "merged_into")? as u64);
            for id in std::iter::once(cluster.id).chain(cluster.absorbed.iter().copied()) {
                max_id = Some(max_id.map_or(id, |current| current.max(id)));
            }
            if final_graph.clusters.contains_key(&cluster.id) {
                return Err(snapshot_error(format!("cluster {} is both active and folded", cluster.id)));
            }
            final_graph.clusters.insert(cluster.id, cluster);
        }

        for edge in &snapshot.edges {
            let weight = required(&edge.attributes, "weight")?
                .as_text()
                .and_then(|text| U256::from_str(text).ok())
                .ok_or_else(|| snapshot_error("edge weight is not a decimal amount".to_string()))?;
            let count = required_integer(&edge.attributes, "count")? as u64;
            final_graph.upsert_edge(edge.source, edge.target, ClusterEdge { weight, count });
        }

        final_graph.next_id = max_id.map_or(0, |id| id + 1);
        Ok(final_graph)
    }
}

fn cluster_attributes(cluster: &SuspiciousCluster) -> AttrMap {
    let mut attributes = AttrMap::new();
    attributes.insert("cluster_id".to_string(), AttrValue::Integer(cluster.id as i64));
    attributes.insert("score".to_string(), AttrValue::Float(cluster.score));
    attributes.insert("classification".to_string(), AttrValue::Text(cluster.classification.to_string()));
    attributes.insert("first_seen".to_string(), AttrValue::Integer(cluster.first_seen as i64));
    attributes.insert("last_seen".to_string(), AttrValue::Integer(cluster.last_seen as i64));
    attributes.insert("detections".to_string(), AttrValue::Integer(cluster.detections as i64));
    attributes.insert(
        "members".to_string(),
        AttrValue::TextList(cluster.members.iter().map(|member| member.to_string()).collect()),
    );
    attributes.insert(
        "absorbed".to_string(),
        AttrValue::TextList(cluster.absorbed.iter().map(|id| id.to_string()).collect()),
    );
    attributes
}

fn cluster_from_attributes(attributes: &AttrMap) -> Result<SuspiciousCluster> {
    let classification = required(attributes, "classification")?
        .as_text()
        .and_then(|text| SuspicionClass::from_str(text).ok())
        .ok_or_else(|| snapshot_error("unknown classification".to_string()))?;
    let members = required_list(attributes, "members")?
        .iter()
        .map(|text| Address::from_str(text).map_err(|e| snapshot_error(format!("bad member address {text}: {e}"))))
        .collect::<Result<BTreeSet<_>>>()?;
    let absorbed = required_list(attributes, "absorbed")?
        .iter()
        .map(|text| text.parse::<u64>().map_err(|e| snapshot_error(format!("bad absorbed id {text}: {e}"))))
        .collect::<Result<BTreeSet<_>>>()?;
    let score = required(attributes, "score")?.as_float().ok_or_else(|| snapshot_error("score is not a float".to_string()))?;

    Ok(SuspiciousCluster {
        id: required_integer(attributes, "cluster_id")? as u64,
        members,
        score,
        classification,
        first_seen: required_integer(attributes, "first_seen")? as u64,
        last_seen: required_integer(attributes, "last_seen")? as u64,
        detections: required_integer(attributes, "detections")? as u64,
        absorbed,
        merged_into: None,
    })
}

fn required<'a>(attributes: &'a AttrMap, key: &str) -> Result<&'a AttrValue> {
    attributes.get(key).ok_or_else(|| snapshot_error(format!("missing attribute `{key}`")))
}

fn required_integer(attributes: &AttrMap, key: &str) -> Result<i64> {
    required(attributes, key)?.as_integer().ok_or_else(|| snapshot_error(format!("attribute `{key}` is not an integer")))
}

fn required_list<'a>(attributes: &'a AttrMap, key: &str) -> Result<&'a [String]> {
    required(attributes, key)?.as_text_list().ok_or_else(|| snapshot_error(format!("attribute `{key}` is not a list")))
}

fn snapshot_error(reason: String) -> SybilError {
    SybilError::GraphLoad { path: FINAL_GRAPH_FILE.to_string(), reason }
}

/// Active cluster ids created or grown by one merge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinalMergeOutcome {
    pub created: BTreeSet<u64>,
    pub extended: BTreeSet<u64>,
}

impl FinalMergeOutcome {
    pub fn touched(&self) -> BTreeSet<u64> {
        self.created.union(&self.extended).copied().collect()
    }
}

/// Where the previous final graph comes from for this batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorFinalGraph {
    /// No batch has ever committed, start from an empty graph
    FirstBatch,
    /// At least one batch committed, the artifact must exist
    Persisted,
}

/// Accumulates candidates into the durable cluster graph.
#[derive(Debug, Clone, Default)]
pub struct FinalGraphMerger;

impl FinalGraphMerger {
    pub fn new() -> Self {
        Self
    }

    pub async fn load(&self, snapshots: &SnapshotStore, prior: PriorFinalGraph) -> Result<FinalGraph> {
        let loaded = snapshots.load(FINAL_GRAPH_FILE).await?;
        match (prior, loaded) {
            (PriorFinalGraph::FirstBatch, Some(_)) => {
                warn!("Ignoring final graph artifact left over from an earlier run, no batch has committed yet");
                Ok(FinalGraph::new())
            }
            (PriorFinalGraph::FirstBatch, None) => {
                info!("First batch, starting from an empty final graph");
                Ok(FinalGraph::new())
            }
            (PriorFinalGraph::Persisted, Some(snapshot)) => FinalGraph::from_snapshot(&snapshot),
            (PriorFinalGraph::Persisted, None) => Err(SybilError::GraphLoad {
                path: snapshots.path(FINAL_GRAPH_FILE).display().to_string(),
                reason: "final graph missing although earlier batches committed".to_string(),
            }),
        }
    }

    /// Applies candidates in order of their smallest member.
    ///
    /// A candidate sharing members with active clusters extends the oldest of them, and any
    /// other overlapping cluster is folded into it. Otherwise it opens a new cluster.
    pub fn merge(&self, final_graph: &mut FinalGraph, candidates: &[ClusterCandidate], communities: &CommunityGraph) -> FinalMergeOutcome {
        let mut ordered: Vec<&ClusterCandidate> = candidates.iter().collect();
        ordered.sort_by(|a, b| {
            a.members.iter().next().cmp(&b.members.iter().next()).then(a.community_id.cmp(&b.community_id))
        });

        let mut outcome = FinalMergeOutcome::default();
        for candidate in ordered {
            let overlapping: BTreeSet<u64> = candidate.members.iter().filter_map(|m| final_graph.cluster_of(m)).collect();

            let target = match overlapping.iter().next() {
                Some(&oldest) => {
                    for other in overlapping.iter().skip(1) {
                        final_graph.absorb_cluster(oldest, *other);
                        outcome.created.remove(other);
                        outcome.extended.remove(other);
                    }
                    if let Some(cluster) = final_graph.clusters.get_mut(&oldest) {
                        cluster.absorb_detection(
                            &candidate.members,
                            candidate.score,
                            candidate.classification,
                            candidate.first_seen,
                            candidate.last_seen,
                        );
                        cluster.detections += 1;
                    }
                    if !outcome.created.contains(&oldest) {
                        outcome.extended.insert(oldest);
                    }
                    oldest
                }
                None => {
                    let id = final_graph.next_id;
                    final_graph.next_id += 1;
                    final_graph.clusters.insert(id, SuspiciousCluster::from_candidate(id, candidate));
                    outcome.created.insert(id);
                    id
                }
            };

            for member in &candidate.members {
                final_graph.cluster_of.insert(*member, target);
                final_graph.add_or_get_node(*member);
            }
            if let Some(community) = communities.get(candidate.community_id) {
                for ((sender, receiver), stats) in &community.edges {
                    if sender != receiver {
                        final_graph.upsert_edge(*sender, *receiver, ClusterEdge { weight: stats.weight, count: stats.count });
                    }
                }
            }
        }

        debug!(
            "Final graph merge: {} created, {} extended, {} active clusters",
            outcome.created.len(),
            outcome.extended.len(),
            final_graph.active_clusters().count()
        );
        outcome
    }
}

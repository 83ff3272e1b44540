use super::attributes::{AttrMap, AttrValue};
use super::edge_stats::EdgeStats;
use super::snapshot::{GraphSnapshot, SnapshotEdge, SnapshotNode};
use crate::types::Transfer;
use ahash::RandomState;
use alloy_primitives::Address;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Display;

pub type FastHasher = RandomState;
/// FastHashMap using ahash
pub type FastHashMap<K, V> = HashMap<K, V, FastHasher>;

/// Ordered (sender, receiver) key of an aggregated edge
pub type EdgeKey = (Address, Address);

/// Prior values of everything one batch may change in a [`TransactionGraph`].
#[derive(Debug, Clone)]
pub struct GraphCheckpoint {
    node_count: usize,
    edge_count: usize,
    edges: Vec<(EdgeIndex<usize>, EdgeStats)>,
    clusters: Vec<(NodeIndex<usize>, Option<u64>)>,
}

impl GraphCheckpoint {
    /// Remembers the cluster labels of `addresses` before they are overwritten.
    pub fn record_clusters<'a>(&mut self, graph: &TransactionGraph, addresses: impl IntoIterator<Item = &'a Address>) {
        for address in addresses {
            if let Some(idx) = graph.address_index.get(address) {
                let cluster_id = graph.graph.node_weight(*idx).and_then(|node| node.cluster_id);
                self.clusters.push((*idx, cluster_id));
            }
        }
    }
}

/// The global transaction graph: one node per EOA, one edge per ordered address pair.
#[derive(Debug, Clone, Default)]
pub struct TransactionGraph {
    // Plain Graph is fine here, only a rollback removes nodes or edges and it takes the newest first,
    // so surviving indices stay stable
    pub graph: DiGraph<EoaNode, EdgeStats, usize>,
    // address -> node index
    pub address_index: FastHashMap<Address, NodeIndex<usize>>,
}

impl TransactionGraph {
    pub fn new() -> Self {
        Self { graph: DiGraph::default(), address_index: FastHashMap::default() }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn add_or_get_node(&mut self, address: Address) -> NodeIndex<usize> {
        *self.address_index.entry(address).or_insert_with(|| self.graph.add_node(EoaNode::new(address)))
    }

    pub fn node(&self, address: &Address) -> Option<&EoaNode> {
        self.address_index.get(address).and_then(|idx| self.graph.node_weight(*idx))
    }

    pub fn edge(&self, sender: &Address, receiver: &Address) -> Option<&EdgeStats> {
        let from = self.address_index.get(sender)?;
        let to = self.address_index.get(receiver)?;
        self.graph.find_edge(*from, *to).and_then(|edge| self.graph.edge_weight(edge))
    }

    /// Folds a batch of transfers into the graph and returns exactly the edges it touched.
    ///
    /// Transfers between the same pair aggregate onto one edge.
    pub fn fold_transfers(&mut self, transfers: &[Transfer]) -> BTreeSet<EdgeKey> {
        let mut touched = BTreeSet::new();
        for transfer in transfers {
            let from = self.add_or_get_node(transfer.sender);
            let to = self.add_or_get_node(transfer.receiver);

            match self.graph.find_edge(from, to) {
                Some(edge_index) => {
                    if let Some(stats) = self.graph.edge_weight_mut(edge_index) {
                        stats.record(transfer.amount, transfer.timestamp);
                    }
                }
                None => {
                    self.graph.add_edge(from, to, EdgeStats::new(transfer.amount, transfer.timestamp));
                }
            }
            touched.insert((transfer.sender, transfer.receiver));
        }
        touched
    }

    /// Subgraph spanned by the given edges, built in key order so downstream stages are deterministic.
    pub fn edge_subgraph(&self, edges: &BTreeSet<EdgeKey>) -> BatchSubgraph {
        let mut subgraph = BatchSubgraph::new();
        for (sender, receiver) in edges {
            if let Some(stats) = self.edge(sender, receiver) {
                subgraph.insert_edge(*sender, *receiver, stats.clone());
            }
        }
        subgraph
    }

    /// Captures the current size and the stats of whichever `edges` already exist.
    pub fn checkpoint<'a>(&self, edges: impl IntoIterator<Item = &'a EdgeKey>) -> GraphCheckpoint {
        let edges = edges
            .into_iter()
            .filter_map(|(sender, receiver)| {
                let from = self.address_index.get(sender)?;
                let to = self.address_index.get(receiver)?;
                let index = self.graph.find_edge(*from, *to)?;
                Some((index, self.graph.edge_weight(index)?.clone()))
            })
            .collect();
        GraphCheckpoint { node_count: self.node_count(), edge_count: self.edge_count(), edges, clusters: Vec::new() }
    }

    /// Restores the graph to `checkpoint`, dropping nodes and edges added since.
    pub fn rollback(&mut self, checkpoint: GraphCheckpoint) {
        // labels are restored in reverse so the oldest recorded value wins
        for (idx, cluster_id) in checkpoint.clusters.into_iter().rev() {
            if let Some(node) = self.graph.node_weight_mut(idx) {
                node.cluster_id = cluster_id;
            }
        }
        for (idx, stats) in checkpoint.edges {
            if let Some(weight) = self.graph.edge_weight_mut(idx) {
                *weight = stats;
            }
        }
        while self.graph.edge_count() > checkpoint.edge_count {
            self.graph.remove_edge(EdgeIndex::new(self.graph.edge_count() - 1));
        }
        while self.graph.node_count() > checkpoint.node_count {
            if let Some(node) = self.graph.remove_node(NodeIndex::new(self.graph.node_count() - 1)) {
                self.address_index.remove(&node.address);
            }
        }
    }

    pub fn set_cluster(&mut self, address: Address, cluster_id: u64) {
        let idx = self.add_or_get_node(address);
        if let Some(node) = self.graph.node_weight_mut(idx) {
            node.cluster_id = Some(cluster_id);
        }
    }

    pub fn to_snapshot(&self) -> GraphSnapshot {
        let nodes = self.graph.node_weights().map(EoaNode::to_snapshot_node).collect();
        let edges = self
            .graph
            .edge_references()
            .map(|edge| {
                let from = self.graph[edge.source()].address;
                let to = self.graph[edge.target()].address;
                SnapshotEdge::new(from, to, edge_attributes(edge.weight()))
            })
            .collect();
        GraphSnapshot::new(true, nodes, edges)
    }
}

/// Directed, weighted subgraph scoped to one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchSubgraph {
    pub graph: DiGraph<Address, EdgeStats, usize>,
    pub index: FastHashMap<Address, NodeIndex<usize>>,
}

impl BatchSubgraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn add_or_get_node(&mut self, address: Address) -> NodeIndex<usize> {
        *self.index.entry(address).or_insert_with(|| self.graph.add_node(address))
    }

    /// Inserts or overwrites the edge between two addresses.
    pub fn insert_edge(&mut self, sender: Address, receiver: Address, stats: EdgeStats) -> EdgeIndex<usize> {
        let from = self.add_or_get_node(sender);
        let to = self.add_or_get_node(receiver);
        self.graph.update_edge(from, to, stats)
    }

    pub fn addresses(&self) -> BTreeSet<Address> {
        self.graph.node_weights().copied().collect()
    }

    pub fn edges(&self) -> impl Iterator<Item = (Address, Address, &EdgeStats)> + '_ {
        self.graph
            .edge_references()
            .map(|edge| (self.graph[edge.source()], self.graph[edge.target()], edge.weight()))
    }

    /// Annotates each node with its community label and returns the snapshot.
    pub fn to_snapshot_with_labels(&self, labels: &std::collections::BTreeMap<Address, u64>) -> GraphSnapshot {
        let nodes = self
            .graph
            .node_weights()
            .map(|address| {
                let mut attributes = AttrMap::new();
                if let Some(label) = labels.get(address) {
                    attributes.insert("community".to_string(), AttrValue::Integer(*label as i64));
                }
                SnapshotNode::new(*address, attributes)
            })
            .collect();
        let edges = self.edges().map(|(from, to, stats)| SnapshotEdge::new(from, to, edge_attributes(stats))).collect();
        GraphSnapshot::new(true, nodes, edges)
    }
}

pub(crate) fn edge_attributes(stats: &EdgeStats) -> AttrMap {
    let mut attributes = AttrMap::new();
    attributes.insert("weight".to_string(), AttrValue::Text(stats.weight.to_string()));
    attributes.insert("count".to_string(), AttrValue::Integer(stats.count as i64));
    attributes.insert("mean".to_string(), AttrValue::Float(stats.mean()));
    attributes.insert("variance".to_string(), AttrValue::Float(stats.variance()));
    attributes.insert("first_seen".to_string(), AttrValue::Integer(stats.first_seen as i64));
    attributes.insert("last_seen".to_string(), AttrValue::Integer(stats.last_seen as i64));
    attributes
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EoaNode {
    pub address: Address,
    pub cluster_id: Option<u64>,
}

impl Display for EoaNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#}", self.address)
    }
}

impl EoaNode {
    pub fn new(address: Address) -> Self {
        Self { address, cluster_id: None }
    }

    fn to_snapshot_node(&self) -> SnapshotNode {
        let mut attributes = AttrMap::new();
        if let Some(cluster_id) = self.cluster_id {
            attributes.insert("cluster_id".to_string(), AttrValue::Integer(cluster_id as i64));
        }
        SnapshotNode::new(self.address, attributes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;

    fn transfer(sender: u8, receiver: u8, amount: u64, timestamp: u64) -> Transfer {
        Transfer {
            id: timestamp,
            hash: Default::default(),
            sender: Address::repeat_byte(sender),
            receiver: Address::repeat_byte(receiver),
            asset: Address::ZERO,
            amount: U256::from(amount),
            block_number: timestamp,
            timestamp,
            processed: false,
        }
    }

    #[test]
    fn test_triangle_edges() {
        let mut graph = TransactionGraph::new();
        let touched = graph.fold_transfers(&[transfer(1, 2, 10, 1), transfer(2, 3, 10, 2), transfer(1, 3, 5, 3)]);

        assert_eq!(touched.len(), 3);
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 3);
        let a = Address::repeat_byte(1);
        let c = Address::repeat_byte(3);
        assert_eq!(graph.edge(&a, &c).unwrap().weight, U256::from(5));
    }

    #[test]
    fn test_multi_transfers_aggregate() {
        let mut graph = TransactionGraph::new();
        graph.fold_transfers(&[transfer(1, 2, 10, 1)]);
        let touched = graph.fold_transfers(&[transfer(1, 2, 20, 2), transfer(1, 2, 30, 3)]);

        assert_eq!(touched.len(), 1);
        assert_eq!(graph.edge_count(), 1);
        let stats = graph.edge(&Address::repeat_byte(1), &Address::repeat_byte(2)).unwrap();
        assert_eq!(stats.weight, U256::from(60));
        assert_eq!(stats.count, 3);
        assert!((stats.variance() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_graph_only_grows() {
        let mut graph = TransactionGraph::new();
        graph.fold_transfers(&[transfer(1, 2, 10, 1), transfer(3, 4, 10, 1)]);
        let before = (graph.node_count(), graph.edge_count());
        graph.fold_transfers(&[transfer(2, 1, 1, 5)]);
        assert!(graph.node_count() >= before.0);
        assert_eq!(graph.edge_count(), before.1 + 1);
    }

    #[test]
    fn test_edge_subgraph_scopes_to_touched() {
        let mut graph = TransactionGraph::new();
        graph.fold_transfers(&[transfer(1, 2, 10, 1), transfer(3, 4, 10, 1)]);
        let touched = graph.fold_transfers(&[transfer(5, 6, 1, 2)]);

        let subgraph = graph.edge_subgraph(&touched);
        assert_eq!(subgraph.node_count(), 2);
        assert_eq!(subgraph.edge_count(), 1);
    }

    #[test]
    fn test_snapshot_carries_edges() {
        let mut graph = TransactionGraph::new();
        graph.fold_transfers(&[transfer(1, 2, 10, 1)]);
        graph.set_cluster(Address::repeat_byte(1), 7);

        let snapshot = graph.to_snapshot();
        assert_eq!(snapshot.nodes.len(), 2);
        assert_eq!(snapshot.edges.len(), 1);
        assert_eq!(graph.node(&Address::repeat_byte(1)).unwrap().cluster_id, Some(7));
    }

    #[test]
    fn test_rollback_undoes_fold_and_labels() {
        let mut graph = TransactionGraph::new();
        graph.fold_transfers(&[transfer(1, 2, 10, 1), transfer(2, 3, 10, 2)]);
        graph.set_cluster(Address::repeat_byte(1), 4);
        let before = graph.to_snapshot();

        let batch = [transfer(1, 2, 30, 5), transfer(3, 9, 1, 6), transfer(9, 8, 1, 7)];
        let keys: BTreeSet<EdgeKey> = batch.iter().map(|t| (t.sender, t.receiver)).collect();
        let mut checkpoint = graph.checkpoint(&keys);
        graph.fold_transfers(&batch);
        let relabelled = [Address::repeat_byte(1), Address::repeat_byte(9)];
        checkpoint.record_clusters(&graph, &relabelled);
        for address in relabelled {
            graph.set_cluster(address, 6);
        }

        graph.rollback(checkpoint);

        assert_eq!(graph.to_snapshot(), before);
        assert!(graph.node(&Address::repeat_byte(9)).is_none());
        assert_eq!(graph.node(&Address::repeat_byte(1)).unwrap().cluster_id, Some(4));
        assert_eq!(graph.edge(&Address::repeat_byte(1), &Address::repeat_byte(2)).unwrap().weight, U256::from(10));

        // indices of surviving nodes still resolve
        graph.fold_transfers(&[transfer(3, 1, 2, 8)]);
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 3);
    }
}

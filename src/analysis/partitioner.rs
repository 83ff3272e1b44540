use crate::error::{Result, SybilError};
use crate::graph::BatchSubgraph;
use crate::utils::constants::{DEFAULT_MAX_PARTITION_ITERATIONS, DEFAULT_PARTITION_SEED};
use alloy_primitives::Address;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Total partition of a batch subgraph: every node carries exactly one community label.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partition {
    pub labels: BTreeMap<Address, u64>,
    pub iterations: usize,
    pub converged: bool,
}

impl Partition {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn community_count(&self) -> usize {
        self.labels.values().collect::<BTreeSet<_>>().len()
    }

    /// Communities in label order. Labels are compact and follow the smallest member address.
    pub fn communities(&self) -> Vec<BTreeSet<Address>> {
        let mut grouped: BTreeMap<u64, BTreeSet<Address>> = BTreeMap::new();
        for (address, label) in &self.labels {
            grouped.entry(*label).or_default().insert(*address);
        }
        grouped.into_values().collect()
    }
}

/// Weighted label propagation over the undirected view of a batch subgraph.
///
/// Nodes are visited in an order shuffled by a seeded generator, so the result is a pure
/// function of the subgraph and the seed. Runs until no label changes or until
/// `max_iterations` sweeps, whichever comes first.
#[derive(Debug, Clone)]
pub struct LabelPropagation {
    seed: u64,
    max_iterations: usize,
}

impl Default for LabelPropagation {
    fn default() -> Self {
        Self { seed: DEFAULT_PARTITION_SEED, max_iterations: DEFAULT_MAX_PARTITION_ITERATIONS }
    }
}

impl LabelPropagation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn partition(&self, subgraph: &BatchSubgraph) -> Result<Partition> {
        if self.max_iterations == 0 {
            return Err(SybilError::Partition("iteration cap must be at least 1".to_string()));
        }
        if subgraph.is_empty() {
            return Ok(Partition { converged: true, ..Partition::default() });
        }

        let nodes: Vec<Address> = subgraph.addresses().into_iter().collect();
        let position: BTreeMap<Address, usize> = nodes.iter().enumerate().map(|(i, a)| (*a, i)).collect();

        // Both directions fold onto one undirected weight, measured in transfers
        let mut neighbors: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); nodes.len()];
        for (sender, receiver, stats) in subgraph.edges() {
            if sender == receiver {
                continue;
            }
            let (Some(&u), Some(&v)) = (position.get(&sender), position.get(&receiver)) else {
                return Err(SybilError::Partition(format!("edge {sender} -> {receiver} has no endpoint node")));
            };
            let weight = stats.count.max(1) as f64;
            *neighbors[u].entry(v).or_default() += weight;
            *neighbors[v].entry(u).or_default() += weight;
        }

        let mut labels: Vec<usize> = (0..nodes.len()).collect();
        let mut order: Vec<usize> = (0..nodes.len()).collect();
        let mut rng = fastrand::Rng::with_seed(self.seed);
        let mut iterations = 0;
        let mut converged = false;

        while iterations < self.max_iterations {
            iterations += 1;
            rng.shuffle(&mut order);

            let mut changed = false;
            for &node in &order {
                if let Some(label) = dominant_label(&neighbors[node], &labels, labels[node]) {
                    if label != labels[node] {
                        labels[node] = label;
                        changed = true;
                    }
                }
            }

            if !changed {
                converged = true;
                break;
            }
        }

        if !converged {
            warn!(
                "Label propagation did not converge within {} iterations, using best-effort partition",
                self.max_iterations
            );
        }

        let partition = Partition { labels: compact_labels(&nodes, &labels), iterations, converged };
        debug!(
            "Partitioned {} nodes into {} communities in {} iterations",
            nodes.len(),
            partition.community_count(),
            iterations
        );
        Ok(partition)
    }
}

/// Heaviest label among the neighbours. The current label wins ties, otherwise the smallest one.
fn dominant_label(neighbors: &BTreeMap<usize, f64>, labels: &[usize], current: usize) -> Option<usize> {
    if neighbors.is_empty() {
        return None;
    }
    let mut tally: BTreeMap<usize, f64> = BTreeMap::new();
    for (neighbor, weight) in neighbors {
        *tally.entry(labels[*neighbor]).or_default() += weight;
    }

    let best = tally.values().copied().fold(f64::MIN, f64::max);
    if tally.get(&current).is_some_and(|weight| *weight == best) {
        return Some(current);
    }
    tally.into_iter().find(|(_, weight)| *weight == best).map(|(label, _)| label)
}

/// Renumbers raw labels 0.. in order of each community's smallest address.
fn compact_labels(nodes: &[Address], labels: &[usize]) -> BTreeMap<Address, u64> {
    let mut renumbered: BTreeMap<usize, u64> = BTreeMap::new();
    let mut result = BTreeMap::new();
    // nodes are sorted, so the first time a raw label shows up is at its smallest member
    for (address, raw) in nodes.iter().zip(labels) {
        let next = renumbered.len() as u64;
        let label = *renumbered.entry(*raw).or_insert(next);
        result.insert(*address, label);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EdgeStats;
    use alloy_primitives::U256;

    fn subgraph(edges: &[(u8, u8)]) -> BatchSubgraph {
        let mut subgraph = BatchSubgraph::new();
        for (from, to) in edges {
            subgraph.insert_edge(Address::repeat_byte(*from), Address::repeat_byte(*to), EdgeStats::new(U256::from(10), 1));
        }
        subgraph
    }

    #[test]
    fn test_empty_subgraph_gives_empty_partition() {
        let partition = LabelPropagation::new().partition(&BatchSubgraph::new()).unwrap();
        assert!(partition.is_empty());
        assert!(partition.communities().is_empty());
    }

    #[test]
    fn test_triangle_is_one_community() {
        let partition = LabelPropagation::new().partition(&subgraph(&[(1, 2), (2, 3), (1, 3)])).unwrap();
        let communities = partition.communities();

        assert_eq!(communities.len(), 1);
        assert_eq!(communities[0].len(), 3);
        assert!(partition.converged);
    }

    #[test]
    fn test_disconnected_triangles_split() {
        let partition =
            LabelPropagation::new().partition(&subgraph(&[(1, 2), (2, 3), (1, 3), (7, 8), (8, 9), (7, 9)])).unwrap();
        let communities = partition.communities();

        assert_eq!(communities.len(), 2);
        assert!(communities[0].contains(&Address::repeat_byte(1)));
        assert!(communities[1].contains(&Address::repeat_byte(9)));
    }

    #[test]
    fn test_partition_is_total_and_disjoint() {
        let graph = subgraph(&[(1, 2), (2, 3), (3, 4), (4, 5), (5, 1), (6, 6), (7, 8)]);
        let partition = LabelPropagation::new().partition(&graph).unwrap();

        assert_eq!(partition.labels.len(), graph.node_count());
        let total: usize = partition.communities().iter().map(|c| c.len()).sum();
        assert_eq!(total, graph.node_count());
        // self-loop only node stays on its own
        assert!(partition.communities().iter().any(|c| c.len() == 1 && c.contains(&Address::repeat_byte(6))));
    }

    #[test]
    fn test_same_seed_same_partition() {
        let graph = subgraph(&[(1, 2), (2, 3), (3, 4), (4, 1), (4, 5), (5, 6), (6, 7), (7, 5)]);
        let first = LabelPropagation::new().with_seed(7).partition(&graph).unwrap();
        let second = LabelPropagation::new().with_seed(7).partition(&graph).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_iteration_cap_returns_best_effort() {
        let graph = subgraph(&[(1, 2), (2, 3), (3, 4), (4, 5)]);
        let partition = LabelPropagation::new().with_max_iterations(1).partition(&graph).unwrap();
        assert_eq!(partition.iterations, 1);
        assert_eq!(partition.labels.len(), 5);
    }

    #[test]
    fn test_zero_cap_is_rejected() {
        let result = LabelPropagation::new().with_max_iterations(0).partition(&subgraph(&[(1, 2)]));
        assert!(matches!(result, Err(SybilError::Partition(_))));
    }
}

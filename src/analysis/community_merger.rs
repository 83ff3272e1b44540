use crate::graph::{BatchSubgraph, EdgeKey, EdgeStats};
use crate::utils::constants::DEFAULT_OVERLAP_FRACTION;
use alloy_primitives::Address;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct Community {
    pub id: u64,
    pub members: BTreeSet<Address>,
    pub edges: BTreeMap<EdgeKey, EdgeStats>,
    pub first_batch: u64,
    pub last_batch: u64,
}

impl Community {
    fn new(id: u64, batch: u64) -> Self {
        Self { id, members: BTreeSet::new(), edges: BTreeMap::new(), first_batch: batch, last_batch: batch }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Directed subgraph over the community's members and edges.
    pub fn subgraph(&self) -> BatchSubgraph {
        let mut subgraph = BatchSubgraph::new();
        for member in &self.members {
            subgraph.add_or_get_node(*member);
        }
        for ((sender, receiver), stats) in &self.edges {
            subgraph.insert_edge(*sender, *receiver, stats.clone());
        }
        subgraph
    }
}

/// Cross-batch union of communities. Communities are only ever created or grown.
///
/// An address may sit in several communities: a batch community that shares only a minority
/// of its members with a durable one is added as its own community and the durable one keeps
/// every member it had. Snapshots label such an address with its lowest community id, and the
/// final graph assigns it to a single cluster.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommunityGraph {
    communities: BTreeMap<u64, Community>,
    // address -> ids of every community holding it
    membership: BTreeMap<Address, BTreeSet<u64>>,
    next_id: u64,
}

impl CommunityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.communities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.communities.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&Community> {
        self.communities.get(&id)
    }

    pub fn communities(&self) -> impl Iterator<Item = &Community> {
        self.communities.values()
    }

    pub fn communities_of(&self, address: &Address) -> Option<&BTreeSet<u64>> {
        self.membership.get(address)
    }

    /// Lowest community id per address, for labelling snapshots.
    pub fn primary_labels<'a>(&self, addresses: impl IntoIterator<Item = &'a Address>) -> BTreeMap<Address, u64> {
        addresses
            .into_iter()
            .filter_map(|address| {
                let first = self.membership.get(address)?.iter().next()?;
                Some((*address, *first))
            })
            .collect()
    }

    /// Copies the communities and membership entries a merge over `addresses` can change.
    ///
    /// A merge only extends communities that already hold one of the batch addresses, so
    /// everything else is left out.
    pub fn checkpoint<'a>(&self, addresses: impl IntoIterator<Item = &'a Address>) -> CommunityCheckpoint {
        let mut ids = BTreeSet::new();
        let mut membership = Vec::new();
        for address in addresses {
            let entry = self.membership.get(address).cloned();
            if let Some(held) = &entry {
                ids.extend(held.iter().copied());
            }
            membership.push((*address, entry));
        }
        CommunityCheckpoint {
            next_id: self.next_id,
            communities: ids.iter().filter_map(|id| self.communities.get(id).cloned()).collect(),
            membership,
        }
    }

    pub fn rollback(&mut self, checkpoint: CommunityCheckpoint) {
        self.communities.retain(|id, _| *id < checkpoint.next_id);
        for community in checkpoint.communities {
            self.communities.insert(community.id, community);
        }
        for (address, entry) in checkpoint.membership {
            match entry {
                Some(ids) => self.membership.insert(address, ids),
                None => self.membership.remove(&address),
            };
        }
        self.next_id = checkpoint.next_id;
    }

    fn add_members(&mut self, id: u64, members: &BTreeSet<Address>) {
        if let Some(community) = self.communities.get_mut(&id) {
            community.members.extend(members.iter().copied());
        }
        for member in members {
            self.membership.entry(*member).or_default().insert(id);
        }
    }
}

/// Prior state of the part of a [`CommunityGraph`] one batch may change.
#[derive(Debug, Clone)]
pub struct CommunityCheckpoint {
    next_id: u64,
    communities: Vec<Community>,
    membership: Vec<(Address, Option<BTreeSet<u64>>)>,
}

/// Ids touched by one merge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    pub created: BTreeSet<u64>,
    pub extended: BTreeSet<u64>,
}

impl MergeOutcome {
    pub fn touched(&self) -> BTreeSet<u64> {
        self.created.union(&self.extended).copied().collect()
    }
}

/// Folds a batch's communities into the durable community graph.
///
/// Every batch community is matched against the graph as it stood before the batch, so the
/// result does not depend on the order the batch communities are presented in.
#[derive(Debug, Clone)]
pub struct CommunityMerger {
    overlap_fraction: f64,
}

impl Default for CommunityMerger {
    fn default() -> Self {
        Self { overlap_fraction: DEFAULT_OVERLAP_FRACTION }
    }
}

impl CommunityMerger {
    pub fn new(overlap_fraction: f64) -> Self {
        Self { overlap_fraction }
    }

    pub fn merge(
        &self,
        graph: &mut CommunityGraph,
        batch_communities: &[BTreeSet<Address>],
        subgraph: &BatchSubgraph,
        batch_number: u64,
    ) -> MergeOutcome {
        let mut matched: BTreeMap<u64, BTreeSet<Address>> = BTreeMap::new();
        let mut unmatched: Vec<&BTreeSet<Address>> = Vec::new();

        for community in batch_communities.iter().filter(|c| !c.is_empty()) {
            match self.find_match(graph, community) {
                Some(id) => matched.entry(id).or_default().extend(community.iter().copied()),
                None => unmatched.push(community),
            }
        }

        let mut outcome = MergeOutcome::default();
        for (id, members) in &matched {
            graph.add_members(*id, members);
            if let Some(community) = graph.communities.get_mut(id) {
                community.last_batch = batch_number;
            }
            outcome.extended.insert(*id);
        }

        // batch communities are disjoint, so ordering by smallest member is total
        unmatched.sort_by_key(|community| community.iter().next().copied());
        for members in unmatched {
            let id = graph.next_id;
            graph.next_id += 1;
            graph.communities.insert(id, Community::new(id, batch_number));
            graph.add_members(id, members);
            outcome.created.insert(id);
        }

        // Edges are attached once membership is final. Stats come from the global graph,
        // so an overwrite always carries the newest aggregate.
        for id in outcome.touched() {
            if let Some(community) = graph.communities.get_mut(&id) {
                for (sender, receiver, stats) in subgraph.edges() {
                    if community.members.contains(&sender) && community.members.contains(&receiver) {
                        community.edges.insert((sender, receiver), stats.clone());
                    }
                }
            }
        }

        debug!(
            "Merged {} batch communities: {} extended, {} created, {} total",
            batch_communities.len(),
            outcome.extended.len(),
            outcome.created.len(),
            graph.len()
        );
        outcome
    }

    /// The durable community holding the largest share of `members`, if that share passes the threshold.
    fn find_match(&self, graph: &CommunityGraph, members: &BTreeSet<Address>) -> Option<u64> {
        let mut overlap: BTreeMap<u64, usize> = BTreeMap::new();
        for member in members {
            for id in graph.membership.get(member).into_iter().flatten() {
                *overlap.entry(*id).or_default() += 1;
            }
        }

        // equal overlaps resolve to the lowest id
        let (id, shared) = overlap.into_iter().max_by(|(id_a, a), (id_b, b)| a.cmp(b).then(id_b.cmp(id_a)))?;
        let fraction = shared as f64 / members.len() as f64;
        (fraction > self.overlap_fraction).then_some(id)
    }
}

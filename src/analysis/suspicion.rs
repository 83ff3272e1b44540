use super::community_merger::{Community, CommunityGraph};
use crate::graph::BatchSubgraph;
use crate::utils::constants::{DEFAULT_BURST_WINDOW_SECS, DEFAULT_MIN_CLUSTER_SIZE, DEFAULT_SUSPICION_THRESHOLD};
use crate::utils::{finite_or_zero, safe_ratio};
use alloy_primitives::Address;
use petgraph::algo::connected_components;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};
use tracing::debug;

/// Relative weight of each heuristic in the combined score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalWeights {
    pub cyclic: f64,
    pub shared_funding: f64,
    pub degree_uniformity: f64,
    pub amount_uniformity: f64,
    pub burstiness: f64,
    pub flow_symmetry: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            cyclic: 1.0,
            shared_funding: 1.0,
            degree_uniformity: 1.0,
            amount_uniformity: 1.0,
            burstiness: 1.0,
            flow_symmetry: 1.0,
        }
    }
}

impl SignalWeights {
    pub fn weight(&self, class: SuspicionClass) -> f64 {
        match class {
            SuspicionClass::CyclicTransfers => self.cyclic,
            SuspicionClass::SharedFunding => self.shared_funding,
            SuspicionClass::UniformActivity => self.degree_uniformity,
            SuspicionClass::UniformAmounts => self.amount_uniformity,
            SuspicionClass::BurstCreation => self.burstiness,
            SuspicionClass::BalancedFlow => self.flow_symmetry,
        }
    }

    pub fn total(&self) -> f64 {
        SuspicionClass::iter().map(|class| self.weight(class)).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SuspicionConfig {
    pub threshold: f64,
    pub min_cluster_size: usize,
    pub burst_window_secs: u64,
    pub weights: SignalWeights,
}

impl Default for SuspicionConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SUSPICION_THRESHOLD,
            min_cluster_size: DEFAULT_MIN_CLUSTER_SIZE,
            burst_window_secs: DEFAULT_BURST_WINDOW_SECS,
            weights: SignalWeights::default(),
        }
    }
}

/// Dominant pattern behind a score. Each class is named after the signal that produces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString, EnumIter, Serialize, Deserialize)]
pub enum SuspicionClass {
    CyclicTransfers,
    SharedFunding,
    UniformActivity,
    UniformAmounts,
    BurstCreation,
    /// Members pass value on about as widely as they receive it
    BalancedFlow,
}

/// Individual heuristic values, each in `[0, 1]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SuspicionSignals {
    /// Independent cycles relative to the most a graph of this size can hold
    pub cyclic: f64,
    /// Share of the community funded directly by its busiest sender
    pub shared_funding: f64,
    pub degree_uniformity: f64,
    pub amount_uniformity: f64,
    /// Share of edges that appeared within the burst window of the first one
    pub burstiness: f64,
    /// Mean over members of `1 - |in - out| / (in + out)`, counting distinct counterparties
    pub flow_symmetry: f64,
}

impl SuspicionSignals {
    pub fn value(&self, class: SuspicionClass) -> f64 {
        match class {
            SuspicionClass::CyclicTransfers => self.cyclic,
            SuspicionClass::SharedFunding => self.shared_funding,
            SuspicionClass::UniformActivity => self.degree_uniformity,
            SuspicionClass::UniformAmounts => self.amount_uniformity,
            SuspicionClass::BurstCreation => self.burstiness,
            SuspicionClass::BalancedFlow => self.flow_symmetry,
        }
    }

    fn weighted(&self, weights: &SignalWeights) -> Vec<(SuspicionClass, f64)> {
        SuspicionClass::iter().map(|class| (class, self.value(class) * weights.weight(class))).collect()
    }
}

/// A community whose score passed the threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterCandidate {
    pub community_id: u64,
    pub members: BTreeSet<Address>,
    pub score: f64,
    pub classification: SuspicionClass,
    pub signals: SuspicionSignals,
    pub first_seen: u64,
    pub last_seen: u64,
}

impl ClusterCandidate {
    pub fn evidence(&self) -> String {
        format!(
            "{} score={:.3} cyclic={:.2} shared_funding={:.2} degree_uniformity={:.2} amount_uniformity={:.2} burstiness={:.2} flow_symmetry={:.2}",
            self.classification,
            self.score,
            self.signals.cyclic,
            self.signals.shared_funding,
            self.signals.degree_uniformity,
            self.signals.amount_uniformity,
            self.signals.burstiness,
            self.signals.flow_symmetry
        )
    }
}

/// Scores communities. Holds no state beyond its configuration.
#[derive(Debug, Clone, Default)]
pub struct SuspicionAnalyzer {
    config: SuspicionConfig,
}

impl SuspicionAnalyzer {
    pub fn new(config: SuspicionConfig) -> Self {
        Self { config }
    }

    /// Scores the given communities and returns the candidates, in community id order.
    pub fn analyze_communities(&self, graph: &CommunityGraph, ids: &BTreeSet<u64>) -> Vec<ClusterCandidate> {
        let candidates: Vec<_> = ids.iter().filter_map(|id| graph.get(*id)).filter_map(|c| self.analyze(c)).collect();
        debug!("{} of {} communities scored above {}", candidates.len(), ids.len(), self.config.threshold);
        candidates
    }

    pub fn analyze(&self, community: &Community) -> Option<ClusterCandidate> {
        if community.len() < self.config.min_cluster_size {
            return None;
        }

        let subgraph = community.subgraph();
        let signals = compute_signals(&subgraph, self.config.burst_window_secs);
        let (score, classification) = self.combine(&signals);
        if score <= self.config.threshold {
            return None;
        }

        let first_seen = community.edges.values().map(|s| s.first_seen).min().unwrap_or_default();
        let last_seen = community.edges.values().map(|s| s.last_seen).max().unwrap_or_default();

        Some(ClusterCandidate {
            community_id: community.id,
            members: community.members.clone(),
            score,
            classification,
            signals,
            first_seen,
            last_seen,
        })
    }

    fn combine(&self, signals: &SuspicionSignals) -> (f64, SuspicionClass) {
        let weights = &self.config.weights;
        let weighted = signals.weighted(weights);
        let score = safe_ratio(weighted.iter().map(|(_, v)| v).sum(), weights.total()).clamp(0.0, 1.0);

        // first of the largest contributions, in declaration order
        let mut classification = (SuspicionClass::CyclicTransfers, f64::MIN);
        for entry in &weighted {
            if entry.1 > classification.1 {
                classification = *entry;
            }
        }
        (score, classification.0)
    }
}

pub fn compute_signals(subgraph: &BatchSubgraph, burst_window_secs: u64) -> SuspicionSignals {
    let n = subgraph.node_count();
    if n == 0 {
        return SuspicionSignals::default();
    }

    let mut pairs: BTreeSet<(Address, Address)> = BTreeSet::new();
    let mut neighbors: BTreeMap<Address, BTreeSet<Address>> = subgraph.addresses().into_iter().map(|a| (a, BTreeSet::new())).collect();
    let mut out_targets: BTreeMap<Address, BTreeSet<Address>> = BTreeMap::new();
    let mut in_sources: BTreeMap<Address, BTreeSet<Address>> = BTreeMap::new();
    for (sender, receiver, _) in subgraph.edges() {
        if sender == receiver {
            continue;
        }
        pairs.insert((sender.min(receiver), sender.max(receiver)));
        neighbors.entry(sender).or_default().insert(receiver);
        neighbors.entry(receiver).or_default().insert(sender);
        out_targets.entry(sender).or_default().insert(receiver);
        in_sources.entry(receiver).or_default().insert(sender);
    }

    let nf = n as f64;
    let components = connected_components(&subgraph.graph) as f64;
    let cycle_rank = pairs.len() as f64 - nf + components;
    let max_cycle_rank = (nf * (nf - 1.0) / 2.0 - nf + 1.0).max(1.0);
    let cyclic = safe_ratio(cycle_rank, max_cycle_rank).clamp(0.0, 1.0);

    let busiest_sender = out_targets.values().map(|targets| targets.len()).max().unwrap_or_default();
    let shared_funding = if n < 2 { 0.0 } else { safe_ratio(busiest_sender as f64, nf - 1.0).clamp(0.0, 1.0) };

    let degrees: Vec<f64> = neighbors.values().map(|set| set.len() as f64).collect();
    let degree_uniformity = uniformity(&degrees);

    let means: Vec<f64> = subgraph.edges().map(|(_, _, stats)| stats.mean()).collect();
    let amount_uniformity = uniformity(&means);

    let first_seen: Vec<u64> = subgraph.edges().map(|(_, _, stats)| stats.first_seen).collect();
    let burstiness = match first_seen.iter().min() {
        Some(start) => {
            let cutoff = start.saturating_add(burst_window_secs);
            safe_ratio(first_seen.iter().filter(|t| **t <= cutoff).count() as f64, first_seen.len() as f64)
        }
        None => 0.0,
    };

    let balance: f64 = neighbors
        .keys()
        .map(|address| {
            let fan_in = in_sources.get(address).map_or(0, BTreeSet::len) as f64;
            let fan_out = out_targets.get(address).map_or(0, BTreeSet::len) as f64;
            // members with no counterparties count as unbalanced
            if fan_in + fan_out == 0.0 { 0.0 } else { 1.0 - (fan_in - fan_out).abs() / (fan_in + fan_out) }
        })
        .sum();
    let flow_symmetry = safe_ratio(balance, nf).clamp(0.0, 1.0);

    SuspicionSignals { cyclic, shared_funding, degree_uniformity, amount_uniformity, burstiness, flow_symmetry }
}

/// `1 / (1 + cv)` of the values; zero for empty or all-zero input.
fn uniformity(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let count = values.len() as f64;
    let mean = values.iter().sum::<f64>() / count;
    if mean <= 0.0 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count;
    let cv = finite_or_zero(variance.sqrt() / mean);
    finite_or_zero(1.0 / (1.0 + cv))
}

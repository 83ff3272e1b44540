use super::admission::{AcceptAll, AdmissionDecision, AdmissionGate};
use super::batch_trigger::BatchTrigger;
use super::config::DetectorConfig;
use super::session::{SessionCheckpoint, SessionState};
use crate::analysis::{
    CommunityMerger, FinalGraph, FinalGraphMerger, LabelPropagation, PriorFinalGraph, SuspicionAnalyzer,
};
use crate::error::{Result, SybilError};
use crate::graph::{SnapshotStore, StagedSnapshot};
use crate::store::{BatchCommit, PersistenceStore, SuspiciousClusterRow};
use crate::types::{ContractTransaction, Finding, TransactionEvent, TransactionKind, Transfer};
use crate::utils::constants::{FINAL_GRAPH_FILE, GLOBAL_GRAPH_FILE, MERGED_SUBGRAPH_FILE};
use alloy_primitives::Address;
use std::collections::BTreeSet;
use std::sync::Arc;
use strum_macros::Display;
use tracing::{debug, error, info, warn};

/// Where the batch pipeline currently is. `Idle` between batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BatchStage {
    Idle,
    Building,
    Partitioning,
    Merging,
    Scoring,
    FinalMerging,
    Persisting,
    Evicting,
}

/// Result of the stages that must all succeed before anything is committed.
struct BatchOutput {
    final_graph: FinalGraph,
    findings: Vec<Finding>,
    newest_transfer: Option<u64>,
    newest_contract_transaction: Option<u64>,
}

/// Incremental Sybil-cluster detector.
///
/// Events are admitted, persisted and counted one at a time. Every `batch_threshold`
/// admitted events the detector runs the batch pipeline:
/// 1. fold unprocessed transfers into the global graph
/// 2. partition the subgraph of touched edges
/// 3. merge the batch communities into the durable community graph
/// 4. score the touched communities
/// 5. fold qualifying clusters into the final graph
/// 6. write snapshots and commit the batch to the store
/// 7. evict old processed rows
///
/// Steps 1 to 6 update the session graphs in place behind a checkpoint. Any failure there
/// rolls the checkpoint back and leaves the counter, the graphs and the store exactly as
/// they were.
pub struct SybilDetector<S: PersistenceStore> {
    config: DetectorConfig,
    store: Arc<S>,
    gate: Arc<dyn AdmissionGate>,
    snapshots: SnapshotStore,
    trigger: BatchTrigger,
    state: SessionState,
    stage: BatchStage,
    partitioner: LabelPropagation,
    community_merger: CommunityMerger,
    analyzer: SuspicionAnalyzer,
    final_merger: FinalGraphMerger,
}

impl<S: PersistenceStore> SybilDetector<S> {
    pub fn new(config: DetectorConfig, store: Arc<S>, gate: Arc<dyn AdmissionGate>) -> Self {
        Self {
            snapshots: SnapshotStore::new(config.artifacts_dir.clone()),
            trigger: BatchTrigger::new(config.batch_threshold),
            state: SessionState::new(),
            stage: BatchStage::Idle,
            partitioner: config.partitioner(),
            community_merger: config.community_merger(),
            analyzer: SuspicionAnalyzer::new(config.suspicion()),
            final_merger: FinalGraphMerger::new(),
            config,
            store,
            gate,
        }
    }

    /// Handles one event. Returns the findings of the batch it completed, if any.
    ///
    /// A rejected event or one whose row cannot be written is dropped and not counted.
    /// Structural batch failures are returned as errors and the batch is retried on the
    /// next admitted event.
    pub async fn handle_event(&mut self, event: TransactionEvent) -> Result<Vec<Finding>> {
        if let AdmissionDecision::Reject(reason) = self.gate.admit(&event).await {
            debug!("Event {} rejected: {}", event.hash, reason);
            return Ok(Vec::new());
        }

        match self.persist_event(&event).await {
            Ok(()) => self.trigger.increment(),
            Err(e) if !e.is_structural() => {
                warn!("Dropping event {} after failed insert: {}", event.hash, e);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        }

        if !self.trigger.should_flush() {
            return Ok(Vec::new());
        }
        self.flush().await
    }

    /// Runs the batch pipeline now, regardless of the counter.
    pub async fn flush(&mut self) -> Result<Vec<Finding>> {
        let batch_number = self.state.batch_number + 1;
        info!("Processing batch {} after {} events", batch_number, self.trigger.count());

        let mut checkpoint = None;
        let output = match self.run_batch(batch_number, &mut checkpoint).await {
            Ok(output) => output,
            Err(e) => {
                error!("Batch {} aborted during {}: {}", batch_number, self.stage, e);
                if let Some(checkpoint) = checkpoint {
                    self.state.rollback(checkpoint);
                }
                self.stage = BatchStage::Idle;
                return Err(e);
            }
        };

        self.state.final_graph = output.final_graph;
        self.state.batch_number = batch_number;
        self.enter(BatchStage::Evicting);
        self.evict(TransactionKind::Transfer, output.newest_transfer, self.config.transfer_retention_secs).await;
        self.evict(
            TransactionKind::ContractTransaction,
            output.newest_contract_transaction,
            self.config.contract_tx_retention_secs,
        )
        .await;
        self.trigger.reset();
        self.stage = BatchStage::Idle;

        info!(
            "Batch {} complete: {} findings, {} active clusters",
            batch_number,
            output.findings.len(),
            self.state.final_graph.active_clusters().count()
        );
        Ok(output.findings)
    }

    async fn persist_event(&self, event: &TransactionEvent) -> Result<()> {
        if let Some(row) = ContractTransaction::from_event(event) {
            self.store.insert_contract_transaction(row).await.map_err(|e| SybilError::PersistenceRow(e.to_string()))?;
            if event.amount.is_zero() {
                return Ok(());
            }
        }
        self.store
            .insert_transfer(Transfer::from_event(event))
            .await
            .map_err(|e| SybilError::PersistenceRow(e.to_string()))?;
        Ok(())
    }

    async fn run_batch(&mut self, batch_number: u64, checkpoint: &mut Option<SessionCheckpoint>) -> Result<BatchOutput> {
        self.enter(BatchStage::Building);
        let transfers = self.store.query_unprocessed_transfers().await?;
        let contract_transactions = self.store.query_unprocessed_contract_transactions().await?;
        let checkpoint = checkpoint.insert(self.state.checkpoint(&transfers));
        let touched_edges = self.state.global_graph.fold_transfers(&transfers);
        let subgraph = self.state.global_graph.edge_subgraph(&touched_edges);
        debug!(
            "Folded {} transfers into {} edges, global graph has {} nodes and {} edges",
            transfers.len(),
            touched_edges.len(),
            self.state.global_graph.node_count(),
            self.state.global_graph.edge_count()
        );

        self.enter(BatchStage::Partitioning);
        let partition = self.partitioner.partition(&subgraph)?;
        let batch_communities = partition.communities();

        self.enter(BatchStage::Merging);
        let merge_outcome = self.community_merger.merge(&mut self.state.communities, &batch_communities, &subgraph, batch_number);

        self.enter(BatchStage::Scoring);
        let candidates = self.analyzer.analyze_communities(&self.state.communities, &merge_outcome.touched());

        self.enter(BatchStage::FinalMerging);
        let prior = match self.store.committed_batches().await? {
            0 => PriorFinalGraph::FirstBatch,
            _ => PriorFinalGraph::Persisted,
        };
        let mut final_graph = self.final_merger.load(&self.snapshots, prior).await?;
        if let Some(max_id) = self.store.max_cluster_id().await? {
            final_graph.reserve_ids_through(max_id);
        }
        let first_new_cluster = final_graph.next_id();
        let final_outcome = self.final_merger.merge(&mut final_graph, &candidates, &self.state.communities);
        let touched_clusters = final_outcome.touched();
        for id in &touched_clusters {
            if let Some(cluster) = final_graph.cluster(*id) {
                checkpoint.graph.record_clusters(&self.state.global_graph, &cluster.members);
                for member in &cluster.members {
                    self.state.global_graph.set_cluster(*member, *id);
                }
            }
        }

        self.enter(BatchStage::Persisting);
        let addresses = subgraph.addresses();
        let merged_labels = self.state.communities.primary_labels(&addresses);
        let snapshots = [
            (GLOBAL_GRAPH_FILE, self.state.global_graph.to_snapshot()),
            (MERGED_SUBGRAPH_FILE, subgraph.to_snapshot_with_labels(&merged_labels)),
            (FINAL_GRAPH_FILE, final_graph.to_snapshot()),
        ];
        let mut staged: Vec<StagedSnapshot> = Vec::with_capacity(snapshots.len());
        for (name, snapshot) in &snapshots {
            match self.snapshots.stage(name, snapshot).await {
                Ok(item) => staged.push(item),
                Err(e) => {
                    self.snapshots.discard(staged).await;
                    return Err(e);
                }
            }
        }

        let commit =
            build_commit(&transfers, &contract_transactions, &addresses, &final_graph, &touched_clusters, first_new_cluster)?;
        let promotion = self.snapshots.promote(staged).await?;
        if let Err(e) = self.store.commit_batch(commit).await {
            if let Err(rollback_error) = promotion.rollback().await {
                error!("Failed to restore previous snapshots after failed commit: {}", rollback_error);
                return Err(SybilError::SnapshotRollback { commit: e.to_string(), rollback: rollback_error.to_string() });
            }
            return Err(e);
        }
        promotion.finish().await;

        let findings = final_graph.findings(&touched_clusters);

        Ok(BatchOutput {
            final_graph,
            findings,
            newest_transfer: transfers.iter().map(|t| t.timestamp).max(),
            newest_contract_transaction: contract_transactions.iter().map(|t| t.timestamp).max(),
        })
    }

    async fn evict(&self, kind: TransactionKind, newest: Option<u64>, retention_secs: u64) {
        let Some(newest) = newest else {
            return;
        };
        let cutoff = newest.saturating_sub(retention_secs);
        match self.store.evict_older_than(cutoff, kind).await {
            Ok(removed) => debug!("Evicted {} {} rows older than {}", removed, kind, cutoff),
            Err(e) => warn!("Eviction of {} rows failed, will retry after the next batch: {}", kind, e),
        }
    }

    fn enter(&mut self, stage: BatchStage) {
        debug!("Batch stage {} -> {}", self.stage, stage);
        self.stage = stage;
    }

    pub fn stage(&self) -> BatchStage {
        self.stage
    }

    pub fn pending_events(&self) -> u64 {
        self.trigger.count()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn final_graph(&self) -> &FinalGraph {
        &self.state.final_graph
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn get_statistics(&self) -> DetectorStats {
        DetectorStats {
            batches_processed: self.state.batch_number,
            pending_events: self.trigger.count(),
            batch_threshold: self.trigger.threshold(),
            global_nodes: self.state.global_graph.node_count(),
            global_edges: self.state.global_graph.edge_count(),
            communities: self.state.communities.len(),
            active_clusters: self.state.final_graph.active_clusters().count(),
        }
    }
}

fn build_commit(
    transfers: &[Transfer],
    contract_transactions: &[ContractTransaction],
    addresses: &BTreeSet<Address>,
    final_graph: &FinalGraph,
    touched_clusters: &BTreeSet<u64>,
    first_new_cluster: u64,
) -> Result<BatchCommit> {
    let mut eoa_addresses = addresses.clone();
    for id in touched_clusters {
        if let Some(cluster) = final_graph.cluster(*id) {
            eoa_addresses.extend(cluster.members.iter().copied());
        }
    }

    // touched clusters plus anything they absorbed this batch
    let clusters = final_graph
        .clusters()
        .values()
        .filter(|cluster| {
            touched_clusters.contains(&cluster.id) || cluster.merged_into.is_some_and(|id| touched_clusters.contains(&id))
        })
        .map(SuspiciousClusterRow::from_cluster)
        .collect::<Result<Vec<_>>>()?;
    let new_cluster_ids = clusters.iter().map(|row| row.id).filter(|id| *id >= first_new_cluster).collect();

    Ok(BatchCommit {
        transfer_ids: transfers.iter().map(|t| t.id).collect(),
        contract_transaction_ids: contract_transactions.iter().map(|t| t.id).collect(),
        eoas: eoa_addresses.into_iter().map(|address| (address, final_graph.cluster_of(&address))).collect(),
        clusters,
        new_cluster_ids,
    })
}

/// Statistics about the detector's current state
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorStats {
    pub batches_processed: u64,
    pub pending_events: u64,
    pub batch_threshold: u64,
    pub global_nodes: usize,
    pub global_edges: usize,
    pub communities: usize,
    pub active_clusters: usize,
}

/// Builder for SybilDetector
pub struct SybilDetectorBuilder<S: PersistenceStore> {
    store: Arc<S>,
    config: Option<DetectorConfig>,
    gate: Option<Arc<dyn AdmissionGate>>,
}

impl<S: PersistenceStore> SybilDetectorBuilder<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store, config: None, gate: None }
    }

    pub fn with_config(mut self, config: DetectorConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_gate(mut self, gate: Arc<dyn AdmissionGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Builds the detector, continuing batch numbering from the store.
    pub async fn build(self) -> Result<SybilDetector<S>> {
        let config = match self.config {
            Some(config) => config,
            None => DetectorConfig::from_env()?,
        };
        config.validate()?;

        let committed = self.store.committed_batches().await?;
        let gate = self.gate.unwrap_or_else(|| Arc::new(AcceptAll) as Arc<dyn AdmissionGate>);
        let mut detector = SybilDetector::new(config, self.store, gate);
        if committed > 0 {
            info!("Resuming after {} committed batches", committed);
            detector.state = SessionState::resume_at(committed);
            detector.state.final_graph =
                detector.final_merger.load(&detector.snapshots, PriorFinalGraph::Persisted).await?;
        }
        Ok(detector)
    }
}

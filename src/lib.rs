// Raw log and durable tables
pub mod store;
// Global transaction graph, snapshots and their attribute encoding
pub mod graph;
// Per-batch stages: partition, merge, score, accumulate
pub mod analysis;
// Event handling and batch orchestration
pub mod engine;

pub mod error;
pub mod types;
pub mod utils;

pub use analysis::{
    ClusterCandidate, Community, CommunityGraph, CommunityMerger, FinalGraph, FinalGraphMerger, LabelPropagation,
    Partition, SuspicionAnalyzer, SuspicionClass, SuspicionConfig, SuspiciousCluster,
};
pub use engine::{
    AcceptAll, AdmissionDecision, AdmissionGate, BatchStage, DetectorConfig, DetectorStats, SybilDetector,
    SybilDetectorBuilder,
};
pub use error::{Result, SybilError};
pub use graph::{BatchSubgraph, EdgeStats, GraphSnapshot, SnapshotStore, TransactionGraph};
pub use store::{InMemoryStore, PersistenceStore};
pub use types::{ContractTransaction, Finding, MethodCall, Severity, TransactionEvent, TransactionKind, Transfer};

/// Events accumulated before a flush runs
pub const DEFAULT_BATCH_THRESHOLD: u64 = 100;

/// One day of processed transfers is kept in the raw log
pub const DEFAULT_TRANSFER_RETENTION_SECS: u64 = 86_400;
pub const DEFAULT_CONTRACT_TX_RETENTION_SECS: u64 = 86_400;

pub const DEFAULT_SUSPICION_THRESHOLD: f64 = 0.6;
pub const DEFAULT_MIN_CLUSTER_SIZE: usize = 3;
/// Share of a batch community that must already sit in a durable community to match it
pub const DEFAULT_OVERLAP_FRACTION: f64 = 0.5;

pub const DEFAULT_PARTITION_SEED: u64 = 42;
pub const DEFAULT_MAX_PARTITION_ITERATIONS: usize = 100;
pub const DEFAULT_BURST_WINDOW_SECS: u64 = 3_600;

pub const DEFAULT_ARTIFACTS_DIR: &str = "graphs";

// Snapshot artifact names inside the artifacts directory
pub const GLOBAL_GRAPH_FILE: &str = "global_graph.json";
pub const MERGED_SUBGRAPH_FILE: &str = "merged_subgraph.json";
pub const FINAL_GRAPH_FILE: &str = "final_graph.json";

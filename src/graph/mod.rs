pub mod attributes;
pub mod edge_stats;
pub mod snapshot;
pub mod transaction_graph;

pub use attributes::{AttrKind, AttrMap, AttrValue, Scalar};
pub use edge_stats::EdgeStats;
pub use snapshot::{GraphSnapshot, Promotion, SnapshotEdge, SnapshotNode, SnapshotStore, StagedSnapshot};
pub use transaction_graph::{BatchSubgraph, EdgeKey, EoaNode, FastHashMap, GraphCheckpoint, TransactionGraph};

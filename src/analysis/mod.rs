/// Analysis stages run once per batch, in order:
///
/// - `partitioner`: community detection over the batch subgraph
/// - `community_merger`: folds batch communities into the durable community graph
/// - `suspicion`: scores the communities the batch touched
/// - `final_graph`: accumulates confirmed clusters across batches
pub mod community_merger;
pub mod final_graph;
pub mod partitioner;
pub mod suspicion;

pub use community_merger::{Community, CommunityCheckpoint, CommunityGraph, CommunityMerger, MergeOutcome};
pub use final_graph::{ClusterEdge, FinalGraph, FinalGraphMerger, FinalMergeOutcome, PriorFinalGraph, SuspiciousCluster};
pub use partitioner::{LabelPropagation, Partition};
pub use suspicion::{ClusterCandidate, SignalWeights, SuspicionAnalyzer, SuspicionClass, SuspicionConfig, SuspicionSignals};

/// Event handling and batch orchestration.
pub mod admission;
pub mod batch_trigger;
pub mod config;
pub mod detector;
pub mod session;


pub use admission::{AcceptAll, AdmissionDecision, AdmissionGate, SkipTrivialTransfers};
pub use batch_trigger::BatchTrigger;
pub use config::DetectorConfig;
pub use detector::{BatchStage, DetectorStats, SybilDetector, SybilDetectorBuilder};
pub use session::{SessionCheckpoint, SessionState};

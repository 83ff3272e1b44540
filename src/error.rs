use crate::utils::config_loader::LoadConfigError;
use eyre::Report;

pub type Result<T, E = SybilError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum SybilError {
    // Row level, contained by the caller
    #[error("failed to persist row: {0}")]
    PersistenceRow(String),

    // Structural, abort the batch
    #[error("failed to load graph artifact {path}: {reason}")]
    GraphLoad { path: String, reason: String },
    #[error("attribute `{key}` cannot be converted to a portable scalar: {reason}")]
    Serialization { key: String, reason: String },
    #[error("partition failed: {0}")]
    Partition(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("batch commit failed ({commit}) and restoring the previous snapshots failed ({rollback})")]
    SnapshotRollback { commit: String, rollback: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] LoadConfigError),
    #[error(transparent)]
    InternalEyre(Report),
}

impl SybilError {
    /// Structural failures abort the whole batch. Row failures do not.
    pub fn is_structural(&self) -> bool {
        !matches!(self, Self::PersistenceRow(_))
    }
}

impl From<Report> for SybilError {
    fn from(error: Report) -> Self {
        Self::InternalEyre(error)
    }
}

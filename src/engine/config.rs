use crate::analysis::{CommunityMerger, LabelPropagation, SignalWeights, SuspicionConfig};
use crate::utils::config_loader::{ConfigSectionLoader, LoadConfigError, extract_section, load_from_file, load_from_file_sync};
use crate::utils::constants::*;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the detection engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Admitted events per batch
    pub batch_threshold: u64,
    /// How long processed transfers are kept, in seconds
    pub transfer_retention_secs: u64,
    /// How long processed contract transactions are kept, in seconds
    pub contract_tx_retention_secs: u64,
    /// Minimum score for a community to become a cluster
    pub suspicion_threshold: f64,
    pub min_cluster_size: usize,
    /// Share of a batch community that must already belong to a durable one for them to merge
    pub overlap_fraction: f64,
    pub partition_seed: u64,
    pub max_partition_iterations: usize,
    pub burst_window_secs: u64,
    pub signal_weights: SignalWeights,
    /// Directory receiving the graph snapshots
    pub artifacts_dir: PathBuf,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            batch_threshold: DEFAULT_BATCH_THRESHOLD,
            transfer_retention_secs: DEFAULT_TRANSFER_RETENTION_SECS,
            contract_tx_retention_secs: DEFAULT_CONTRACT_TX_RETENTION_SECS,
            suspicion_threshold: DEFAULT_SUSPICION_THRESHOLD,
            min_cluster_size: DEFAULT_MIN_CLUSTER_SIZE,
            overlap_fraction: DEFAULT_OVERLAP_FRACTION,
            partition_seed: DEFAULT_PARTITION_SEED,
            max_partition_iterations: DEFAULT_MAX_PARTITION_ITERATIONS,
            burst_window_secs: DEFAULT_BURST_WINDOW_SECS,
            signal_weights: SignalWeights::default(),
            artifacts_dir: PathBuf::from(DEFAULT_ARTIFACTS_DIR),
        }
    }
}

fn parse_env<T>(name: &str) -> eyre::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw.parse().map(Some).map_err(|e| eyre::eyre!("Invalid {}: {}", name, e)),
        Err(_) => Ok(None),
    }
}

impl DetectorConfig {
    /// Load configuration from `SYBIL_*` environment variables on top of the defaults
    pub fn from_env() -> eyre::Result<Self> {
        let mut config = Self::default();

        if let Some(value) = parse_env("SYBIL_BATCH_THRESHOLD")? {
            config.batch_threshold = value;
        }
        if let Some(value) = parse_env("SYBIL_TRANSFER_RETENTION_SECS")? {
            config.transfer_retention_secs = value;
        }
        if let Some(value) = parse_env("SYBIL_CONTRACT_TX_RETENTION_SECS")? {
            config.contract_tx_retention_secs = value;
        }
        if let Some(value) = parse_env("SYBIL_SUSPICION_THRESHOLD")? {
            config.suspicion_threshold = value;
        }
        if let Some(value) = parse_env("SYBIL_MIN_CLUSTER_SIZE")? {
            config.min_cluster_size = value;
        }
        if let Some(value) = parse_env("SYBIL_OVERLAP_FRACTION")? {
            config.overlap_fraction = value;
        }
        if let Some(value) = parse_env("SYBIL_PARTITION_SEED")? {
            config.partition_seed = value;
        }
        if let Some(value) = parse_env("SYBIL_MAX_PARTITION_ITERATIONS")? {
            config.max_partition_iterations = value;
        }
        if let Some(value) = parse_env("SYBIL_BURST_WINDOW_SECS")? {
            config.burst_window_secs = value;
        }
        if let Ok(dir) = std::env::var("SYBIL_ARTIFACTS_DIR") {
            config.artifacts_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> eyre::Result<()> {
        if self.batch_threshold == 0 {
            return Err(eyre::eyre!("batch_threshold must be at least 1"));
        }
        if self.max_partition_iterations == 0 {
            return Err(eyre::eyre!("max_partition_iterations must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.overlap_fraction) {
            return Err(eyre::eyre!("overlap_fraction must be in [0, 1), got {}", self.overlap_fraction));
        }
        Ok(())
    }

    pub fn transfer_retention(&self) -> Duration {
        Duration::from_secs(self.transfer_retention_secs)
    }

    pub fn contract_tx_retention(&self) -> Duration {
        Duration::from_secs(self.contract_tx_retention_secs)
    }

    pub fn suspicion(&self) -> SuspicionConfig {
        SuspicionConfig {
            threshold: self.suspicion_threshold,
            min_cluster_size: self.min_cluster_size,
            burst_window_secs: self.burst_window_secs,
            weights: self.signal_weights.clone(),
        }
    }

    pub fn partitioner(&self) -> LabelPropagation {
        LabelPropagation::new().with_seed(self.partition_seed).with_max_iterations(self.max_partition_iterations)
    }

    pub fn community_merger(&self) -> CommunityMerger {
        CommunityMerger::new(self.overlap_fraction)
    }
}

#[async_trait]
impl ConfigSectionLoader for DetectorConfig {
    const SECTION: &'static str = "detector";

    async fn load_section_from_file(file_name: &Path) -> Result<Self, LoadConfigError> {
        let document: toml::Table = load_from_file(file_name).await?;
        extract_section(document, Self::SECTION)
    }

    fn load_section_from_file_sync(file_name: &Path) -> Result<Self, LoadConfigError> {
        let document: toml::Table = load_from_file_sync(file_name)?;
        extract_section(document, Self::SECTION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = DetectorConfig::default();
        assert_eq!(config.batch_threshold, 100);
        assert_eq!(config.min_cluster_size, 3);
        assert_eq!(config.overlap_fraction, 0.5);
        assert_eq!(config.artifacts_dir, PathBuf::from("graphs"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_durations() {
        let config = DetectorConfig { transfer_retention_secs: 60, contract_tx_retention_secs: 120, ..DetectorConfig::default() };
        assert_eq!(config.transfer_retention(), Duration::from_secs(60));
        assert_eq!(config.contract_tx_retention(), Duration::from_secs(120));
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let config = DetectorConfig { batch_threshold: 0, ..DetectorConfig::default() };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_section_partial() -> eyre::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "[detector]\nbatch_threshold = 3\nsuspicion_threshold = 0.8\n\n[detector.signal_weights]\ncyclic = 2.0\nshared_funding = 1.0\ndegree_uniformity = 1.0\namount_uniformity = 1.0\nburstiness = 0.5")?;

        let config = DetectorConfig::load_section_from_file(file.path()).await?;

        assert_eq!(config.batch_threshold, 3);
        assert_eq!(config.suspicion_threshold, 0.8);
        assert_eq!(config.signal_weights.cyclic, 2.0);
        assert_eq!(config.signal_weights.flow_symmetry, 1.0);
        // unspecified keys fall back to defaults
        assert_eq!(config.partition_seed, DEFAULT_PARTITION_SEED);
        Ok(())
    }

    #[test]
    fn test_load_section_missing() -> eyre::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "[other]\nkey = 1")?;

        let result = DetectorConfig::load_section_from_file_sync(file.path());
        assert!(matches!(result, Err(LoadConfigError::ConfigError(_))));
        Ok(())
    }
}

//! Configuration for the SDUPI ledger core and node

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crypto::HashAlgorithm;
use crate::error::{Result, SdupiError};
use crate::round::ConsensusAlgorithm;

pub const DEFAULT_CONFIG_PATH: &str = "sdupi_config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node identity
    pub node_id: String,

    /// DAG ledger configuration
    pub dag: DagConfig,

    /// Consensus configuration
    pub consensus: ConsensusConfig,

    /// Validator registry configuration
    pub validators: ValidatorConfig,

    /// Performance monitor configuration
    pub metrics: MetricsConfig,

    /// Stake registered for the local validator key (node binary only)
    pub local_stake: u64,

    /// Payload references per second the node binary submits as devnet
    /// traffic; 0 disables the generator
    pub demo_load: u64,

    /// Logging level
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagConfig {
    /// Parents selected per new node (k)
    pub tip_fanout: usize,

    /// Upper bound on parents for explicitly parented or imported nodes
    pub max_parents: usize,

    /// Weight given to every tip when all candidate tips carry zero stake
    pub zero_stake_fallback_weight: u64,

    /// Seed for tip selection; `None` seeds from OS entropy
    pub tip_selection_seed: Option<u64>,

    /// Maximum payload references per node
    pub max_payload_refs: usize,

    /// Concurrent payload validation tasks for batch insertion
    pub validation_workers: usize,

    /// Content hash algorithm
    pub hash_algorithm: HashAlgorithm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Algorithm used when a round is started without an explicit choice
    pub algorithm: ConsensusAlgorithm,

    /// Maximum duration of a single phase (ms)
    pub phase_timeout_ms: u64,

    /// Maximum committee size
    pub max_committee_size: usize,

    /// Maximum nodes finalized by one round
    pub max_batch_size: usize,

    /// Archived rounds kept for statistics
    pub round_history: usize,

    /// Consecutive failed rounds before consensus is reported degraded
    pub degraded_after_failures: u64,

    /// Scheduler interval between round attempts (ms)
    pub round_interval_ms: u64,
}

impl ConsensusConfig {
    pub fn phase_timeout(&self) -> Duration {
        Duration::from_millis(self.phase_timeout_ms)
    }

    pub fn round_interval(&self) -> Duration {
        Duration::from_millis(self.round_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Minimum stake for a validator to be active
    pub min_stake: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Maximum latency samples kept in the sliding window
    pub window_size: usize,

    /// Maximum age of a sample in the sliding window (ms)
    pub window_ms: u64,

    /// Sample count below which every percentile is flagged low-confidence
    pub min_percentile_samples: usize,
}

impl Default for DagConfig {
    fn default() -> Self {
        Self {
            tip_fanout: 2,
            max_parents: 8,
            zero_stake_fallback_weight: 1,
            tip_selection_seed: None,
            max_payload_refs: 10_000,
            validation_workers: 8,
            hash_algorithm: HashAlgorithm::Sha256,
        }
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            algorithm: ConsensusAlgorithm::Hybrid,
            phase_timeout_ms: 2_000,
            max_committee_size: 21, // Typical BFT committee size
            max_batch_size: 10_000,
            round_history: 256,
            degraded_after_failures: 3,
            round_interval_ms: 1_000,
        }
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self { min_stake: 1_000 }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window_size: 100_000,
            window_ms: 60_000,
            min_percentile_samples: 20,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            dag: DagConfig::default(),
            consensus: ConsensusConfig::default(),
            validators: ValidatorConfig::default(),
            metrics: MetricsConfig::default(),
            local_stake: 10_000,
            demo_load: 200,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from `sdupi_config.json`, writing the defaults there
    /// if the file does not exist yet
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let config_path = PathBuf::from(path.as_ref());
        let config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .map_err(|e| SdupiError::Config(format!("Failed to read config: {}", e)))?;
            serde_json::from_str::<Config>(&content)
                .map_err(|e| SdupiError::Config(format!("Failed to parse config: {}", e)))?
        } else {
            let default_config = Self::default();
            let content = serde_json::to_string_pretty(&default_config)
                .map_err(|e| SdupiError::Config(format!("Failed to serialize config: {}", e)))?;
            std::fs::write(&config_path, content)
                .map_err(|e| SdupiError::Config(format!("Failed to write config: {}", e)))?;
            default_config
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dag.tip_fanout == 0 {
            return Err(SdupiError::Config("dag.tip_fanout must be at least 1".to_string()));
        }
        if self.dag.max_parents < self.dag.tip_fanout {
            return Err(SdupiError::Config(format!(
                "dag.max_parents ({}) is below dag.tip_fanout ({})",
                self.dag.max_parents, self.dag.tip_fanout
            )));
        }
        if self.dag.zero_stake_fallback_weight == 0 {
            return Err(SdupiError::Config(
                "dag.zero_stake_fallback_weight must be positive".to_string(),
            ));
        }
        if self.dag.validation_workers == 0 {
            return Err(SdupiError::Config("dag.validation_workers must be positive".to_string()));
        }
        if self.consensus.phase_timeout_ms == 0 {
            return Err(SdupiError::Config("consensus.phase_timeout_ms must be positive".to_string()));
        }
        if self.consensus.max_committee_size == 0 {
            return Err(SdupiError::Config(
                "consensus.max_committee_size must be positive".to_string(),
            ));
        }
        if self.consensus.round_history == 0 || self.consensus.degraded_after_failures == 0 {
            return Err(SdupiError::Config(
                "consensus.round_history and consensus.degraded_after_failures must be positive"
                    .to_string(),
            ));
        }
        if self.metrics.window_size == 0 || self.metrics.window_ms == 0 {
            return Err(SdupiError::Config("metrics window must be non-empty".to_string()));
        }
        Ok(())
    }
}

//! Configuration for the ChunkFleet service and CLI
//!
//! Supports loading from TOML files and environment variables. A separate
//! fleet manifest seeds drives and policies into an empty catalog.

use crate::structural::{NoStructuralRebalance, StructuralRebalance, UtilizationRebalance};
use chunkfleet_metadata::{MetricThresholds, NewDrive, NewPolicy};
use chunkfleet_storage::StorageConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Complete service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebalancerConfig {
    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub rebalance: RebalanceSettings,

    #[serde(default)]
    pub health: HealthSettings,

    #[serde(default)]
    pub simulation: SimulationSettings,

    #[serde(default)]
    pub logging: LoggingSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,
}

impl RebalancerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: RebalancerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, else defaults; environment overrides apply on top
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let h = &self.health;
        for (name, rate) in [
            ("degraded_error_rate", h.degraded_error_rate),
            ("failing_error_rate", h.failing_error_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigError::ValidationError(format!(
                    "health.{} must be between 0 and 1, got {}",
                    name, rate
                )));
            }
        }
        if h.degraded_error_rate > h.failing_error_rate {
            return Err(ConfigError::ValidationError(
                "health.degraded_error_rate cannot exceed health.failing_error_rate".to_string(),
            ));
        }
        if h.degraded_temperature > h.failing_temperature {
            return Err(ConfigError::ValidationError(
                "health.degraded_temperature cannot exceed health.failing_temperature".to_string(),
            ));
        }

        if self.rebalance.structural == StructuralMode::Utilization && self.rebalance.max_moves == 0 {
            return Err(ConfigError::ValidationError(
                "rebalance.max_moves must be positive for utilization rebalancing".to_string(),
            ));
        }

        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "logging.level cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Override config with CLI arguments
    pub fn with_overrides(mut self, data_dir: Option<PathBuf>, json_logs: bool) -> Self {
        if let Some(dir) = data_dir {
            self.storage.data_dir = Some(dir);
        }
        if json_logs {
            self.logging.json = true;
        }
        self
    }

    /// Apply `CHUNKFLEET_*` environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var("CHUNKFLEET_DATA_DIR") {
            if !dir.is_empty() {
                self.storage.data_dir = Some(PathBuf::from(dir));
            }
        }

        if let Ok(mode) = std::env::var("CHUNKFLEET_STRUCTURAL") {
            match mode.to_ascii_lowercase().as_str() {
                "none" => self.rebalance.structural = StructuralMode::None,
                "utilization" => self.rebalance.structural = StructuralMode::Utilization,
                other => tracing::warn!(value = %other, "Ignoring unknown CHUNKFLEET_STRUCTURAL"),
            }
        }

        if let Ok(moves) = std::env::var("CHUNKFLEET_MAX_MOVES") {
            if let Ok(n) = moves.parse::<usize>() {
                self.rebalance.max_moves = n;
            }
        }

        if let Ok(seed) = std::env::var("CHUNKFLEET_SEED") {
            if let Ok(n) = seed.parse::<u64>() {
                self.simulation.seed = Some(n);
            }
        }

        if let Ok(level) = std::env::var("CHUNKFLEET_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(json) = std::env::var("CHUNKFLEET_JSON_LOGS") {
            self.logging.json = json == "true" || json == "1";
        }

        if let Ok(enabled) = std::env::var("CHUNKFLEET_METRICS") {
            self.metrics.enabled = enabled == "true" || enabled == "1";
        }

        self
    }
}

/// Catalog storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Directory of the sled catalog; in-memory when absent
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub flush_on_write: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            flush_on_write: true,
        }
    }
}

impl StorageSettings {
    /// Convert to chunkfleet_storage::StorageConfig
    pub fn to_storage_config(&self) -> StorageConfig {
        StorageConfig {
            path: self.data_dir.clone(),
            flush_on_write: self.flush_on_write,
        }
    }
}

/// Structural rebalance planner selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StructuralMode {
    #[default]
    None,
    Utilization,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceSettings {
    #[serde(default)]
    pub structural: StructuralMode,

    /// Upper bound on structural moves per rebalance
    #[serde(default = "default_max_moves")]
    pub max_moves: usize,
}

impl Default for RebalanceSettings {
    fn default() -> Self {
        Self {
            structural: StructuralMode::None,
            max_moves: default_max_moves(),
        }
    }
}

impl RebalanceSettings {
    /// Build the configured planner
    pub fn planner(&self) -> Arc<dyn StructuralRebalance> {
        self.planner_for(self.structural)
    }

    /// Build a planner for `mode` with these settings
    pub fn planner_for(&self, mode: StructuralMode) -> Arc<dyn StructuralRebalance> {
        match mode {
            StructuralMode::None => Arc::new(NoStructuralRebalance),
            StructuralMode::Utilization => Arc::new(UtilizationRebalance {
                max_moves: self.max_moves,
            }),
        }
    }
}

fn default_max_moves() -> usize {
    10
}

/// Metric thresholds driving drive status transitions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_degraded_error_rate")]
    pub degraded_error_rate: f64,

    #[serde(default = "default_degraded_temperature")]
    pub degraded_temperature: f64,

    #[serde(default = "default_failing_error_rate")]
    pub failing_error_rate: f64,

    #[serde(default = "default_failing_temperature")]
    pub failing_temperature: f64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            degraded_error_rate: default_degraded_error_rate(),
            degraded_temperature: default_degraded_temperature(),
            failing_error_rate: default_failing_error_rate(),
            failing_temperature: default_failing_temperature(),
        }
    }
}

impl HealthSettings {
    pub fn thresholds(&self) -> MetricThresholds {
        MetricThresholds {
            degraded_error_rate: self.degraded_error_rate,
            degraded_temperature: self.degraded_temperature,
            failing_error_rate: self.failing_error_rate,
            failing_temperature: self.failing_temperature,
        }
    }
}

fn default_degraded_error_rate() -> f64 {
    MetricThresholds::default().degraded_error_rate
}

fn default_degraded_temperature() -> f64 {
    MetricThresholds::default().degraded_temperature
}

fn default_failing_error_rate() -> f64 {
    MetricThresholds::default().failing_error_rate
}

fn default_failing_temperature() -> f64 {
    MetricThresholds::default().failing_temperature
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulationSettings {
    /// Fixed RNG seed; entropy-seeded when absent
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// Install the Prometheus recorder
    #[serde(default)]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

// =============================================================================
// FLEET MANIFEST
// =============================================================================

/// Drives and policies to seed into a catalog
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetManifest {
    #[serde(default)]
    pub drives: Vec<NewDrive>,

    #[serde(default)]
    pub policies: Vec<ManifestPolicy>,
}

/// Policy entry of a manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestPolicy {
    #[serde(flatten)]
    pub policy: NewPolicy,

    /// Activate after creation
    #[serde(default)]
    pub active: bool,
}

impl FleetManifest {
    /// Load a manifest from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let manifest: FleetManifest = toml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.policies.iter().filter(|p| p.active).count() > 1 {
            return Err(ConfigError::ValidationError(
                "at most one manifest policy can be active".to_string(),
            ));
        }
        Ok(())
    }
}

//! Configuration management for the transfer engine.
//!
//! Loads configuration from TOML file with CLI flag overrides layered on top.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub performance: PerformanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory for persisted operation state and logs.
    /// Defaults to the platform per-user local data directory.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Ceiling on concurrent file transfers, applied to every strategy
    /// (selected, forced or adapted)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_files: usize,

    /// Entries skipped during enumeration
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the initial attempt
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier applied per attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Perturb each delay by up to +/-25%
    #[serde(default = "default_use_jitter")]
    pub use_jitter: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Allow per-file on-the-wire compression when the strategy enables it
    #[serde(default = "default_true")]
    pub compression: bool,

    /// Allow delta-sync against existing destination files
    #[serde(default = "default_true")]
    pub delta_sync: bool,

    /// Override the strategy's buffer size (KiB); None keeps the strategy value
    #[serde(default)]
    pub buffer_size_kib: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Speed samples kept per operation
    #[serde(default = "default_sample_window")]
    pub sample_window: usize,

    /// Samples required before the monitor may adjust concurrency
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Minimum seconds between concurrency adaptations
    #[serde(default = "default_adaptation_spacing_secs")]
    pub adaptation_spacing_secs: u64,

    /// Hard cap on adaptive concurrency growth
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

// Default values
fn default_state_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.data_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_max_concurrent() -> usize {
    32
}

fn default_exclude_patterns() -> Vec<String> {
    vec![
        ".git".to_string(),
        "node_modules".to_string(),
        ".DS_Store".to_string(),
    ]
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_use_jitter() -> bool {
    true
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sample_window() -> usize {
    10
}

fn default_min_samples() -> usize {
    5
}

fn default_adaptation_spacing_secs() -> u64 {
    5
}

fn default_max_concurrency() -> usize {
    32
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            max_concurrent_files: default_max_concurrent(),
            exclude_patterns: default_exclude_patterns(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            use_jitter: default_use_jitter(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            compression: true,
            delta_sync: true,
            buffer_size_kib: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            sample_window: default_sample_window(),
            min_samples: default_min_samples(),
            adaptation_spacing_secs: default_adaptation_spacing_secs(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            retry: RetryConfig::default(),
            sync: SyncConfig::default(),
            log: LogConfig::default(),
            performance: PerformanceConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_delay_ms, 1000);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert!(config.retry.use_jitter);
        assert!(config.sync.compression);
        assert!(config.sync.delta_sync);
        assert_eq!(config.engine.max_concurrent_files, 32);
        assert_eq!(config.performance.sample_window, 10);
        assert_eq!(config.performance.min_samples, 5);
        assert_eq!(config.performance.adaptation_spacing_secs, 5);
        assert_eq!(config.performance.max_concurrency, 32);
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [retry]
            max_attempts = 5

            [sync]
            compression = false

            [performance]
            min_samples = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay_ms, 1000);
        assert!(!config.sync.compression);
        assert!(config.sync.delta_sync);
        assert_eq!(config.performance.min_samples, 3);
        assert_eq!(config.performance.sample_window, 10);
    }

    #[test]
    fn test_engine_concurrency_ceiling_from_toml() {
        let config: Config = toml::from_str(
            r#"
            [engine]
            max_concurrent_files = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.max_concurrent_files, 4);
        // Untouched sections keep their defaults
        assert_eq!(config.performance.max_concurrency, 32);
    }

    #[test]
    fn test_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.log.level, "info");
        assert!(config
            .engine
            .exclude_patterns
            .contains(&".git".to_string()));
    }
}

//! Engine configuration types
//!
//! Loaded from an optional TOML file layered under `TALLY__*` environment
//! variables, e.g. `TALLY__WORKER__WORKERS=8`.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tally_core::{
    Amount, Result, TallyError, DEFAULT_BLOCK_INTERVAL_SECS, DEFAULT_MAX_ANCESTOR_DEPTH, ONE_TOKEN,
    REWARD_SYMBOL,
};
use tally_economics::ScheduleSettings;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "TALLY";

/// Complete engine configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Mint block schedule
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Combat power aggregation
    #[serde(default)]
    pub combat: CombatConfig,

    /// Recalculation worker pool
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl EngineConfig {
    /// Load from `path` (if given and present) plus `TALLY__*` overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    /// Load with a custom environment prefix
    pub fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        let config: Self = builder
            .add_source(
                Environment::with_prefix(prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TallyError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.schedule.interval_secs == 0 {
            return Err(TallyError::Config("schedule.interval_secs must be > 0".into()));
        }
        if self.schedule.tick_interval_secs == 0 {
            return Err(TallyError::Config("schedule.tick_interval_secs must be > 0".into()));
        }
        if self.schedule.reward_symbol.trim().is_empty() {
            return Err(TallyError::Config("schedule.reward_symbol must not be empty".into()));
        }
        if self.combat.max_ancestor_depth == 0 {
            return Err(TallyError::Config("combat.max_ancestor_depth must be > 0".into()));
        }
        if self.combat.reconcile_interval_secs == 0 || self.combat.reconcile_batch_size == 0 {
            return Err(TallyError::Config(
                "combat.reconcile_interval_secs and reconcile_batch_size must be > 0".into(),
            ));
        }
        if self.worker.workers == 0 || self.worker.queue_capacity == 0 {
            return Err(TallyError::Config(
                "worker.workers and worker.queue_capacity must be > 0".into(),
            ));
        }
        if self.worker.max_attempts == 0 {
            return Err(TallyError::Config("worker.max_attempts must be > 0".into()));
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(TallyError::Config(format!(
                "logging.format must be \"text\" or \"json\", got {:?}",
                self.logging.format
            )));
        }
        Ok(())
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| TallyError::Config(e.to_string()))
    }
}

/// Mint block schedule
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Seconds between mint blocks
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Reward pool per block, in whole tokens
    #[serde(default = "default_block_reward_tokens")]
    pub block_reward_tokens: u64,

    /// Symbol of the reward asset on the balance ledger
    #[serde(default = "default_reward_symbol")]
    pub reward_symbol: String,

    /// Seconds between scheduler ticks
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

fn default_interval_secs() -> u64 {
    DEFAULT_BLOCK_INTERVAL_SECS
}

fn default_block_reward_tokens() -> u64 {
    1_000
}

fn default_reward_symbol() -> String {
    REWARD_SYMBOL.to_string()
}

fn default_tick_interval_secs() -> u64 {
    30
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            block_reward_tokens: default_block_reward_tokens(),
            reward_symbol: default_reward_symbol(),
            tick_interval_secs: default_tick_interval_secs(),
        }
    }
}

impl ScheduleConfig {
    /// Block reward in minimum units
    pub fn block_reward(&self) -> Amount {
        self.block_reward_tokens as Amount * ONE_TOKEN
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn settings(&self) -> ScheduleSettings {
        ScheduleSettings {
            interval: Duration::from_secs(self.interval_secs),
            block_reward: self.block_reward(),
        }
    }
}

/// Combat power aggregation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombatConfig {
    /// Hop limit for ancestor propagation
    #[serde(default = "default_max_ancestor_depth")]
    pub max_ancestor_depth: usize,

    /// Seconds between reconciliation batches
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Participants per reconciliation batch
    #[serde(default = "default_reconcile_batch_size")]
    pub reconcile_batch_size: usize,
}

fn default_max_ancestor_depth() -> usize {
    DEFAULT_MAX_ANCESTOR_DEPTH
}

fn default_reconcile_interval_secs() -> u64 {
    3_600
}

fn default_reconcile_batch_size() -> usize {
    500
}

impl Default for CombatConfig {
    fn default() -> Self {
        Self {
            max_ancestor_depth: default_max_ancestor_depth(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            reconcile_batch_size: default_reconcile_batch_size(),
        }
    }
}

impl CombatConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

/// Recalculation worker pool
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of worker tasks
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Bounded queue length
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Attempts per job before it is dead-lettered
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base retry delay; attempt `n` waits `n` times this
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1_024
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl WorkerConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Logging configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Metrics configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Record Prometheus metrics
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metric name prefix
    #[serde(default = "default_metrics_namespace")]
    pub namespace: String,
}

fn default_true() -> bool {
    true
}

fn default_metrics_namespace() -> String {
    "tally".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: default_metrics_namespace(),
        }
    }
}

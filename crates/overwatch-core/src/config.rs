//! Overwatch configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{OverwatchError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverwatchConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub bots: BotEngineConfig,
}

impl OverwatchConfig {
    /// Load config from the default path (~/.overwatch/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OverwatchError::config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        tracing::debug!("⚙️ Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save config to a specific path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".overwatch")
            .join("config.toml")
    }

    /// Reject values that would stall or disable the engine.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.max_concurrent_tasks == 0 {
            return Err(OverwatchError::config("scheduler.max_concurrent_tasks must be > 0"));
        }
        if s.history_limit == 0 {
            return Err(OverwatchError::config("scheduler.history_limit must be > 0"));
        }
        if s.poll_interval_ms == 0 {
            return Err(OverwatchError::config("scheduler.poll_interval_ms must be > 0"));
        }
        if s.blocking_pool_size == 0 {
            return Err(OverwatchError::config("scheduler.blocking_pool_size must be > 0"));
        }
        if !(0.0..=1.0).contains(&s.retry_jitter) {
            return Err(OverwatchError::config("scheduler.retry_jitter must be within 0.0..=1.0"));
        }
        let b = &self.bots;
        if b.strategy.trim().is_empty() {
            return Err(OverwatchError::config("bots.strategy must not be empty"));
        }
        if b.assignment_poll_ms == 0 || b.health_check_interval_secs == 0 || b.stats_interval_secs == 0 {
            return Err(OverwatchError::config("bots loop intervals must be > 0"));
        }
        if b.assignment_history_limit == 0 {
            return Err(OverwatchError::config("bots.assignment_history_limit must be > 0"));
        }
        Ok(())
    }
}

/// Task scheduler and dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Capacity of the completed/failed histories and the duration window.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_generation_interval_secs")]
    pub generation_interval_secs: u64,
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,
    /// Retry delay used when a task does not carry its own.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,
    #[serde(default = "bool_true")]
    pub exponential_backoff: bool,
    /// Fraction of the retry delay added or removed at random.
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: f64,
    #[serde(default = "default_blocking_pool_size")]
    pub blocking_pool_size: usize,
}

fn bool_true() -> bool { true }
fn default_max_concurrent_tasks() -> usize { 10 }
fn default_history_limit() -> usize { 1000 }
fn default_poll_interval_ms() -> u64 { 100 }
fn default_generation_interval_secs() -> u64 { 300 }
fn default_join_timeout_secs() -> u64 { 5 }
fn default_retry_delay_ms() -> u64 { 1000 }
fn default_max_retry_delay_secs() -> u64 { 300 }
fn default_retry_jitter() -> f64 { 0.1 }
fn default_blocking_pool_size() -> usize { 4 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            history_limit: default_history_limit(),
            poll_interval_ms: default_poll_interval_ms(),
            generation_interval_secs: default_generation_interval_secs(),
            join_timeout_secs: default_join_timeout_secs(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_secs: default_max_retry_delay_secs(),
            exponential_backoff: true,
            retry_jitter: default_retry_jitter(),
            blocking_pool_size: default_blocking_pool_size(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn generation_interval(&self) -> Duration {
        Duration::from_secs(self.generation_interval_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_secs)
    }
}

/// Built-in generation rule configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default = "bool_true")]
    pub builtin_rules: bool,
    #[serde(default = "default_health_check_delay_secs")]
    pub health_check_delay_secs: u64,
    #[serde(default = "default_performance_check_delay_secs")]
    pub performance_check_delay_secs: u64,
    #[serde(default = "default_maintenance_uptime_hours")]
    pub maintenance_uptime_hours: u64,
    #[serde(default = "default_backup_max_age_days")]
    pub backup_max_age_days: u64,
}

fn default_health_check_delay_secs() -> u64 { 300 }
fn default_performance_check_delay_secs() -> u64 { 900 }
fn default_maintenance_uptime_hours() -> u64 { 24 }
fn default_backup_max_age_days() -> u64 { 7 }

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            builtin_rules: true,
            health_check_delay_secs: default_health_check_delay_secs(),
            performance_check_delay_secs: default_performance_check_delay_secs(),
            maintenance_uptime_hours: default_maintenance_uptime_hours(),
            backup_max_age_days: default_backup_max_age_days(),
        }
    }
}

/// Bot assignment engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotEngineConfig {
    /// Name of the assignment strategy: best_fit, load_balanced, round_robin, priority_first.
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_assignment_poll_ms")]
    pub assignment_poll_ms: u64,
    #[serde(default = "default_assignment_backoff_ms")]
    pub assignment_backoff_ms: u64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// A bot not seen for this long is marked offline.
    #[serde(default = "default_bot_timeout_secs")]
    pub bot_timeout_secs: u64,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
    /// Window for the recent-completion scoring bonus.
    #[serde(default = "default_recent_completion_window_secs")]
    pub recent_completion_window_secs: u64,
    /// Finished assignments kept for lookup, oldest evicted first.
    #[serde(default = "default_assignment_history_limit")]
    pub assignment_history_limit: usize,
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,
}

fn default_strategy() -> String { "best_fit".into() }
fn default_assignment_poll_ms() -> u64 { 100 }
fn default_assignment_backoff_ms() -> u64 { 1000 }
fn default_health_check_interval_secs() -> u64 { 30 }
fn default_bot_timeout_secs() -> u64 { 300 }
fn default_stats_interval_secs() -> u64 { 10 }
fn default_recent_completion_window_secs() -> u64 { 1800 }
fn default_assignment_history_limit() -> usize { 1000 }

impl Default for BotEngineConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            assignment_poll_ms: default_assignment_poll_ms(),
            assignment_backoff_ms: default_assignment_backoff_ms(),
            health_check_interval_secs: default_health_check_interval_secs(),
            bot_timeout_secs: default_bot_timeout_secs(),
            stats_interval_secs: default_stats_interval_secs(),
            recent_completion_window_secs: default_recent_completion_window_secs(),
            assignment_history_limit: default_assignment_history_limit(),
            join_timeout_secs: default_join_timeout_secs(),
        }
    }
}

impl BotEngineConfig {
    pub fn assignment_poll(&self) -> Duration {
        Duration::from_millis(self.assignment_poll_ms)
    }

    pub fn assignment_backoff(&self) -> Duration {
        Duration::from_millis(self.assignment_backoff_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

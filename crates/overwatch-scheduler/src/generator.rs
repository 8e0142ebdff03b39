//! Task Generator: rule-driven task production.
//!
//! ## Architecture
//! ```text
//! SystemState (uptime, last backup, health outcomes, extras)
//!   → TaskGenerator.generate_tasks(state)
//!     → For each rule, in registration order:
//!       → rule.generate(state) → Vec<Task>
//!       → Err or panic: log and skip, keep going
//!   → concatenated Vec<Task> for the caller to submit
//! ```
//!
//! The generator never submits anything itself.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

use chrono::{DateTime, Duration, Utc};
use overwatch_core::config::GeneratorConfig;
use overwatch_core::error::Result;
use serde::{Deserialize, Serialize};

use crate::handlers::panic_message;
use crate::tasks::{Task, TaskPriority, TaskType};

/// Outcome of one finished health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckOutcome {
    pub task_id: String,
    pub success: bool,
    pub finished_at: DateTime<Utc>,
}

/// Snapshot of the running system handed to every rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemState {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub last_backup: Option<DateTime<Utc>>,
    pub last_maintenance: Option<DateTime<Utc>>,
    /// Most recent first.
    pub recent_health_checks: Vec<HealthCheckOutcome>,
    pub queue_size: usize,
    pub running_count: usize,
    /// Facts pushed in by monitoring integrations.
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl SystemState {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        let uptime_secs = (Utc::now() - started_at).num_seconds().max(0) as u64;
        Self {
            started_at,
            uptime_secs,
            last_backup: None,
            last_maintenance: None,
            recent_health_checks: Vec::new(),
            queue_size: 0,
            running_count: 0,
            extra: HashMap::new(),
        }
    }

    pub fn uptime(&self) -> Duration {
        Duration::seconds(self.uptime_secs as i64)
    }

    /// Consecutive failed health checks at the head of the history.
    pub fn failing_health_streak(&self) -> usize {
        self.recent_health_checks
            .iter()
            .take_while(|h| !h.success)
            .count()
    }
}

/// A source of new tasks.
pub trait GenerationRule: Send + Sync {
    fn name(&self) -> &str;

    fn generate(&self, state: &SystemState) -> Result<Vec<Task>>;
}

/// Adapts a closure into a [`GenerationRule`].
pub struct FnRule<F> {
    name: String,
    func: F,
}

impl<F> FnRule<F>
where
    F: Fn(&SystemState) -> Result<Vec<Task>> + Send + Sync,
{
    pub fn new(name: &str, func: F) -> Self {
        Self {
            name: name.to_string(),
            func,
        }
    }
}

impl<F> GenerationRule for FnRule<F>
where
    F: Fn(&SystemState) -> Result<Vec<Task>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn generate(&self, state: &SystemState) -> Result<Vec<Task>> {
        (self.func)(state)
    }
}

/// Emits a health check and a performance check on every pass, each
/// scheduled a fixed delay into the future.
pub struct PeriodicRule {
    health_delay: Duration,
    performance_delay: Duration,
}

impl PeriodicRule {
    pub fn new(config: &GeneratorConfig) -> Self {
        Self {
            health_delay: Duration::seconds(config.health_check_delay_secs as i64),
            performance_delay: Duration::seconds(config.performance_check_delay_secs as i64),
        }
    }
}

impl GenerationRule for PeriodicRule {
    fn name(&self) -> &str {
        "periodic"
    }

    fn generate(&self, _state: &SystemState) -> Result<Vec<Task>> {
        let now = Utc::now();
        Ok(vec![
            Task::new(
                "system_health_check",
                "Periodic system health check",
                TaskType::SystemHealth,
            )
            .with_priority(TaskPriority::Normal)
            .scheduled_at(now + self.health_delay),
            Task::new(
                "performance_check",
                "Periodic performance check",
                TaskType::PerformanceCheck,
            )
            .with_priority(TaskPriority::Low)
            .scheduled_at(now + self.performance_delay),
        ])
    }
}

/// Emits maintenance after long uptime and a backup once the last one is stale.
pub struct ConditionalRule {
    maintenance_after: Duration,
    backup_max_age: Duration,
}

impl ConditionalRule {
    pub fn new(config: &GeneratorConfig) -> Self {
        Self {
            maintenance_after: Duration::hours(config.maintenance_uptime_hours as i64),
            backup_max_age: Duration::days(config.backup_max_age_days as i64),
        }
    }
}

impl GenerationRule for ConditionalRule {
    fn name(&self) -> &str {
        "conditional"
    }

    fn generate(&self, state: &SystemState) -> Result<Vec<Task>> {
        let now = Utc::now();
        let mut tasks = Vec::new();

        let maintenance_due = state.uptime() > self.maintenance_after
            && state
                .last_maintenance
                .is_none_or(|at| now - at > self.maintenance_after);
        if maintenance_due {
            tasks.push(
                Task::new(
                    "system_maintenance",
                    "Routine maintenance after extended uptime",
                    TaskType::Maintenance,
                )
                .with_priority(TaskPriority::Low)
                .with_metadata("uptime_secs", serde_json::json!(state.uptime_secs)),
            );
        }

        // A system that never backed up counts from when it started.
        let last_backup = state.last_backup.unwrap_or(state.started_at);
        if now - last_backup > self.backup_max_age {
            tasks.push(
                Task::new("data_backup", "Scheduled data backup", TaskType::DataBackup)
                    .with_priority(TaskPriority::Normal)
                    .with_metadata("last_backup", serde_json::json!(last_backup.to_rfc3339())),
            );
        }

        Ok(tasks)
    }
}

/// Runs generation rules and collects their tasks.
pub struct TaskGenerator {
    rules: Vec<Box<dyn GenerationRule>>,
}

impl TaskGenerator {
    /// Create a generator without any rules.
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Create a generator with the periodic and conditional built-ins.
    pub fn with_builtin_rules(config: &GeneratorConfig) -> Self {
        let mut generator = Self::new();
        generator.add_rule(Box::new(PeriodicRule::new(config)));
        generator.add_rule(Box::new(ConditionalRule::new(config)));
        generator
    }

    pub fn add_rule(&mut self, rule: Box<dyn GenerationRule>) {
        tracing::info!("🧩 Generation rule added: '{}'", rule.name());
        self.rules.push(rule);
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Run every rule against `state`. A failing or panicking rule is logged
    /// and skipped; the others still contribute.
    pub fn generate_tasks(&self, state: &SystemState) -> Vec<Task> {
        let mut tasks = Vec::new();

        for rule in &self.rules {
            match catch_unwind(AssertUnwindSafe(|| rule.generate(state))) {
                Ok(Ok(generated)) => {
                    if !generated.is_empty() {
                        tracing::debug!(
                            "🧩 Rule '{}' generated {} task(s)",
                            rule.name(),
                            generated.len()
                        );
                    }
                    tasks.extend(generated);
                }
                Ok(Err(e)) => {
                    tracing::warn!("⚠️ Generation rule '{}' failed: {}", rule.name(), e);
                }
                Err(payload) => {
                    tracing::warn!(
                        "⚠️ Generation rule '{}' panicked: {}",
                        rule.name(),
                        panic_message(payload.as_ref())
                    );
                }
            }
        }

        tasks
    }
}

impl Default for TaskGenerator {
    fn default() -> Self {
        Self::new()
    }
}

//! Overwatch System: the facade that ties the generator, scheduler and
//! dispatcher together and owns the periodic generation timer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use overwatch_core::config::OverwatchConfig;
use overwatch_core::error::Result;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::dispatch::TaskDispatcher;
use crate::generator::{GenerationRule, HealthCheckOutcome, SystemState, TaskGenerator};
use crate::handlers::{BlockingPool, TaskFn, TaskHandler};
use crate::scheduler::{SchedulerStats, TaskScheduler};
use crate::tasks::{Task, TaskPriority, TaskStatus, TaskType};

/// How many finished health checks feed the system state.
const HEALTH_HISTORY: usize = 10;

/// Sleep between generation-timer checks in `run_forever`.
const RUN_TICK: Duration = Duration::from_secs(1);

/// Point-in-time view of the system.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub running: bool,
    pub uptime_secs: u64,
    pub queue_size: usize,
    pub running_count: usize,
    pub completed_count: u64,
    pub failed_count: u64,
    pub mean_execution_time_ms: f64,
    pub last_generation_time: Option<DateTime<Utc>>,
    pub scheduler: SchedulerStats,
}

/// Task generation + scheduling + dispatch behind one handle.
pub struct OverwatchSystem {
    config: OverwatchConfig,
    generator: RwLock<TaskGenerator>,
    scheduler: Arc<TaskScheduler>,
    dispatcher: TaskDispatcher,
    blocking_pool: BlockingPool,
    running: AtomicBool,
    started_at: Mutex<DateTime<Utc>>,
    last_generation: Mutex<Option<DateTime<Utc>>>,
    extra_state: RwLock<HashMap<String, serde_json::Value>>,
}

impl OverwatchSystem {
    pub fn new(config: OverwatchConfig) -> Self {
        let generator = if config.generator.builtin_rules {
            TaskGenerator::with_builtin_rules(&config.generator)
        } else {
            TaskGenerator::new()
        };
        let scheduler = Arc::new(TaskScheduler::new(config.scheduler.clone()));
        let dispatcher = TaskDispatcher::new(scheduler.clone());
        let blocking_pool = BlockingPool::new(config.scheduler.blocking_pool_size);
        Self {
            config,
            generator: RwLock::new(generator),
            scheduler,
            dispatcher,
            blocking_pool,
            running: AtomicBool::new(false),
            started_at: Mutex::new(Utc::now()),
            last_generation: Mutex::new(None),
            extra_state: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &OverwatchConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// Shared pool for handlers that do blocking work.
    pub fn blocking_pool(&self) -> BlockingPool {
        self.blocking_pool.clone()
    }

    /// Build a task from loose parts and submit it.
    pub async fn create_task(
        &self,
        name: &str,
        description: &str,
        task_type: TaskType,
        priority: TaskPriority,
        subsystem: &str,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<Task> {
        let mut task = Task::new(name, description, task_type)
            .with_priority(priority)
            .with_subsystem(subsystem);
        task.retry_delay_ms = self.config.scheduler.retry_delay_ms;
        task.context.metadata = metadata;
        self.submit_task(task.clone()).await?;
        Ok(task)
    }

    pub async fn submit_task(&self, task: Task) -> Result<()> {
        self.scheduler.submit(task).await
    }

    pub async fn cancel_task(&self, task_id: &str) -> bool {
        self.scheduler.cancel(task_id).await
    }

    pub async fn register_task_handler(&self, task_type: TaskType, handler: Arc<dyn TaskHandler>) {
        self.scheduler.register_handler(task_type, handler).await;
    }

    pub async fn register_fallback_handler(&self, handler: Arc<dyn TaskHandler>) {
        self.scheduler.register_fallback_handler(handler).await;
    }

    pub async fn register_subsystem_handler(&self, name: &str, handler: TaskFn) {
        self.dispatcher.register_subsystem_handler(name, handler).await;
    }

    pub async fn add_generation_rule(&self, rule: Box<dyn GenerationRule>) {
        self.generator.write().await.add_rule(rule);
    }

    /// Publish an extra fact into the state that generation rules see.
    pub async fn set_state_value(&self, key: &str, value: serde_json::Value) {
        self.extra_state.write().await.insert(key.to_string(), value);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start dispatching and run one generation pass right away.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.started_at.lock().await = Utc::now();
        tracing::info!("👁️ Overwatch system starting");
        self.dispatcher.start().await;
        self.generate_and_submit_tasks().await;
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("👁️ Overwatch system stopping");
        self.dispatcher.stop().await;
    }

    /// Drive the generation timer until [`stop`](Self::stop) is called.
    pub async fn run_forever(&self) {
        let interval = self.config.scheduler.generation_interval();
        let tick = RUN_TICK.min(interval.max(Duration::from_millis(10)));
        while self.is_running() {
            let due = match *self.last_generation.lock().await {
                Some(last) => (Utc::now() - last).to_std().unwrap_or_default() >= interval,
                None => true,
            };
            if due {
                self.generate_and_submit_tasks().await;
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(tick).await;
            }
        }
    }

    /// Run all generation rules against a fresh state snapshot and submit
    /// what they produce. Returns how many tasks were submitted.
    pub async fn generate_and_submit_tasks(&self) -> usize {
        let state = self.system_state().await;
        let tasks = self.generator.read().await.generate_tasks(&state);
        *self.last_generation.lock().await = Some(Utc::now());

        let mut submitted = 0;
        for task in tasks {
            let name = task.name.clone();
            match self.scheduler.submit(task).await {
                Ok(()) => submitted += 1,
                Err(e) => tracing::warn!("⚠️ Generated task '{}' rejected: {}", name, e),
            }
        }
        if submitted > 0 {
            tracing::info!("🧩 Generation pass submitted {} task(s)", submitted);
        }
        submitted
    }

    /// Snapshot handed to generation rules.
    pub async fn system_state(&self) -> SystemState {
        let started_at = *self.started_at.lock().await;
        let mut state = SystemState::new(started_at);
        state.last_backup = self.scheduler.last_completed(TaskType::DataBackup).await;
        state.last_maintenance = self.scheduler.last_completed(TaskType::Maintenance).await;
        state.recent_health_checks = self
            .scheduler
            .recent_finished(TaskType::SystemHealth, HEALTH_HISTORY)
            .await
            .into_iter()
            .map(|f| HealthCheckOutcome {
                success: f.task.status == TaskStatus::Completed,
                task_id: f.task.id,
                finished_at: f.result.end_time,
            })
            .collect();
        state.queue_size = self.scheduler.queue_size().await;
        state.running_count = self.scheduler.running_count().await;
        state.extra = self.extra_state.read().await.clone();
        state
    }

    pub async fn get_status(&self) -> SystemStatus {
        let stats = self.scheduler.stats().await;
        let running = self.is_running();
        let uptime_secs = if running {
            (Utc::now() - *self.started_at.lock().await).num_seconds().max(0) as u64
        } else {
            0
        };
        SystemStatus {
            running,
            uptime_secs,
            queue_size: stats.queue_size,
            running_count: stats.running,
            completed_count: stats.completed,
            failed_count: stats.failed,
            mean_execution_time_ms: stats.mean_execution_time_ms,
            last_generation_time: *self.last_generation.lock().await,
            scheduler: stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::FnRule;
    use crate::handlers::{BlockingHandler, task_fn};

    fn quiet_config() -> OverwatchConfig {
        let mut config = OverwatchConfig::default();
        config.generator.builtin_rules = false;
        config.scheduler.poll_interval_ms = 10;
        config.scheduler.retry_jitter = 0.0;
        config
    }

    async fn wait_for_completed(system: &OverwatchSystem, count: u64) {
        for _ in 0..200 {
            if system.get_status().await.completed_count >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("tasks did not complete in time");
    }

    #[tokio::test]
    async fn test_create_task_submits() {
        let system = OverwatchSystem::new(quiet_config());
        let mut metadata = HashMap::new();
        metadata.insert("vin".to_string(), serde_json::json!("1HGCM82633A004352"));
        let task = system
            .create_task(
                "scan",
                "Read trouble codes",
                TaskType::Obd2Diagnostic,
                TaskPriority::High,
                "obd2",
                metadata,
            )
            .await
            .unwrap();
        assert_eq!(task.context.subsystem, "obd2");
        assert_eq!(task.context.metadata["vin"], "1HGCM82633A004352");
        assert_eq!(system.get_status().await.queue_size, 1);
    }

    #[tokio::test]
    async fn test_start_runs_generation_and_dispatch() {
        let system = OverwatchSystem::new(quiet_config());
        system
            .add_generation_rule(Box::new(FnRule::new("user", |_state: &SystemState| {
                Ok(vec![Task::new("generated", "", TaskType::UserTask)])
            })))
            .await;
        system
            .register_task_handler(
                TaskType::UserTask,
                Arc::new(BlockingHandler::new(
                    "user",
                    &[TaskType::UserTask],
                    system.blocking_pool(),
                    |_task| Ok(serde_json::json!("done")),
                )),
            )
            .await;

        system.start().await;
        wait_for_completed(&system, 1).await;
        let status = system.get_status().await;
        assert!(status.running);
        assert!(status.last_generation_time.is_some());
        system.stop().await;
        assert!(!system.get_status().await.running);
    }

    #[tokio::test]
    async fn test_subsystem_handler_through_facade() {
        let system = OverwatchSystem::new(quiet_config());
        system
            .register_subsystem_handler(
                "cache",
                task_fn(|task: Task| async move { Ok::<_, String>(serde_json::json!({ "flushed": task.name })) }),
            )
            .await;
        system.start().await;
        system
            .create_task("flush", "", TaskType::Custom, TaskPriority::Normal, "cache", HashMap::new())
            .await
            .unwrap();
        wait_for_completed(&system, 1).await;
        system.stop().await;
    }

    #[tokio::test]
    async fn test_system_state_tracks_health_outcomes() {
        let system = OverwatchSystem::new(quiet_config());
        system
            .register_task_handler(
                TaskType::SystemHealth,
                Arc::new(BlockingHandler::new(
                    "health",
                    &[TaskType::SystemHealth],
                    system.blocking_pool(),
                    |_task| Err("cpu overheated".to_string()),
                )),
            )
            .await;
        let task = Task::new("health", "", TaskType::SystemHealth).with_retries(0, 0);
        system.scheduler().execute(task).await;

        system.set_state_value("cpu_temp", serde_json::json!(91)).await;
        let state = system.system_state().await;
        assert_eq!(state.recent_health_checks.len(), 1);
        assert_eq!(state.failing_health_streak(), 1);
        assert_eq!(state.extra["cpu_temp"], 91);
        assert!(state.last_backup.is_none());
    }

    #[tokio::test]
    async fn test_run_forever_exits_on_stop() {
        let mut config = quiet_config();
        config.scheduler.generation_interval_secs = 0;
        let system = Arc::new(OverwatchSystem::new(config));
        system.start().await;

        let runner = {
            let system = system.clone();
            tokio::spawn(async move { system.run_forever().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        system.stop().await;
        tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .expect("run_forever should exit")
            .unwrap();
    }
}

//! TaskBotEngine: matches queued tasks to registered bots and tracks the
//! lifecycle of every assignment.
//!
//! ## Architecture
//! ```text
//! queue_task(task) → FIFO queue
//!   → assignment loop (tokio task)
//!     → no bot declares the type + OverwatchSystem attached → scheduler
//!     → assign_task: eligible bots (sorted by id) → strategy.select → TaskAssignment
//!     → nothing eligible → back of the queue, back off
//! health loop → check_health_at(now): silent bots OFFLINE, their work FAILED + re-queued
//! stats loop  → utilization = current_tasks / max_concurrent_tasks
//! ```
//!
//! Bots and assignments live behind one mutex. A bot's `current_tasks` always
//! equals the task ids of its non-terminal assignments. Finished assignments
//! move to a bounded history.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, Utc};
use overwatch_core::config::BotEngineConfig;
use overwatch_core::error::{OverwatchError, Result};
use overwatch_scheduler::system::OverwatchSystem;
use overwatch_scheduler::tasks::{Task, TaskResult, TaskStatus};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::assignment::TaskAssignment;
use crate::bot::{Bot, BotStatus};
use crate::scoring::can_handle_task;
use crate::strategy::{AssignmentStrategy, SelectionContext, StrategyRegistry};

const DISCONNECTED: &str = "bot disconnected";
const UNREGISTERED: &str = "bot unregistered";

/// Fleet-wide counters.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub strategy: String,
    pub total_bots: usize,
    pub online_bots: usize,
    pub busy_bots: usize,
    pub offline_bots: usize,
    pub queued_tasks: usize,
    pub total_assignments: u64,
    pub active_assignments: usize,
    pub completed_assignments: u64,
    pub failed_assignments: u64,
    pub cancelled_assignments: u64,
    /// Running mean of task creation → assignment, in milliseconds.
    pub mean_assignment_latency_ms: f64,
    pub average_utilization: f64,
}

/// Per-bot view.
#[derive(Debug, Clone, Serialize)]
pub struct BotStats {
    pub bot_id: String,
    pub name: String,
    pub status: BotStatus,
    pub current_tasks: usize,
    pub max_concurrent_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    /// Completed over finished, 0.0 before anything finished.
    pub success_rate: f64,
    pub utilization: f64,
    pub last_seen: DateTime<Utc>,
    pub last_task_completed: Option<DateTime<Utc>>,
}

/// What one pass over the queue did.
#[derive(Debug, Clone)]
pub enum QueueOutcome {
    /// Queue was empty.
    Empty,
    /// Head task got an assignment.
    Assigned(TaskAssignment),
    /// No bot declares the task type; it went to the scheduler.
    HandedOff(String),
    /// No eligible bot right now; task moved to the back.
    Deferred(String),
    /// Every queued task is waiting out a retry delay.
    Waiting,
}

#[derive(Default)]
struct EngineState {
    bots: HashMap<String, Bot>,
    /// Non-terminal only.
    assignments: HashMap<String, TaskAssignment>,
    /// Oldest first, capped at `history_limit`.
    finished: VecDeque<TaskAssignment>,
    history_limit: usize,
    total_assignments: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    mean_latency_ms: f64,
}

impl EngineState {
    fn active_for_bot(&self, bot_id: &str) -> Vec<String> {
        self.assignments
            .values()
            .filter(|a| a.bot_id == bot_id)
            .map(|a| a.id.clone())
            .collect()
    }

    fn find_finished(&self, assignment_id: &str) -> Option<&TaskAssignment> {
        self.finished.iter().rev().find(|a| a.id == assignment_id)
    }

    fn is_assigned(&self, task_id: &str) -> bool {
        self.bots.values().any(|b| b.current_tasks.contains(task_id))
    }

    /// Close an active assignment and release its slot on the bot.
    /// Returns the task snapshot for re-queueing.
    fn finalize(&mut self, assignment_id: &str, result: TaskResult, notes: Option<&str>) -> Option<Task> {
        let mut assignment = self.assignments.remove(assignment_id)?;
        assignment.finalize(result, notes);
        let status = assignment.status;
        let bot_id = assignment.bot_id.clone();
        let task = assignment.task.clone();

        self.finished.push_back(assignment);
        while self.finished.len() > self.history_limit {
            self.finished.pop_front();
        }

        match status {
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
            _ => self.failed += 1,
        }

        if let Some(bot) = self.bots.get_mut(&bot_id) {
            bot.current_tasks.remove(&task.id);
            match status {
                TaskStatus::Completed => {
                    bot.completed_tasks += 1;
                    bot.last_task_completed = Some(Utc::now());
                }
                TaskStatus::Failed => bot.failed_tasks += 1,
                _ => {}
            }
            if matches!(bot.status, BotStatus::Busy | BotStatus::Online | BotStatus::Idle) {
                bot.status = if bot.current_tasks.is_empty() {
                    BotStatus::Idle
                } else {
                    BotStatus::Online
                };
            }
        }
        Some(task)
    }
}

/// Scored bot assignment with health monitoring.
pub struct TaskBotEngine {
    config: BotEngineConfig,
    state: Mutex<EngineState>,
    queue: Mutex<VecDeque<Task>>,
    strategies: RwLock<StrategyRegistry>,
    strategy: RwLock<Arc<dyn AssignmentStrategy>>,
    overwatch: Option<Arc<OverwatchSystem>>,
    running: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskBotEngine {
    /// Fails with `Validation` when `config.strategy` is not a built-in strategy.
    pub fn new(config: BotEngineConfig) -> Result<Self> {
        let strategies = StrategyRegistry::with_builtins();
        let strategy = strategies.get(&config.strategy)?;
        let state = EngineState {
            history_limit: config.assignment_history_limit.max(1),
            ..EngineState::default()
        };
        Ok(Self {
            config,
            state: Mutex::new(state),
            queue: Mutex::new(VecDeque::new()),
            strategies: RwLock::new(strategies),
            strategy: RwLock::new(strategy),
            overwatch: None,
            running: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Tasks no registered bot can run are handed to `system`'s scheduler.
    pub fn with_overwatch(mut self, system: Arc<OverwatchSystem>) -> Self {
        self.overwatch = Some(system);
        self
    }

    pub fn config(&self) -> &BotEngineConfig {
        &self.config
    }

    // ── Bot registry ──────────────────────────────────────

    pub async fn register_bot(&self, mut bot: Bot) -> Result<String> {
        let mut state = self.state.lock().await;
        if state.bots.contains_key(&bot.id) {
            return Err(OverwatchError::validation(format!("bot '{}' is already registered", bot.id)));
        }
        bot.status = BotStatus::Online;
        bot.last_seen = Utc::now();
        bot.current_tasks.clear();
        bot.utilization = 0.0;
        tracing::info!(
            "🤖 Bot registered: {} ({:?}, {} capabilities, max {})",
            bot.name,
            bot.bot_type,
            bot.capabilities.len(),
            bot.max_concurrent_tasks
        );
        let id = bot.id.clone();
        state.bots.insert(id.clone(), bot);
        Ok(id)
    }

    /// Remove a bot. Pending assignments are cancelled, running ones failed,
    /// and every affected task goes back on the queue.
    pub async fn unregister_bot(&self, bot_id: &str) -> Result<()> {
        let requeue = {
            let mut state = self.state.lock().await;
            if !state.bots.contains_key(bot_id) {
                return Err(OverwatchError::not_found(format!("bot '{bot_id}'")));
            }
            let mut requeue = Vec::new();
            for assignment_id in state.active_for_bot(bot_id) {
                let Some(assignment) = state.assignments.get(&assignment_id) else {
                    continue;
                };
                let result = if assignment.status == TaskStatus::Pending {
                    TaskResult::cancelled(&assignment.task_id, UNREGISTERED)
                } else {
                    let start = assignment.started_at.unwrap_or(assignment.assigned_at);
                    TaskResult::failure(&assignment.task_id, UNREGISTERED, start)
                };
                if let Some(task) = state.finalize(&assignment_id, result, Some(UNREGISTERED)) {
                    requeue.push(task);
                }
            }
            if let Some(bot) = state.bots.remove(bot_id) {
                tracing::info!("👋 Bot unregistered: {} ({} task(s) re-queued)", bot.name, requeue.len());
            }
            requeue
        };

        self.requeue_all(requeue).await;
        Ok(())
    }

    pub async fn update_bot_status(&self, bot_id: &str, status: BotStatus) -> Result<()> {
        let mut state = self.state.lock().await;
        let bot = state
            .bots
            .get_mut(bot_id)
            .ok_or_else(|| OverwatchError::not_found(format!("bot '{bot_id}'")))?;
        if bot.status != status {
            tracing::debug!("🤖 Bot {} status {} → {}", bot.name, bot.status, status);
        }
        bot.status = status;
        bot.last_seen = Utc::now();
        Ok(())
    }

    pub async fn heartbeat(&self, bot_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let bot = state
            .bots
            .get_mut(bot_id)
            .ok_or_else(|| OverwatchError::not_found(format!("bot '{bot_id}'")))?;
        bot.last_seen = Utc::now();
        Ok(())
    }

    /// Bots sorted by id.
    pub async fn list_bots(&self) -> Vec<Bot> {
        let state = self.state.lock().await;
        let mut bots: Vec<Bot> = state.bots.values().cloned().collect();
        bots.sort_by(|a, b| a.id.cmp(&b.id));
        bots
    }

    // ── Strategies ────────────────────────────────────────

    pub async fn set_strategy(&self, name: &str) -> Result<()> {
        let strategy = self.strategies.read().await.get(name)?;
        tracing::info!("🎯 Assignment strategy: {}", name);
        *self.strategy.write().await = strategy;
        Ok(())
    }

    /// Make a custom strategy selectable by name.
    pub async fn register_strategy(&self, strategy: Arc<dyn AssignmentStrategy>) {
        tracing::info!("🎯 Strategy registered: {}", strategy.name());
        self.strategies.write().await.register(strategy);
    }

    pub async fn strategy_name(&self) -> String {
        self.strategy.read().await.name().to_string()
    }

    // ── Assignment lifecycle ──────────────────────────────

    pub async fn queue_task(&self, task: Task) {
        tracing::debug!("📥 Bot queue: '{}' ({}, {})", task.name, task.task_type, task.priority);
        self.queue.lock().await.push_back(task);
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Assign `task` to `bot_id`, or to the strategy's pick when `None`.
    /// Returns `None` when no eligible bot exists.
    pub async fn assign_task(&self, task: &Task, bot_id: Option<&str>) -> Option<TaskAssignment> {
        let strategy = self.strategy.read().await.clone();
        let mut state = self.state.lock().await;

        if state.is_assigned(&task.id) {
            tracing::warn!("⚠️ Task '{}' already has an active assignment", task.name);
            return None;
        }

        let chosen = match bot_id {
            Some(id) => state
                .bots
                .get(id)
                .filter(|bot| can_handle_task(bot, task))
                .map(|bot| bot.id.clone()),
            None => {
                let mut eligible: Vec<&Bot> = state
                    .bots
                    .values()
                    .filter(|bot| can_handle_task(bot, task))
                    .collect();
                eligible.sort_by(|a, b| a.id.cmp(&b.id));
                let ctx = SelectionContext {
                    now: Utc::now(),
                    total_assignments: state.total_assignments,
                    recent_window: Duration::seconds(self.config.recent_completion_window_secs as i64),
                };
                strategy.select(task, &eligible, &ctx)
            }
        };

        let Some(chosen) = chosen else {
            tracing::debug!("{}", OverwatchError::NoEligibleBot(task.name.clone()));
            return None;
        };
        let bot = state.bots.get_mut(&chosen).filter(|bot| can_handle_task(bot, task))?;

        let assignment = TaskAssignment::new(task, &bot.id);
        bot.current_tasks.insert(task.id.clone());
        if !bot.has_capacity() {
            bot.status = BotStatus::Busy;
        }
        tracing::info!("📌 Task '{}' → bot {}", task.name, bot.name);

        state.total_assignments += 1;
        let latency_ms = (assignment.assigned_at - task.created_at).num_milliseconds().max(0) as f64;
        let n = state.total_assignments as f64;
        state.mean_latency_ms += (latency_ms - state.mean_latency_ms) / n;
        state
            .assignments
            .insert(assignment.id.clone(), assignment.clone());
        Some(assignment)
    }

    /// The bot reports it began working on an assignment.
    pub async fn start_assignment(&self, assignment_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.find_finished(assignment_id).is_some() {
            return Err(OverwatchError::validation(format!(
                "assignment '{assignment_id}' is already finalized"
            )));
        }
        let assignment = state
            .assignments
            .get_mut(assignment_id)
            .ok_or_else(|| OverwatchError::not_found(format!("assignment '{assignment_id}'")))?;
        if assignment.status != TaskStatus::Pending {
            return Err(OverwatchError::validation(format!(
                "assignment '{assignment_id}' is {:?}, not Pending",
                assignment.status
            )));
        }
        assignment.status = TaskStatus::Running;
        assignment.started_at = Some(Utc::now());
        assignment.task.status = TaskStatus::Running;
        let bot_id = assignment.bot_id.clone();
        if let Some(bot) = state.bots.get_mut(&bot_id) {
            bot.last_seen = Utc::now();
        }
        Ok(())
    }

    /// Finalize an assignment with the bot's result. A failed task with
    /// retries left is queued again, due after its `retry_delay_ms`.
    pub async fn complete_assignment(&self, assignment_id: &str, result: TaskResult) -> Result<()> {
        if !result.status.is_terminal() {
            return Err(OverwatchError::validation(format!(
                "cannot complete an assignment with status {:?}",
                result.status
            )));
        }

        let retry = {
            let mut state = self.state.lock().await;
            if state.find_finished(assignment_id).is_some() {
                return Err(OverwatchError::validation(format!(
                    "assignment '{assignment_id}' is already finalized"
                )));
            }
            let assignment = state
                .assignments
                .get(assignment_id)
                .ok_or_else(|| OverwatchError::not_found(format!("assignment '{assignment_id}'")))?;
            let bot_id = assignment.bot_id.clone();
            let status = result.status;
            if let Some(bot) = state.bots.get_mut(&bot_id) {
                bot.last_seen = Utc::now();
            }
            let task = state.finalize(assignment_id, result, None);
            tracing::debug!("✅ Assignment {} finished: {:?}", assignment_id, status);

            task.filter(|t| status == TaskStatus::Failed && t.can_retry())
                .map(|mut t| {
                    t.retry_count += 1;
                    if t.retry_delay_ms > 0 {
                        t.scheduled_at = Some(Utc::now() + Duration::milliseconds(t.retry_delay_ms as i64));
                    }
                    t
                })
        };

        if let Some(task) = retry {
            tracing::info!(
                "🔁 Re-queueing '{}' (attempt {}/{})",
                task.name,
                task.retry_count + 1,
                task.max_retries + 1
            );
            self.requeue_all(vec![task]).await;
        }
        Ok(())
    }

    /// Active assignments, or finished ones still in the history.
    pub async fn get_assignment(&self, assignment_id: &str) -> Option<TaskAssignment> {
        let state = self.state.lock().await;
        state
            .assignments
            .get(assignment_id)
            .or_else(|| state.find_finished(assignment_id))
            .cloned()
    }

    /// Finished assignments still retained, oldest first.
    pub async fn finished_assignments(&self) -> Vec<TaskAssignment> {
        self.state.lock().await.finished.iter().cloned().collect()
    }

    /// Non-terminal assignments held by `bot_id`.
    pub async fn active_assignments(&self, bot_id: &str) -> Vec<TaskAssignment> {
        let state = self.state.lock().await;
        state
            .assignments
            .values()
            .filter(|a| a.bot_id == bot_id)
            .cloned()
            .collect()
    }

    async fn requeue_all(&self, tasks: Vec<Task>) {
        if tasks.is_empty() {
            return;
        }
        let mut queue = self.queue.lock().await;
        for mut task in tasks {
            task.status = TaskStatus::Pending;
            queue.push_back(task);
        }
    }

    /// Take the first due task off the queue and try to place it.
    pub async fn process_queue_once(&self) -> QueueOutcome {
        let task = {
            let mut queue = self.queue.lock().await;
            if queue.is_empty() {
                return QueueOutcome::Empty;
            }
            let now = Utc::now();
            let Some(task) = queue
                .iter()
                .position(|t| t.is_due(now))
                .and_then(|pos| queue.remove(pos))
            else {
                return QueueOutcome::Waiting;
            };
            task
        };

        if let Some(system) = &self.overwatch {
            let declared = self
                .state
                .lock()
                .await
                .bots
                .values()
                .any(|bot| bot.supports(task.task_type));
            if !declared {
                let task_id = task.id.clone();
                tracing::debug!("🔀 No bot handles {}; '{}' → scheduler", task.task_type, task.name);
                if let Err(e) = system.submit_task(task).await {
                    tracing::warn!("⚠️ Scheduler rejected handed-off task {}: {}", task_id, e);
                }
                return QueueOutcome::HandedOff(task_id);
            }
        }

        match self.assign_task(&task, None).await {
            Some(assignment) => QueueOutcome::Assigned(assignment),
            None => {
                let task_id = task.id.clone();
                self.queue.lock().await.push_back(task);
                QueueOutcome::Deferred(task_id)
            }
        }
    }

    // ── Health & statistics ───────────────────────────────

    /// Mark bots silent since before `now - bot_timeout` offline and fail
    /// their open assignments. Affected tasks are re-queued with their retry
    /// count untouched. Returns the ids of bots marked offline.
    pub async fn check_health_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = Duration::seconds(self.config.bot_timeout_secs as i64);
        let (offline, requeue) = {
            let mut state = self.state.lock().await;
            let stale: Vec<String> = state
                .bots
                .values()
                .filter(|bot| now - bot.last_seen > timeout)
                .filter(|bot| bot.status != BotStatus::Offline || !bot.current_tasks.is_empty())
                .map(|bot| bot.id.clone())
                .collect();

            let mut requeue = Vec::new();
            for bot_id in &stale {
                if let Some(bot) = state.bots.get_mut(bot_id) {
                    tracing::warn!(
                        "💔 Bot {} silent for {}s, marking offline",
                        bot.name,
                        (now - bot.last_seen).num_seconds()
                    );
                    bot.status = BotStatus::Offline;
                }
                for assignment_id in state.active_for_bot(bot_id) {
                    let Some(assignment) = state.assignments.get(&assignment_id) else {
                        continue;
                    };
                    let start = assignment.started_at.unwrap_or(assignment.assigned_at);
                    let result = TaskResult::failure(&assignment.task_id, DISCONNECTED, start);
                    if let Some(task) = state.finalize(&assignment_id, result, Some(DISCONNECTED)) {
                        requeue.push(task);
                    }
                }
            }
            (stale, requeue)
        };

        self.requeue_all(requeue).await;
        offline
    }

    pub async fn update_utilization(&self) {
        let mut state = self.state.lock().await;
        for bot in state.bots.values_mut() {
            bot.utilization = bot.compute_utilization();
        }
    }

    pub async fn get_system_stats(&self) -> EngineStats {
        let strategy = self.strategy_name().await;
        let queued_tasks = self.queue_len().await;
        let state = self.state.lock().await;

        let count = |status: BotStatus| state.bots.values().filter(|b| b.status == status).count();
        let average_utilization = if state.bots.is_empty() {
            0.0
        } else {
            state.bots.values().map(Bot::compute_utilization).sum::<f64>() / state.bots.len() as f64
        };

        EngineStats {
            strategy,
            total_bots: state.bots.len(),
            online_bots: count(BotStatus::Online) + count(BotStatus::Idle),
            busy_bots: count(BotStatus::Busy),
            offline_bots: count(BotStatus::Offline),
            queued_tasks,
            total_assignments: state.total_assignments,
            active_assignments: state.assignments.len(),
            completed_assignments: state.completed,
            failed_assignments: state.failed,
            cancelled_assignments: state.cancelled,
            mean_assignment_latency_ms: state.mean_latency_ms,
            average_utilization,
        }
    }

    pub async fn get_bot_stats(&self, bot_id: &str) -> Option<BotStats> {
        let state = self.state.lock().await;
        let bot = state.bots.get(bot_id)?;
        let finished = bot.completed_tasks + bot.failed_tasks;
        Some(BotStats {
            bot_id: bot.id.clone(),
            name: bot.name.clone(),
            status: bot.status,
            current_tasks: bot.current_tasks.len(),
            max_concurrent_tasks: bot.max_concurrent_tasks,
            completed_tasks: bot.completed_tasks,
            failed_tasks: bot.failed_tasks,
            success_rate: if finished == 0 {
                0.0
            } else {
                bot.completed_tasks as f64 / finished as f64
            },
            utilization: bot.utilization,
            last_seen: bot.last_seen,
            last_task_completed: bot.last_task_completed,
        })
    }

    // ── Background loops ──────────────────────────────────

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the assignment, health and statistics loops.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("🚀 Bot engine started (strategy: {})", self.strategy_name().await);

        let engine = self.clone();
        let assignment = tokio::spawn(async move {
            while engine.is_running() {
                match engine.process_queue_once().await {
                    QueueOutcome::Empty | QueueOutcome::Waiting => {
                        tokio::time::sleep(engine.config.assignment_poll()).await
                    }
                    QueueOutcome::Deferred(_) => {
                        tokio::time::sleep(engine.config.assignment_backoff()).await
                    }
                    QueueOutcome::Assigned(_) | QueueOutcome::HandedOff(_) => {}
                }
            }
            tracing::info!("🛑 Assignment loop exited");
        });

        let engine = self.clone();
        let health = tokio::spawn(async move {
            while engine.is_running() {
                tokio::time::sleep(engine.config.health_check_interval()).await;
                if !engine.is_running() {
                    break;
                }
                engine.check_health_at(Utc::now()).await;
            }
        });

        let engine = self.clone();
        let stats = tokio::spawn(async move {
            while engine.is_running() {
                engine.update_utilization().await;
                tokio::time::sleep(engine.config.stats_interval()).await;
            }
        });

        self.handles.lock().await.extend([assignment, health, stats]);
    }

    /// Stop the loops. Each is joined with a bounded timeout, then aborted.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        let join_timeout = self.config.join_timeout();
        for mut handle in handles {
            if tokio::time::timeout(join_timeout, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        tracing::info!("🛑 Bot engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::{BotCapability, BotType};
    use crate::strategy::BestFitStrategy;
    use overwatch_core::config::OverwatchConfig;
    use overwatch_scheduler::tasks::{TaskPriority, TaskType};
    use std::collections::HashSet;

    fn config() -> BotEngineConfig {
        BotEngineConfig {
            assignment_poll_ms: 10,
            assignment_backoff_ms: 20,
            health_check_interval_secs: 3600,
            stats_interval_secs: 1,
            join_timeout_secs: 1,
            ..BotEngineConfig::default()
        }
    }

    fn engine() -> TaskBotEngine {
        TaskBotEngine::new(config()).unwrap()
    }

    fn worker(id: &str, max: usize) -> Bot {
        Bot::new(id, id, BotType::Worker)
            .with_capability(BotCapability::new("user", &[TaskType::UserTask]))
            .with_max_concurrent(max)
    }

    fn user_task(name: &str) -> Task {
        Task::new(name, "", TaskType::UserTask)
    }

    /// Every bot's `current_tasks` matches its open assignments.
    async fn assert_consistent(engine: &TaskBotEngine) {
        let state = engine.state.lock().await;
        for bot in state.bots.values() {
            let open: HashSet<String> = state
                .assignments
                .values()
                .filter(|a| a.bot_id == bot.id && a.is_active())
                .map(|a| a.task_id.clone())
                .collect();
            assert_eq!(bot.current_tasks, open, "bot {}", bot.id);
        }
    }

    #[tokio::test]
    async fn test_single_slot_bot_rejects_second_task() {
        let engine = engine();
        engine.register_bot(worker("x", 1)).await.unwrap();

        let first = user_task("one");
        let assignment = engine.assign_task(&first, None).await.unwrap();
        assert_eq!(assignment.bot_id, "x");
        assert_eq!(assignment.status, TaskStatus::Pending);

        let second = user_task("two");
        let bot = engine.list_bots().await.remove(0);
        assert_eq!(bot.status, BotStatus::Busy);
        assert!(!can_handle_task(&bot, &second));
        assert!(engine.assign_task(&second, None).await.is_none());
        assert_consistent(&engine).await;
    }

    #[tokio::test]
    async fn test_health_monitor_fails_stale_bot_work() {
        let engine = engine();
        engine.register_bot(worker("x", 2)).await.unwrap();
        let task = user_task("long job");
        let assignment = engine.assign_task(&task, None).await.unwrap();
        engine.start_assignment(&assignment.id).await.unwrap();

        // Nothing times out yet.
        assert!(engine.check_health_at(Utc::now()).await.is_empty());

        let offline = engine
            .check_health_at(Utc::now() + Duration::minutes(6))
            .await;
        assert_eq!(offline, vec!["x".to_string()]);

        let finished = engine.get_assignment(&assignment.id).await.unwrap();
        assert_eq!(finished.status, TaskStatus::Failed);
        let result = finished.result.unwrap();
        assert_eq!(result.error_message.as_deref(), Some("bot disconnected"));

        let bot = engine.list_bots().await.remove(0);
        assert_eq!(bot.status, BotStatus::Offline);
        assert!(bot.current_tasks.is_empty());

        // Re-queued without consuming a retry.
        let queued = engine.queue.lock().await.front().cloned().unwrap();
        assert_eq!(queued.id, task.id);
        assert_eq!(queued.retry_count, 0);
        assert_consistent(&engine).await;
    }

    #[tokio::test]
    async fn test_complete_assignment_restores_bot() {
        let engine = engine();
        engine.register_bot(worker("x", 2)).await.unwrap();
        let a1 = engine.assign_task(&user_task("a"), None).await.unwrap();
        let a2 = engine.assign_task(&user_task("b"), None).await.unwrap();
        assert_eq!(engine.list_bots().await[0].status, BotStatus::Busy);

        let done = TaskResult::success(&a1.task_id, serde_json::json!({ "ok": true }), a1.assigned_at);
        engine.complete_assignment(&a1.id, done).await.unwrap();
        let bot = engine.list_bots().await.remove(0);
        assert_eq!(bot.status, BotStatus::Online);
        assert_eq!(bot.completed_tasks, 1);
        assert!(bot.last_task_completed.is_some());

        let failed = TaskResult::failure(&a2.task_id, "crashed", a2.assigned_at);
        engine.complete_assignment(&a2.id, failed).await.unwrap();
        let bot = engine.list_bots().await.remove(0);
        assert_eq!(bot.status, BotStatus::Idle);
        assert_eq!(bot.failed_tasks, 1);

        // Failed with retries left goes back on the queue.
        let queued = engine.queue.lock().await.front().cloned().unwrap();
        assert_eq!(queued.id, a2.task_id);
        assert_eq!(queued.retry_count, 1);

        let again = TaskResult::success(&a1.task_id, serde_json::Value::Null, a1.assigned_at);
        assert!(matches!(
            engine.complete_assignment(&a1.id, again).await,
            Err(OverwatchError::Validation(_))
        ));

        let stats = engine.get_bot_stats("x").await.unwrap();
        assert_eq!(stats.success_rate, 0.5);
        assert_consistent(&engine).await;
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_not_requeued() {
        let engine = engine();
        engine.register_bot(worker("x", 1)).await.unwrap();
        let task = user_task("flaky").with_retries(0, 0);
        let a = engine.assign_task(&task, None).await.unwrap();
        let failed = TaskResult::failure(&task.id, "nope", a.assigned_at);
        engine.complete_assignment(&a.id, failed).await.unwrap();
        assert_eq!(engine.queue_len().await, 0);
        assert_eq!(engine.get_system_stats().await.failed_assignments, 1);
    }

    #[tokio::test]
    async fn test_finished_assignments_are_bounded() {
        let engine = TaskBotEngine::new(BotEngineConfig {
            assignment_history_limit: 10,
            ..config()
        })
        .unwrap();
        engine.register_bot(worker("x", 1)).await.unwrap();

        let mut ids = Vec::new();
        for i in 0..50 {
            let a = engine.assign_task(&user_task(&format!("t{i}")), None).await.unwrap();
            let done = TaskResult::success(&a.task_id, serde_json::Value::Null, a.assigned_at);
            engine.complete_assignment(&a.id, done).await.unwrap();
            ids.push(a.id);
        }

        {
            let state = engine.state.lock().await;
            assert!(state.assignments.is_empty());
            assert_eq!(state.finished.len(), 10);
        }
        assert!(engine.get_assignment(&ids[0]).await.is_none());
        let last = engine.get_assignment(&ids[49]).await.unwrap();
        assert_eq!(last.status, TaskStatus::Completed);
        assert_eq!(engine.finished_assignments().await.len(), 10);

        let stats = engine.get_system_stats().await;
        assert_eq!(stats.completed_assignments, 50);
        assert_eq!(stats.active_assignments, 0);
        assert_consistent(&engine).await;
    }

    #[tokio::test]
    async fn test_failed_assignment_waits_out_retry_delay() {
        let engine = engine();
        engine.register_bot(worker("x", 1)).await.unwrap();
        let task = user_task("flaky").with_retries(2, 60_000);
        let a = engine.assign_task(&task, None).await.unwrap();
        let failed = TaskResult::failure(&task.id, "glitch", a.assigned_at);
        engine.complete_assignment(&a.id, failed).await.unwrap();

        assert!(matches!(engine.process_queue_once().await, QueueOutcome::Waiting));
        assert_eq!(engine.queue_len().await, 1);

        // A due task behind the waiting one is still served.
        let ready = user_task("ready");
        engine.queue_task(ready.clone()).await;
        assert!(matches!(engine.process_queue_once().await, QueueOutcome::Assigned(a) if a.task_id == ready.id));
        assert_eq!(engine.queue_len().await, 1);

        let quick = user_task("quick").with_retries(1, 0);
        let engine = self::engine();
        engine.register_bot(worker("y", 1)).await.unwrap();
        let a = engine.assign_task(&quick, None).await.unwrap();
        let failed = TaskResult::failure(&quick.id, "glitch", a.assigned_at);
        engine.complete_assignment(&a.id, failed).await.unwrap();
        assert!(matches!(engine.process_queue_once().await, QueueOutcome::Assigned(a) if a.task_id == quick.id));
    }

    #[tokio::test]
    async fn test_unregister_requeues_open_work() {
        let engine = engine();
        engine.register_bot(worker("x", 3)).await.unwrap();
        let pending = engine.assign_task(&user_task("p"), None).await.unwrap();
        let running = engine.assign_task(&user_task("r"), None).await.unwrap();
        engine.start_assignment(&running.id).await.unwrap();

        engine.unregister_bot("x").await.unwrap();
        assert!(engine.list_bots().await.is_empty());
        assert_eq!(
            engine.get_assignment(&pending.id).await.unwrap().status,
            TaskStatus::Cancelled
        );
        let failed = engine.get_assignment(&running.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.notes, "bot unregistered");
        assert_eq!(engine.queue_len().await, 2);

        assert!(matches!(
            engine.unregister_bot("x").await,
            Err(OverwatchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_explicit_bot_and_duplicate_assignment() {
        let engine = engine();
        engine.register_bot(worker("a", 2)).await.unwrap();
        engine.register_bot(worker("b", 2)).await.unwrap();
        let task = user_task("pinned");

        let assignment = engine.assign_task(&task, Some("b")).await.unwrap();
        assert_eq!(assignment.bot_id, "b");
        assert!(engine.assign_task(&task, Some("a")).await.is_none());
        assert!(engine.assign_task(&user_task("x"), Some("ghost")).await.is_none());

        let unsupported = Task::new("backup", "", TaskType::DataBackup);
        assert!(engine.assign_task(&unsupported, Some("a")).await.is_none());
        assert!(matches!(
            engine.register_bot(worker("a", 1)).await,
            Err(OverwatchError::Validation(_))
        ));
        assert_consistent(&engine).await;
    }

    #[tokio::test]
    async fn test_strategy_switching() {
        let engine = engine();
        for id in ["a", "b", "c"] {
            engine.register_bot(worker(id, 5)).await.unwrap();
        }
        engine.set_strategy("round_robin").await.unwrap();
        let mut picks = Vec::new();
        for i in 0..3 {
            let a = engine.assign_task(&user_task(&format!("t{i}")), None).await.unwrap();
            picks.push(a.bot_id);
        }
        assert_eq!(picks, vec!["a", "b", "c"]);

        assert!(matches!(
            engine.set_strategy("coin_flip").await,
            Err(OverwatchError::Validation(_))
        ));
        assert_eq!(engine.strategy_name().await, "round_robin");
        assert!(TaskBotEngine::new(BotEngineConfig {
            strategy: "coin_flip".into(),
            ..config()
        })
        .is_err());
    }

    struct AlwaysLast;

    impl AssignmentStrategy for AlwaysLast {
        fn name(&self) -> &str {
            "always_last"
        }

        fn select(&self, _task: &Task, eligible: &[&Bot], _ctx: &SelectionContext) -> Option<String> {
            eligible.last().map(|b| b.id.clone())
        }
    }

    #[tokio::test]
    async fn test_custom_strategy() {
        let engine = engine();
        engine.register_bot(worker("a", 1)).await.unwrap();
        engine.register_bot(worker("z", 1)).await.unwrap();
        engine.register_strategy(Arc::new(AlwaysLast)).await;
        engine.set_strategy("always_last").await.unwrap();
        let a = engine.assign_task(&user_task("t"), None).await.unwrap();
        assert_eq!(a.bot_id, "z");

        engine.register_strategy(Arc::new(BestFitStrategy)).await;
        engine.set_strategy("best_fit").await.unwrap();
        let b = engine.assign_task(&user_task("u"), None).await.unwrap();
        assert_eq!(b.bot_id, "a");
    }

    #[tokio::test]
    async fn test_queue_defers_then_hands_off() {
        let system = Arc::new(OverwatchSystem::new(OverwatchConfig::default()));
        let engine = TaskBotEngine::new(config()).unwrap().with_overwatch(system.clone());
        engine.register_bot(worker("x", 1)).await.unwrap();

        let first = user_task("first").with_priority(TaskPriority::High);
        let second = user_task("second");
        engine.queue_task(first.clone()).await;
        engine.queue_task(second.clone()).await;
        engine.queue_task(Task::new("backup", "", TaskType::DataBackup)).await;

        assert!(matches!(engine.process_queue_once().await, QueueOutcome::Assigned(a) if a.task_id == first.id));
        assert!(matches!(engine.process_queue_once().await, QueueOutcome::Deferred(id) if id == second.id));
        assert!(matches!(engine.process_queue_once().await, QueueOutcome::HandedOff(_)));
        assert_eq!(system.scheduler().queue_size().await, 1);

        // The deferred task is back at the head.
        assert_eq!(engine.queue_len().await, 1);
        assert_eq!(engine.queue.lock().await.front().unwrap().id, second.id);
    }

    #[tokio::test]
    async fn test_loops_assign_and_stop() {
        let engine = Arc::new(engine());
        engine.register_bot(worker("x", 4)).await.unwrap();
        for i in 0..3 {
            engine.queue_task(user_task(&format!("job{i}"))).await;
        }

        engine.start().await;
        assert!(engine.is_running());
        let mut assigned = 0;
        for _ in 0..200 {
            assigned = engine.get_system_stats().await.total_assignments;
            if assigned == 3 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        engine.stop().await;
        assert!(!engine.is_running());
        assert_eq!(assigned, 3);

        engine.update_utilization().await;
        let stats = engine.get_bot_stats("x").await.unwrap();
        assert_eq!(stats.current_tasks, 3);
        assert_eq!(stats.utilization, 0.75);

        let system = engine.get_system_stats().await;
        assert_eq!(system.active_assignments, 3);
        assert_eq!(system.queued_tasks, 0);
        assert!(system.mean_assignment_latency_ms >= 0.0);
        assert_consistent(&engine).await;
    }
}

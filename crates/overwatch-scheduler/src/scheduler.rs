//! Priority Task Scheduler: two-tier ready/delayed queues, handler
//! execution, bounded history and retries.
//!
//! ```text
//! submit(task) ──due?──► ready heap   (priority, created_at, seq)
//!        │                    ▲
//!        └──future──► delayed set ──promote_due(now)──┘
//!
//! next_ready() ──cap ok?──► running ──execute──► completed / failed history
//!                                         └──retryable failure──► delayed set
//! ```
//!
//! All queue, running and history state sits behind one mutex and is only
//! touched by methods on [`TaskScheduler`].

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use overwatch_core::config::SchedulerConfig;
use overwatch_core::error::{OverwatchError, Result};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::handlers::{HandlerRegistry, TaskHandler, panic_message};
use crate::tasks::{Task, TaskPriority, TaskResult, TaskStatus, TaskType};

/// A ready task with its ordering key.
struct QueuedTask {
    priority: TaskPriority,
    created_at: DateTime<Utc>,
    seq: u64,
    task: Task,
}

impl QueuedTask {
    fn key(&self) -> (TaskPriority, DateTime<Utc>, u64) {
        (self.priority, self.created_at, self.seq)
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // BinaryHeap is a max-heap; invert so the smallest key pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

/// A task that left the scheduler, with its final result.
#[derive(Debug, Clone, Serialize)]
pub struct FinishedTask {
    pub task: Task,
    pub result: TaskResult,
}

/// Scheduler counters and gauges.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
    /// Ready plus delayed.
    pub queue_size: usize,
    pub delayed: usize,
    pub running: usize,
    pub max_concurrent_tasks: usize,
    pub mean_execution_time_ms: f64,
}

#[derive(Default)]
struct SchedulerState {
    ready: BinaryHeap<QueuedTask>,
    delayed: BTreeMap<(DateTime<Utc>, u64), Task>,
    running: HashMap<String, Task>,
    completed: VecDeque<FinishedTask>,
    failed: VecDeque<FinishedTask>,
    durations: VecDeque<u64>,
    last_completed: HashMap<TaskType, DateTime<Utc>>,
    seq: u64,
    submitted: u64,
    completed_count: u64,
    failed_count: u64,
    retried: u64,
    cancelled: u64,
}

impl SchedulerState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn enqueue(&mut self, mut task: Task, now: DateTime<Utc>) {
        let seq = self.next_seq();
        match task.scheduled_at {
            Some(at) if at > now => {
                self.delayed.insert((at, seq), task);
            }
            _ => {
                task.status = TaskStatus::Pending;
                self.ready.push(QueuedTask {
                    priority: task.priority,
                    created_at: task.created_at,
                    seq,
                    task,
                });
            }
        }
    }

    fn is_queued(&self, task_id: &str) -> bool {
        self.ready.iter().any(|q| q.task.id == task_id)
            || self.delayed.values().any(|t| t.id == task_id)
    }

    fn promote_due(&mut self, now: DateTime<Utc>) -> usize {
        let due: Vec<_> = self
            .delayed
            .range(..=(now, u64::MAX))
            .map(|(k, _)| *k)
            .collect();
        for key in &due {
            if let Some(mut task) = self.delayed.remove(key) {
                task.status = TaskStatus::Pending;
                self.ready.push(QueuedTask {
                    priority: task.priority,
                    created_at: task.created_at,
                    seq: key.1,
                    task,
                });
            }
        }
        due.len()
    }

    fn push_bounded(history: &mut VecDeque<FinishedTask>, entry: FinishedTask, limit: usize) {
        history.push_back(entry);
        while history.len() > limit {
            history.pop_front();
        }
    }
}

/// The priority scheduler.
pub struct TaskScheduler {
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    handlers: RwLock<HandlerRegistry>,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SchedulerState::default()),
            handlers: RwLock::new(HandlerRegistry::new()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub async fn register_handler(&self, task_type: TaskType, handler: Arc<dyn TaskHandler>) {
        self.handlers.write().await.register(task_type, handler);
    }

    pub async fn register_fallback_handler(&self, handler: Arc<dyn TaskHandler>) {
        self.handlers.write().await.register_fallback(handler);
    }

    /// Queue a task. Due tasks go to the ready heap, future ones to the delayed set.
    /// A task id that is already queued or running is rejected.
    pub async fn submit(&self, task: Task) -> Result<()> {
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Retrying) {
            return Err(OverwatchError::validation(format!(
                "task {} cannot be submitted in status {}",
                task.id, task.status
            )));
        }
        let mut state = self.state.lock().await;
        if state.running.contains_key(&task.id) {
            return Err(OverwatchError::validation(format!(
                "task {} is already running",
                task.id
            )));
        }
        if state.is_queued(&task.id) {
            return Err(OverwatchError::validation(format!(
                "task {} is already queued",
                task.id
            )));
        }
        tracing::debug!(
            "📥 Submit '{}' ({}, priority {}, ready: {}, delayed: {})",
            task.name,
            task.id,
            task.priority,
            state.ready.len(),
            state.delayed.len()
        );
        state.submitted += 1;
        state.enqueue(task, Utc::now());
        Ok(())
    }

    /// Move every delayed task whose time has come into the ready heap.
    pub async fn promote_due(&self) -> usize {
        self.promote_due_at(Utc::now()).await
    }

    pub async fn promote_due_at(&self, now: DateTime<Utc>) -> usize {
        let promoted = self.state.lock().await.promote_due(now);
        if promoted > 0 {
            tracing::debug!("⏫ Promoted {} delayed task(s)", promoted);
        }
        promoted
    }

    /// Pop the most urgent ready task, unless the running set is at capacity.
    /// The returned task is reserved as running.
    pub async fn next_ready(&self) -> Option<Task> {
        let mut state = self.state.lock().await;
        state.promote_due(Utc::now());
        if state.running.len() >= self.config.max_concurrent_tasks {
            return None;
        }
        let mut task = state.ready.pop()?.task;
        task.status = TaskStatus::Running;
        state.running.insert(task.id.clone(), task.clone());
        Some(task)
    }

    /// Execute a task with its resolved handler and record the outcome.
    pub async fn execute(&self, mut task: Task) -> TaskResult {
        let start = Utc::now();
        task.status = TaskStatus::Running;
        self.state
            .lock()
            .await
            .running
            .insert(task.id.clone(), task.clone());

        let resolved = {
            let registry = self.handlers.read().await;
            catch_unwind(AssertUnwindSafe(|| registry.resolve(&task)))
        };
        let (result, retryable) = match resolved {
            Err(payload) => {
                let err = OverwatchError::handler(format!(
                    "handler selection panicked: {}",
                    panic_message(payload.as_ref())
                ));
                tracing::warn!("⚠️ Task '{}': {}", task.name, err);
                (TaskResult::failure(&task.id, err.to_string(), start), false)
            }
            Ok(Some(handler)) => self.run_handler(handler, &task, start).await,
            Ok(None) => {
                let err = OverwatchError::NoHandler(task.task_type.to_string());
                tracing::warn!("⚠️ {} ('{}')", err, task.name);
                (TaskResult::failure(&task.id, err.to_string(), start), false)
            }
        };

        self.finish(task, result.clone(), retryable).await;
        result
    }

    async fn run_handler(
        &self,
        handler: Arc<dyn TaskHandler>,
        task: &Task,
        start: DateTime<Utc>,
    ) -> (TaskResult, bool) {
        if task.is_past_deadline(start) {
            return (TaskResult::failure(&task.id, "deadline exceeded", start), false);
        }

        tracing::debug!("▶️ Executing '{}' with handler '{}'", task.name, handler.name());
        let owned = task.clone();
        let mut join = tokio::spawn(async move { handler.execute(&owned).await });

        let joined = match task.deadline {
            Some(deadline) => {
                let remaining = (deadline - start).to_std().unwrap_or_default();
                match tokio::time::timeout(remaining, &mut join).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        join.abort();
                        tracing::warn!("⏱️ Task '{}' exceeded its deadline", task.name);
                        return (TaskResult::failure(&task.id, "deadline exceeded", start), false);
                    }
                }
            }
            None => join.await,
        };

        match joined {
            Ok(mut result) => {
                result.task_id = task.id.clone();
                (result, true)
            }
            Err(e) => {
                let reason = if e.is_panic() {
                    format!("handler panicked: {}", panic_message(e.into_panic().as_ref()))
                } else {
                    "handler task was cancelled".to_string()
                };
                let err = OverwatchError::handler(reason);
                tracing::warn!("⚠️ Task '{}': {}", task.name, err);
                (TaskResult::failure(&task.id, err.to_string(), start), true)
            }
        }
    }

    /// Record the result of an attempt produced outside [`execute`](Self::execute),
    /// e.g. by a dispatcher subsystem handler. Returns the task's new status.
    pub async fn record_result(&self, task: Task, result: TaskResult) -> TaskStatus {
        self.finish(task, result, true).await
    }

    /// Like [`record_result`](Self::record_result), but a failure is final
    /// and never retried.
    pub async fn record_final_result(&self, task: Task, result: TaskResult) -> TaskStatus {
        self.finish(task, result, false).await
    }

    async fn finish(&self, task: Task, result: TaskResult, retryable: bool) -> TaskStatus {
        let now = Utc::now();
        let limit = self.config.history_limit;
        let mut state = self.state.lock().await;
        let mut task = state.running.remove(&task.id).unwrap_or(task);

        state.durations.push_back(result.execution_time_ms);
        while state.durations.len() > limit {
            state.durations.pop_front();
        }

        match result.status {
            TaskStatus::Completed => {
                task.status = TaskStatus::Completed;
                state.completed_count += 1;
                state.last_completed.insert(task.task_type, result.end_time);
                tracing::info!("✅ Task '{}' completed in {}ms", task.name, result.execution_time_ms);
                SchedulerState::push_bounded(&mut state.completed, FinishedTask { task, result }, limit);
                TaskStatus::Completed
            }
            TaskStatus::Failed if retryable && task.can_retry() => {
                task.retry_count += 1;
                task.status = TaskStatus::Retrying;
                let delay = self.retry_delay(&task);
                task.scheduled_at = Some(now + delay);
                state.retried += 1;
                tracing::warn!(
                    "🔁 Task '{}' failed (attempt {}/{}), retrying in {}ms: {}",
                    task.name,
                    task.retry_count,
                    task.max_retries + 1,
                    delay.num_milliseconds(),
                    result.error_message.as_deref().unwrap_or("unknown error")
                );
                let seq = state.next_seq();
                state.delayed.insert((now + delay, seq), task);
                TaskStatus::Retrying
            }
            TaskStatus::Cancelled => {
                task.status = TaskStatus::Cancelled;
                state.cancelled += 1;
                SchedulerState::push_bounded(&mut state.failed, FinishedTask { task, result }, limit);
                TaskStatus::Cancelled
            }
            _ => {
                task.status = TaskStatus::Failed;
                state.failed_count += 1;
                tracing::warn!(
                    "❌ Task '{}' failed: {}",
                    task.name,
                    result.error_message.as_deref().unwrap_or("unknown error")
                );
                SchedulerState::push_bounded(&mut state.failed, FinishedTask { task, result }, limit);
                TaskStatus::Failed
            }
        }
    }

    /// Delay before the next attempt of a task whose `retry_count` was just bumped.
    fn retry_delay(&self, task: &Task) -> chrono::Duration {
        let base = task.retry_delay_ms as f64;
        let mut delay_ms = if self.config.exponential_backoff {
            let exp = task.retry_count.saturating_sub(1).min(20) as i32;
            base * 2f64.powi(exp)
        } else {
            base
        };
        delay_ms = delay_ms.min(self.config.max_retry_delay().as_millis() as f64);
        let jitter = self.config.retry_jitter;
        if jitter > 0.0 && delay_ms > 0.0 {
            delay_ms *= 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        }
        chrono::Duration::milliseconds(delay_ms.max(0.0) as i64)
    }

    /// Cancel a task that has not started. Running and finished tasks are left alone.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let limit = self.config.history_limit;
        let mut state = self.state.lock().await;

        let mut cancelled = None;
        if let Some(key) = state
            .delayed
            .iter()
            .find(|(_, t)| t.id == task_id)
            .map(|(k, _)| *k)
        {
            cancelled = state.delayed.remove(&key);
        } else if state.ready.iter().any(|q| q.task.id == task_id) {
            let mut remaining = Vec::with_capacity(state.ready.len());
            for queued in std::mem::take(&mut state.ready) {
                if queued.task.id == task_id {
                    cancelled = Some(queued.task);
                } else {
                    remaining.push(queued);
                }
            }
            state.ready = BinaryHeap::from(remaining);
        }

        match cancelled {
            Some(mut task) => {
                task.status = TaskStatus::Cancelled;
                state.cancelled += 1;
                tracing::info!("🚫 Task '{}' cancelled", task.name);
                let result = TaskResult::cancelled(&task.id, "cancelled before start");
                SchedulerState::push_bounded(&mut state.failed, FinishedTask { task, result }, limit);
                true
            }
            None => false,
        }
    }

    /// Current status of a task the scheduler still knows about.
    pub async fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        let state = self.state.lock().await;
        if let Some(task) = state.running.get(task_id) {
            return Some(task.status);
        }
        if let Some(q) = state.ready.iter().find(|q| q.task.id == task_id) {
            return Some(q.task.status);
        }
        if let Some(task) = state.delayed.values().find(|t| t.id == task_id) {
            return Some(task.status);
        }
        state
            .completed
            .iter()
            .chain(state.failed.iter())
            .rev()
            .find(|f| f.task.id == task_id)
            .map(|f| f.task.status)
    }

    pub async fn stats(&self) -> SchedulerStats {
        let state = self.state.lock().await;
        let mean = if state.durations.is_empty() {
            0.0
        } else {
            state.durations.iter().sum::<u64>() as f64 / state.durations.len() as f64
        };
        SchedulerStats {
            submitted: state.submitted,
            completed: state.completed_count,
            failed: state.failed_count,
            retried: state.retried,
            cancelled: state.cancelled,
            queue_size: state.ready.len() + state.delayed.len(),
            delayed: state.delayed.len(),
            running: state.running.len(),
            max_concurrent_tasks: self.config.max_concurrent_tasks,
            mean_execution_time_ms: mean,
        }
    }

    pub async fn queue_size(&self) -> usize {
        let state = self.state.lock().await;
        state.ready.len() + state.delayed.len()
    }

    pub async fn running_count(&self) -> usize {
        self.state.lock().await.running.len()
    }

    pub async fn completed_history(&self) -> Vec<FinishedTask> {
        self.state.lock().await.completed.iter().cloned().collect()
    }

    pub async fn failed_history(&self) -> Vec<FinishedTask> {
        self.state.lock().await.failed.iter().cloned().collect()
    }

    /// When a task of this type last completed successfully.
    pub async fn last_completed(&self, task_type: TaskType) -> Option<DateTime<Utc>> {
        self.state.lock().await.last_completed.get(&task_type).copied()
    }

    /// The `limit` most recent finished tasks of one type, newest first.
    pub async fn recent_finished(&self, task_type: TaskType, limit: usize) -> Vec<FinishedTask> {
        let state = self.state.lock().await;
        let mut recent: Vec<FinishedTask> = state
            .completed
            .iter()
            .chain(state.failed.iter())
            .filter(|f| f.task.task_type == task_type)
            .cloned()
            .collect();
        recent.sort_by(|a, b| b.result.end_time.cmp(&a.result.end_time));
        recent.truncate(limit);
        recent
    }
}

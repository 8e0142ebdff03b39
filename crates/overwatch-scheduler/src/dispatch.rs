//! Task dispatch: the background loop that pulls ready tasks from the
//! scheduler and routes them to a subsystem handler or back to the
//! scheduler's own handler registry.
//!
//! Every pulled task runs on its own tokio task, so polling never waits on a
//! handler. Stopping is cooperative: the loop checks a flag each tick and is
//! joined with a bounded timeout; handlers already running are left to finish.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::handlers::TaskFn;
use crate::scheduler::TaskScheduler;
use crate::tasks::{Task, TaskResult};

/// Routes ready tasks to their executors.
pub struct TaskDispatcher {
    scheduler: Arc<TaskScheduler>,
    subsystem_handlers: Arc<RwLock<HashMap<String, TaskFn>>>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    poll_interval: Duration,
    join_timeout: Duration,
}

impl TaskDispatcher {
    pub fn new(scheduler: Arc<TaskScheduler>) -> Self {
        let poll_interval = scheduler.config().poll_interval();
        let join_timeout = scheduler.config().join_timeout();
        Self {
            scheduler,
            subsystem_handlers: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
            poll_interval,
            join_timeout,
        }
    }

    /// Route every task whose `context.subsystem` equals `name` to `handler`.
    pub async fn register_subsystem_handler(&self, name: &str, handler: TaskFn) {
        tracing::info!("🔌 Subsystem handler registered: '{}'", name);
        self.subsystem_handlers
            .write()
            .await
            .insert(name.to_string(), handler);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the dispatch loop. Calling `start` twice is a no-op.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(
            "🚀 Dispatcher started (poll every {}ms)",
            self.poll_interval.as_millis()
        );

        let scheduler = self.scheduler.clone();
        let handlers = self.subsystem_handlers.clone();
        let running = self.running.clone();
        let poll_interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                if !Self::tick(&scheduler, &handlers).await {
                    tokio::time::sleep(poll_interval).await;
                }
            }
            tracing::info!("🛑 Dispatcher loop exited");
        });
        *self.handle.lock().await = Some(handle);
    }

    /// Stop pulling new work and wait (bounded) for the loop to exit.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.lock().await.take() {
            if tokio::time::timeout(self.join_timeout, handle).await.is_err() {
                tracing::warn!(
                    "⚠️ Dispatcher loop did not exit within {}s",
                    self.join_timeout.as_secs()
                );
            }
        }
    }

    /// Pull one task and spawn its execution. Returns whether a task was pulled.
    pub async fn dispatch_once(&self) -> bool {
        Self::tick(&self.scheduler, &self.subsystem_handlers).await
    }

    async fn tick(
        scheduler: &Arc<TaskScheduler>,
        handlers: &Arc<RwLock<HashMap<String, TaskFn>>>,
    ) -> bool {
        let Some(task) = scheduler.next_ready().await else {
            return false;
        };
        let subsystem_handler = handlers.read().await.get(&task.context.subsystem).cloned();
        let scheduler = scheduler.clone();

        tokio::spawn(async move {
            match subsystem_handler {
                Some(handler) => {
                    Self::run_subsystem(&scheduler, handler, task).await;
                }
                None => {
                    scheduler.execute(task).await;
                }
            }
        });
        true
    }

    async fn run_subsystem(scheduler: &TaskScheduler, handler: TaskFn, task: Task) {
        let start = Utc::now();
        let subsystem = task.context.subsystem.clone();
        if task.is_past_deadline(start) {
            let result = TaskResult::failure(&task.id, "deadline exceeded", start);
            scheduler.record_final_result(task, result).await;
            return;
        }
        tracing::debug!("🔀 Routing '{}' to subsystem '{}'", task.name, subsystem);

        let mut join = tokio::spawn(handler(task.clone()));
        let joined = match task.deadline {
            Some(deadline) => {
                let remaining = (deadline - start).to_std().unwrap_or_default();
                match tokio::time::timeout(remaining, &mut join).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        join.abort();
                        tracing::warn!(
                            "⏱️ Task '{}' exceeded its deadline in subsystem '{}'",
                            task.name,
                            subsystem
                        );
                        let result = TaskResult::failure(&task.id, "deadline exceeded", start);
                        scheduler.record_final_result(task, result).await;
                        return;
                    }
                }
            }
            None => join.await,
        };
        let result = match joined {
            Ok(Ok(data)) => TaskResult::success(&task.id, data, start),
            Ok(Err(e)) => TaskResult::failure(&task.id, format!("[{subsystem}] {e}"), start),
            Err(e) => TaskResult::failure(
                &task.id,
                format!("[{subsystem}] handler aborted: {e}"),
                start,
            ),
        };
        scheduler.record_result(task, result).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{FnHandler, task_fn};
    use crate::tasks::{TaskStatus, TaskType};
    use overwatch_core::config::SchedulerConfig;

    fn scheduler() -> Arc<TaskScheduler> {
        Arc::new(TaskScheduler::new(SchedulerConfig {
            poll_interval_ms: 10,
            retry_jitter: 0.0,
            ..SchedulerConfig::default()
        }))
    }

    async fn wait_until_idle(scheduler: &TaskScheduler) {
        for _ in 0..200 {
            if scheduler.queue_size().await == 0 && scheduler.running_count().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("scheduler never went idle");
    }

    #[tokio::test]
    async fn test_routes_to_subsystem_and_tags_failures() {
        let sched = scheduler();
        let dispatcher = TaskDispatcher::new(sched.clone());
        dispatcher
            .register_subsystem_handler(
                "obd2",
                task_fn(|_task: Task| async move { Err::<serde_json::Value, _>("adapter offline".to_string()) }),
            )
            .await;

        let t = Task::new("read codes", "", TaskType::Obd2Diagnostic)
            .with_subsystem("obd2")
            .with_retries(0, 0);
        sched.submit(t).await.unwrap();

        dispatcher.start().await;
        wait_until_idle(&sched).await;
        dispatcher.stop().await;

        let failed = sched.failed_history().await;
        assert_eq!(failed.len(), 1);
        assert_eq!(
            failed[0].result.error_message.as_deref(),
            Some("[obd2] adapter offline")
        );
    }

    #[tokio::test]
    async fn test_subsystem_deadline_fails_without_retry() {
        let sched = scheduler();
        let dispatcher = TaskDispatcher::new(sched.clone());
        dispatcher
            .register_subsystem_handler(
                "obd2",
                task_fn(|_task: Task| async move {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok::<_, String>(serde_json::json!({ "codes": [] }))
                }),
            )
            .await;

        let slow = Task::new("slow scan", "", TaskType::Obd2Diagnostic)
            .with_subsystem("obd2")
            .with_retries(3, 0)
            .with_deadline(Utc::now() + chrono::Duration::milliseconds(50));
        let expired = Task::new("stale scan", "", TaskType::Obd2Diagnostic)
            .with_subsystem("obd2")
            .with_retries(3, 0)
            .with_deadline(Utc::now() - chrono::Duration::seconds(1));
        sched.submit(slow).await.unwrap();
        sched.submit(expired).await.unwrap();

        dispatcher.start().await;
        wait_until_idle(&sched).await;
        dispatcher.stop().await;

        let stats = sched.stats().await;
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.retried, 0);
        let failed = sched.failed_history().await;
        assert!(failed
            .iter()
            .all(|f| f.result.error_message.as_deref() == Some("deadline exceeded")));
    }

    #[tokio::test]
    async fn test_falls_back_to_scheduler_handlers() {
        let sched = scheduler();
        sched
            .register_handler(
                TaskType::SystemHealth,
                Arc::new(FnHandler::new("health", &[TaskType::SystemHealth], |_task: Task| async move {
                    Ok::<_, String>(serde_json::json!({ "healthy": true }))
                })),
            )
            .await;
        let dispatcher = TaskDispatcher::new(sched.clone());
        for _ in 0..3 {
            sched
                .submit(Task::new("health", "", TaskType::SystemHealth))
                .await
                .unwrap();
        }

        dispatcher.start().await;
        assert!(dispatcher.is_running());
        wait_until_idle(&sched).await;
        dispatcher.stop().await;
        assert!(!dispatcher.is_running());

        let stats = sched.stats().await;
        assert_eq!(stats.completed, 3);
        let done = sched.completed_history().await;
        assert!(done.iter().all(|f| f.task.status == TaskStatus::Completed));
    }

    #[tokio::test]
    async fn test_stopped_dispatcher_pulls_nothing() {
        let sched = scheduler();
        let dispatcher = TaskDispatcher::new(sched.clone());
        dispatcher.start().await;
        dispatcher.stop().await;

        sched
            .submit(Task::new("late", "", TaskType::UserTask))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sched.queue_size().await, 1);
    }
}

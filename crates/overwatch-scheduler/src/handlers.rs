//! Task handlers: the capability interface external executors implement,
//! the registry that resolves a handler for a task, and adapters for plain
//! closures and blocking work.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use overwatch_core::error::{OverwatchError, Result};
use tokio::sync::Semaphore;

use crate::tasks::{Task, TaskResult, TaskType};

/// Something that can execute tasks.
///
/// `execute` never fails: problems are reported as a FAILED [`TaskResult`]
/// with the error text in `error_message`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn name(&self) -> &str;

    fn can_handle(&self, task: &Task) -> bool;

    async fn execute(&self, task: &Task) -> TaskResult;
}

/// Async closure over an owned task, used for closure handlers and
/// dispatcher subsystem handlers.
pub type TaskFn =
    Arc<dyn Fn(Task) -> BoxFuture<'static, std::result::Result<serde_json::Value, String>> + Send + Sync>;

/// Box an async closure into a [`TaskFn`].
pub fn task_fn<F, Fut>(f: F) -> TaskFn
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<serde_json::Value, String>> + Send + 'static,
{
    Arc::new(move |task| Box::pin(f(task)))
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handlers keyed by task type, plus an ordered list for the fallback scan.
#[derive(Default)]
pub struct HandlerRegistry {
    by_type: HashMap<TaskType, Arc<dyn TaskHandler>>,
    ordered: Vec<Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler as the primary one for `task_type`.
    /// A handler replaced in the type map stays in the fallback scan.
    pub fn register(&mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) {
        tracing::info!("🔧 Registered handler '{}' for {}", handler.name(), task_type);
        self.by_type.insert(task_type, handler.clone());
        self.ordered.push(handler);
    }

    /// Register a handler reachable only through the capability scan.
    pub fn register_fallback(&mut self, handler: Arc<dyn TaskHandler>) {
        tracing::info!("🔧 Registered fallback handler '{}'", handler.name());
        self.ordered.push(handler);
    }

    /// Type-keyed handler first, then the first handler whose `can_handle` accepts.
    pub fn resolve(&self, task: &Task) -> Option<Arc<dyn TaskHandler>> {
        if let Some(handler) = self.by_type.get(&task.task_type) {
            if handler.can_handle(task) {
                return Some(handler.clone());
            }
        }
        self.ordered.iter().find(|h| h.can_handle(task)).cloned()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

/// Bounded pool for CPU-bound or blocking handler work.
#[derive(Clone)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl BlockingPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
            size: size.max(1),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots not currently held by a running job.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `f` on the blocking thread pool once a slot is free.
    pub async fn run<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| OverwatchError::handler(format!("blocking pool closed: {e}")))?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await
        .map_err(|e| OverwatchError::handler(format!("blocking job aborted: {e}")))
    }
}

type BlockingFn = Arc<dyn Fn(&Task) -> std::result::Result<serde_json::Value, String> + Send + Sync>;

/// Adapts a synchronous closure into a handler that runs on a [`BlockingPool`].
pub struct BlockingHandler {
    name: String,
    task_types: Vec<TaskType>,
    pool: BlockingPool,
    func: BlockingFn,
}

impl BlockingHandler {
    pub fn new<F>(name: &str, task_types: &[TaskType], pool: BlockingPool, func: F) -> Self
    where
        F: Fn(&Task) -> std::result::Result<serde_json::Value, String> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            task_types: task_types.to_vec(),
            pool,
            func: Arc::new(func),
        }
    }
}

#[async_trait]
impl TaskHandler for BlockingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_handle(&self, task: &Task) -> bool {
        self.task_types.contains(&task.task_type)
    }

    async fn execute(&self, task: &Task) -> TaskResult {
        let start = Utc::now();
        let func = self.func.clone();
        let owned = task.clone();
        match self.pool.run(move || func(&owned)).await {
            Ok(Ok(data)) => TaskResult::success(&task.id, data, start),
            Ok(Err(e)) => TaskResult::failure(&task.id, e, start),
            Err(e) => TaskResult::failure(&task.id, e.to_string(), start),
        }
    }
}

/// Adapts an async closure into a handler.
pub struct FnHandler {
    name: String,
    task_types: Vec<TaskType>,
    func: TaskFn,
}

impl FnHandler {
    pub fn new<F, Fut>(name: &str, task_types: &[TaskType], f: F) -> Self
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<serde_json::Value, String>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            task_types: task_types.to_vec(),
            func: task_fn(f),
        }
    }
}

#[async_trait]
impl TaskHandler for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_handle(&self, task: &Task) -> bool {
        self.task_types.is_empty() || self.task_types.contains(&task.task_type)
    }

    async fn execute(&self, task: &Task) -> TaskResult {
        let start = Utc::now();
        match (self.func)(task.clone()).await {
            Ok(data) => TaskResult::success(&task.id, data, start),
            Err(e) => TaskResult::failure(&task.id, e, start),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskStatus;

    fn echo(name: &str, types: &[TaskType]) -> Arc<dyn TaskHandler> {
        Arc::new(FnHandler::new(name, types, |task: Task| async move {
            Ok::<_, String>(serde_json::json!({ "echo": task.name }))
        }))
    }

    #[test]
    fn test_resolve_by_type_then_fallback() {
        let mut registry = HandlerRegistry::new();
        registry.register(TaskType::SystemHealth, echo("health", &[TaskType::SystemHealth]));
        registry.register_fallback(echo("backup", &[TaskType::DataBackup, TaskType::Maintenance]));

        let health = Task::new("h", "", TaskType::SystemHealth);
        assert_eq!(registry.resolve(&health).unwrap().name(), "health");

        let maint = Task::new("m", "", TaskType::Maintenance);
        assert_eq!(registry.resolve(&maint).unwrap().name(), "backup");

        let scan = Task::new("s", "", TaskType::SecurityScan);
        assert!(registry.resolve(&scan).is_none());
    }

    #[test]
    fn test_fallback_scan_first_match_wins() {
        let mut registry = HandlerRegistry::new();
        registry.register_fallback(echo("first", &[TaskType::Custom]));
        registry.register_fallback(echo("second", &[TaskType::Custom]));
        let task = Task::new("c", "", TaskType::Custom);
        assert_eq!(registry.resolve(&task).unwrap().name(), "first");
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_blocking_handler() {
        let pool = BlockingPool::new(2);
        let handler = BlockingHandler::new("sum", &[TaskType::PerformanceCheck], pool.clone(), |task| {
            if task.name == "bad" {
                return Err("sensor read failed".to_string());
            }
            Ok(serde_json::json!({ "sum": (1..=10).sum::<u32>() }))
        });

        let ok = handler.execute(&Task::new("good", "", TaskType::PerformanceCheck)).await;
        assert_eq!(ok.status, TaskStatus::Completed);
        assert_eq!(ok.result_data["sum"], 55);

        let bad = handler.execute(&Task::new("bad", "", TaskType::PerformanceCheck)).await;
        assert_eq!(bad.status, TaskStatus::Failed);
        assert_eq!(bad.error_message.as_deref(), Some("sensor read failed"));
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_fn_handler_failure() {
        let handler = FnHandler::new("flaky", &[], |_task: Task| async move {
            Err::<serde_json::Value, _>("connection refused".to_string())
        });
        let task = Task::new("x", "", TaskType::UserTask);
        assert!(handler.can_handle(&task));
        let result = handler.execute(&task).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.task_id, task.id);
    }
}

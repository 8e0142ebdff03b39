//! # Overwatch Scheduler
//!
//! Task generation, priority scheduling and dispatch.
//!
//! ## Architecture
//! ```text
//! OverwatchSystem
//!   ├── TaskGenerator: periodic + conditional + custom rules → Vec<Task>
//!   ├── TaskScheduler
//!   │     ├── ready heap (priority, created_at)   ← due tasks
//!   │     ├── delayed set (scheduled_at)          ← future tasks, retries
//!   │     ├── HandlerRegistry: by TaskType, then can_handle scan
//!   │     └── bounded completed / failed history
//!   └── TaskDispatcher (tokio task)
//!         ├── next_ready() → subsystem handler (by context.subsystem)
//!         └──              → TaskScheduler::execute
//! ```

pub mod dispatch;
pub mod generator;
pub mod handlers;
pub mod scheduler;
pub mod system;
pub mod tasks;

pub use dispatch::TaskDispatcher;
pub use generator::{ConditionalRule, FnRule, GenerationRule, PeriodicRule, SystemState, TaskGenerator};
pub use handlers::{BlockingHandler, BlockingPool, FnHandler, HandlerRegistry, TaskFn, TaskHandler, task_fn};
pub use scheduler::{FinishedTask, SchedulerStats, TaskScheduler};
pub use system::{OverwatchSystem, SystemStatus};
pub use tasks::{Task, TaskContext, TaskPriority, TaskResult, TaskStatus, TaskType};

//! # Overwatch Bots
//!
//! Bot registry and scored task assignment.
//!
//! ## Architecture
//! ```text
//! TaskBotEngine
//!   ├── bots: id → Bot (status, capabilities, current_tasks)
//!   ├── assignments: id → TaskAssignment (Pending → Running → terminal)
//!   ├── FIFO queue ← queue_task()
//!   ├── AssignmentStrategy: best_fit | load_balanced | round_robin | priority_first | custom
//!   └── loops: assignment, health monitor, utilization
//! ```

pub mod assignment;
pub mod bot;
pub mod engine;
pub mod scoring;
pub mod strategy;

pub use assignment::TaskAssignment;
pub use bot::{Bot, BotCapability, BotStatus, BotType};
pub use engine::{BotStats, EngineStats, QueueOutcome, TaskBotEngine};
pub use scoring::{can_handle_task, score};
pub use strategy::{
    AssignmentStrategy, BestFitStrategy, LoadBalancedStrategy, PriorityFirstStrategy, RoundRobinStrategy,
    SelectionContext, StrategyRegistry,
};

//! Bot definitions: worker identity, declared capabilities and load.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use overwatch_scheduler::tasks::{TaskPriority, TaskType};
use serde::{Deserialize, Serialize};

/// What role a bot plays in the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BotType {
    Assistant,
    System,
    Worker,
    Monitor,
    Specialist,
    User,
}

/// Bot availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BotStatus {
    Online,
    Offline,
    Busy,
    Idle,
    Error,
    Maintenance,
}

impl BotStatus {
    /// Whether the bot may receive new work.
    pub fn accepts_work(&self) -> bool {
        matches!(self, BotStatus::Online | BotStatus::Idle)
    }
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A named skill: the task types a bot can execute under it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotCapability {
    pub name: String,
    pub task_types: HashSet<TaskType>,
    /// Added to the assignment score when this capability matches.
    pub priority_boost: i32,
    /// Informational per-capability cap.
    pub max_concurrent: usize,
}

impl BotCapability {
    pub fn new(name: &str, task_types: &[TaskType]) -> Self {
        Self {
            name: name.to_string(),
            task_types: task_types.iter().copied().collect(),
            priority_boost: 0,
            max_concurrent: 1,
        }
    }

    pub fn with_boost(mut self, boost: i32) -> Self {
        self.priority_boost = boost;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn supports(&self, task_type: TaskType) -> bool {
        self.task_types.contains(&task_type)
    }
}

/// A worker that receives task assignments.
///
/// Once registered, a bot belongs to the engine; callers only ever see clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    pub id: String,
    pub name: String,
    pub bot_type: BotType,
    pub status: BotStatus,
    pub capabilities: Vec<BotCapability>,
    pub max_concurrent_tasks: usize,
    /// Most preferred first.
    pub priority_preference: Vec<TaskPriority>,
    /// Ids of tasks with a non-terminal assignment on this bot.
    pub current_tasks: HashSet<String>,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub last_seen: DateTime<Utc>,
    pub last_task_completed: Option<DateTime<Utc>>,
    /// `current_tasks / max_concurrent_tasks`, refreshed by the statistics loop.
    pub utilization: f64,
}

impl Bot {
    pub fn new(id: &str, name: &str, bot_type: BotType) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            bot_type,
            status: BotStatus::Offline,
            capabilities: Vec::new(),
            max_concurrent_tasks: 1,
            priority_preference: Vec::new(),
            current_tasks: HashSet::new(),
            completed_tasks: 0,
            failed_tasks: 0,
            last_seen: Utc::now(),
            last_task_completed: None,
            utilization: 0.0,
        }
    }

    pub fn with_capability(mut self, capability: BotCapability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    pub fn with_preference(mut self, preference: &[TaskPriority]) -> Self {
        self.priority_preference = preference.to_vec();
        self
    }

    pub fn load(&self) -> usize {
        self.current_tasks.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.current_tasks.len() < self.max_concurrent_tasks
    }

    pub fn supports(&self, task_type: TaskType) -> bool {
        self.capabilities.iter().any(|c| c.supports(task_type))
    }

    /// Position of `priority` in the preference list.
    pub fn preference_rank(&self, priority: TaskPriority) -> Option<usize> {
        self.priority_preference.iter().position(|p| *p == priority)
    }

    pub fn compute_utilization(&self) -> f64 {
        if self.max_concurrent_tasks == 0 {
            return 0.0;
        }
        self.current_tasks.len() as f64 / self.max_concurrent_tasks as f64
    }
}

//! Task definitions: the core data model shared by the generator, scheduler
//! and bot engine.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use overwatch_core::error::OverwatchError;
use serde::{Deserialize, Serialize};

/// What kind of work a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    SystemHealth,
    Obd2Diagnostic,
    PerformanceCheck,
    DataBackup,
    Maintenance,
    SecurityScan,
    UserTask,
    Custom,
}

impl TaskType {
    pub const ALL: [TaskType; 8] = [
        TaskType::SystemHealth,
        TaskType::Obd2Diagnostic,
        TaskType::PerformanceCheck,
        TaskType::DataBackup,
        TaskType::Maintenance,
        TaskType::SecurityScan,
        TaskType::UserTask,
        TaskType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::SystemHealth => "system_health",
            TaskType::Obd2Diagnostic => "obd2_diagnostic",
            TaskType::PerformanceCheck => "performance_check",
            TaskType::DataBackup => "data_backup",
            TaskType::Maintenance => "maintenance",
            TaskType::SecurityScan => "security_scan",
            TaskType::UserTask => "user_task",
            TaskType::Custom => "custom",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = OverwatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| OverwatchError::validation(format!("unknown task type '{s}'")))
    }
}

/// Task priority. Lower numeric value is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    Critical = 1,
    High = 2,
    Normal = 3,
    Low = 4,
    Background = 5,
}

impl TaskPriority {
    pub fn value(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskPriority::Critical => "critical",
            TaskPriority::High => "high",
            TaskPriority::Normal => "normal",
            TaskPriority::Low => "low",
            TaskPriority::Background => "background",
        };
        f.write_str(name)
    }
}

impl FromStr for TaskPriority {
    type Err = OverwatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" | "1" => Ok(TaskPriority::Critical),
            "high" | "2" => Ok(TaskPriority::High),
            "normal" | "3" => Ok(TaskPriority::Normal),
            "low" | "4" => Ok(TaskPriority::Low),
            "background" | "5" => Ok(TaskPriority::Background),
            _ => Err(OverwatchError::validation(format!("unknown task priority '{s}'"))),
        }
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Allowed edges of the lifecycle state machine.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Retrying)
                | (Retrying, Pending)
                | (Retrying, Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Where a task came from and who it belongs to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskContext {
    /// Owning subsystem; the dispatcher routes on this name.
    pub subsystem: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TaskContext {
    pub fn new(subsystem: &str) -> Self {
        Self {
            subsystem: subsystem.to_string(),
            ..Default::default()
        }
    }
}

/// A unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task ID.
    pub id: String,
    pub name: String,
    pub description: String,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub context: TaskContext,
    pub created_at: DateTime<Utc>,
    /// The task is not eligible to run before this instant.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Execution is abandoned as failed once this instant passes.
    pub deadline: Option<DateTime<Utc>>,
    pub max_retries: u32,
    pub retry_count: u32,
    /// Base delay before a failed attempt is re-submitted.
    pub retry_delay_ms: u64,
}

impl Task {
    /// Create a pending task with normal priority and three retries.
    pub fn new(name: &str, description: &str, task_type: TaskType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            task_type,
            priority: TaskPriority::Normal,
            status: TaskStatus::Pending,
            context: TaskContext::new("system"),
            created_at: Utc::now(),
            scheduled_at: None,
            deadline: None,
            max_retries: 3,
            retry_count: 0,
            retry_delay_ms: 1000,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_subsystem(mut self, subsystem: &str) -> Self {
        self.context.subsystem = subsystem.to_string();
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.context.metadata.insert(key.to_string(), value);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn scheduled_in(self, delay: Duration) -> Self {
        self.scheduled_at(Utc::now() + delay)
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    /// Whether the task may run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_none_or(|at| at <= now)
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub result_data: serde_json::Value,
    pub error_message: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub execution_time_ms: u64,
}

impl TaskResult {
    pub fn success(task_id: &str, data: serde_json::Value, start_time: DateTime<Utc>) -> Self {
        Self::finish(task_id, TaskStatus::Completed, data, None, start_time)
    }

    pub fn failure(task_id: &str, error: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self::finish(
            task_id,
            TaskStatus::Failed,
            serde_json::Value::Null,
            Some(error.into()),
            start_time,
        )
    }

    pub fn cancelled(task_id: &str, reason: impl Into<String>) -> Self {
        Self::finish(
            task_id,
            TaskStatus::Cancelled,
            serde_json::Value::Null,
            Some(reason.into()),
            Utc::now(),
        )
    }

    fn finish(
        task_id: &str,
        status: TaskStatus,
        result_data: serde_json::Value,
        error_message: Option<String>,
        start_time: DateTime<Utc>,
    ) -> Self {
        let end_time = Utc::now();
        let execution_time_ms = (end_time - start_time).num_milliseconds().max(0) as u64;
        Self {
            task_id: task_id.to_string(),
            status,
            result_data,
            error_message,
            start_time,
            end_time,
            execution_time_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

//! Task assignments: the record pairing one task with one bot.

use chrono::{DateTime, Utc};
use overwatch_scheduler::tasks::{Task, TaskResult, TaskStatus};
use serde::{Deserialize, Serialize};

/// A task handed to a bot. Finalized exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub id: String,
    pub task_id: String,
    pub bot_id: String,
    pub assigned_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub result: Option<TaskResult>,
    pub notes: String,
    /// Snapshot of the task, used to re-queue it elsewhere.
    pub task: Task,
}

impl TaskAssignment {
    pub fn new(task: &Task, bot_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            bot_id: bot_id.to_string(),
            assigned_at: Utc::now(),
            started_at: None,
            completed_at: None,
            status: TaskStatus::Pending,
            result: None,
            notes: String::new(),
            task: task.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub(crate) fn finalize(&mut self, result: TaskResult, notes: Option<&str>) {
        self.status = result.status;
        self.completed_at = Some(result.end_time);
        self.result = Some(result);
        if let Some(notes) = notes {
            self.notes = notes.to_string();
        }
    }
}

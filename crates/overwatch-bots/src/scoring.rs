//! Bot eligibility and scoring.
//!
//! ```text
//! score = 0
//!   + (10 - rank)           task priority is in the bot's preference list
//!   + (20 + boost)          per capability covering the task type
//!   - 5 * current load
//!   + 5                     bot completed something within the recent window
//! ```

use chrono::{DateTime, Duration, Utc};
use overwatch_scheduler::tasks::Task;

use crate::bot::Bot;

/// Returned by [`score`] for bots that cannot take the task.
pub const INELIGIBLE: i32 = -1;

const PREFERENCE_BASE: i32 = 10;
const CAPABILITY_BASE: i32 = 20;
const LOAD_PENALTY: i32 = 5;
const RECENCY_BONUS: i32 = 5;

/// Available, below capacity, and capable of the task type.
pub fn can_handle_task(bot: &Bot, task: &Task) -> bool {
    bot.status.accepts_work() && bot.has_capacity() && bot.supports(task.task_type)
}

pub fn score(bot: &Bot, task: &Task, now: DateTime<Utc>, recent_window: Duration) -> i32 {
    if !can_handle_task(bot, task) {
        return INELIGIBLE;
    }

    let mut score = 0;
    if let Some(rank) = bot.preference_rank(task.priority) {
        score += PREFERENCE_BASE - rank as i32;
    }
    for capability in bot.capabilities.iter().filter(|c| c.supports(task.task_type)) {
        score += CAPABILITY_BASE + capability.priority_boost;
    }
    score -= LOAD_PENALTY * bot.load() as i32;
    if bot
        .last_task_completed
        .is_some_and(|at| now - at < recent_window)
    {
        score += RECENCY_BONUS;
    }
    score
}

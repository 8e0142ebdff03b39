//! Assignment strategies: pick one bot among the eligible ones.
//!
//! Strategies receive only bots that already passed
//! [`can_handle_task`](crate::scoring::can_handle_task), sorted by bot id.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use overwatch_core::error::{OverwatchError, Result};
use overwatch_scheduler::tasks::Task;

use crate::bot::Bot;
use crate::scoring::score;

/// Inputs shared by every strategy call.
#[derive(Debug, Clone)]
pub struct SelectionContext {
    pub now: DateTime<Utc>,
    /// Assignments made so far, for rotation.
    pub total_assignments: u64,
    pub recent_window: Duration,
}

pub trait AssignmentStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Id of the chosen bot, or `None` when nothing fits.
    fn select(&self, task: &Task, eligible: &[&Bot], ctx: &SelectionContext) -> Option<String>;
}

/// Highest score wins; ties go to the first bot.
fn highest_score(task: &Task, bots: &[&Bot], ctx: &SelectionContext) -> Option<String> {
    let mut best: Option<(&Bot, i32)> = None;
    for bot in bots {
        let s = score(bot, task, ctx.now, ctx.recent_window);
        if best.is_none_or(|(_, top)| s > top) {
            best = Some((*bot, s));
        }
    }
    best.map(|(bot, _)| bot.id.clone())
}

pub struct BestFitStrategy;

impl AssignmentStrategy for BestFitStrategy {
    fn name(&self) -> &str {
        "best_fit"
    }

    fn select(&self, task: &Task, eligible: &[&Bot], ctx: &SelectionContext) -> Option<String> {
        highest_score(task, eligible, ctx)
    }
}

pub struct LoadBalancedStrategy;

impl AssignmentStrategy for LoadBalancedStrategy {
    fn name(&self) -> &str {
        "load_balanced"
    }

    fn select(&self, _task: &Task, eligible: &[&Bot], _ctx: &SelectionContext) -> Option<String> {
        eligible
            .iter()
            .min_by_key(|bot| bot.load())
            .map(|bot| bot.id.clone())
    }
}

pub struct RoundRobinStrategy;

impl AssignmentStrategy for RoundRobinStrategy {
    fn name(&self) -> &str {
        "round_robin"
    }

    fn select(&self, _task: &Task, eligible: &[&Bot], ctx: &SelectionContext) -> Option<String> {
        if eligible.is_empty() {
            return None;
        }
        let index = (ctx.total_assignments % eligible.len() as u64) as usize;
        Some(eligible[index].id.clone())
    }
}

/// Best fit among bots that list the task's priority; all eligible bots otherwise.
pub struct PriorityFirstStrategy;

impl AssignmentStrategy for PriorityFirstStrategy {
    fn name(&self) -> &str {
        "priority_first"
    }

    fn select(&self, task: &Task, eligible: &[&Bot], ctx: &SelectionContext) -> Option<String> {
        let preferring: Vec<&Bot> = eligible
            .iter()
            .copied()
            .filter(|bot| bot.preference_rank(task.priority).is_some())
            .collect();
        if preferring.is_empty() {
            highest_score(task, eligible, ctx)
        } else {
            highest_score(task, &preferring, ctx)
        }
    }
}

/// Strategies by name.
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn AssignmentStrategy>>,
}

impl StrategyRegistry {
    /// Registry holding the four built-in strategies.
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            strategies: HashMap::new(),
        };
        registry.register(Arc::new(BestFitStrategy));
        registry.register(Arc::new(LoadBalancedStrategy));
        registry.register(Arc::new(RoundRobinStrategy));
        registry.register(Arc::new(PriorityFirstStrategy));
        registry
    }

    pub fn register(&mut self, strategy: Arc<dyn AssignmentStrategy>) {
        self.strategies.insert(strategy.name().to_string(), strategy);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn AssignmentStrategy>> {
        self.strategies
            .get(name)
            .cloned()
            .ok_or_else(|| OverwatchError::validation(format!("unknown assignment strategy '{name}'")))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.strategies.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::{BotCapability, BotStatus, BotType};
    use overwatch_scheduler::tasks::{TaskPriority, TaskType};

    fn bot(id: &str, boost: i32, load: usize, preference: &[TaskPriority]) -> Bot {
        let mut bot = Bot::new(id, id, BotType::Worker)
            .with_capability(BotCapability::new("user", &[TaskType::UserTask]).with_boost(boost))
            .with_preference(preference)
            .with_max_concurrent(5);
        bot.status = BotStatus::Online;
        for i in 0..load {
            bot.current_tasks.insert(format!("{id}-t{i}"));
        }
        bot
    }

    fn ctx(total: u64) -> SelectionContext {
        SelectionContext {
            now: Utc::now(),
            total_assignments: total,
            recent_window: Duration::minutes(30),
        }
    }

    fn task(priority: TaskPriority) -> Task {
        Task::new("t", "", TaskType::UserTask).with_priority(priority)
    }

    #[test]
    fn test_best_fit_prefers_boost() {
        let a = bot("a", 0, 0, &[]);
        let b = bot("b", 10, 0, &[]);
        let pick = BestFitStrategy.select(&task(TaskPriority::Normal), &[&a, &b], &ctx(0));
        assert_eq!(pick.as_deref(), Some("b"));
    }

    #[test]
    fn test_load_balanced_picks_least_loaded() {
        let a = bot("a", 50, 3, &[]);
        let b = bot("b", 0, 1, &[]);
        let pick = LoadBalancedStrategy.select(&task(TaskPriority::Normal), &[&a, &b], &ctx(0));
        assert_eq!(pick.as_deref(), Some("b"));
    }

    #[test]
    fn test_round_robin_rotates() {
        let a = bot("a", 0, 0, &[]);
        let b = bot("b", 0, 0, &[]);
        let c = bot("c", 0, 0, &[]);
        let eligible = [&a, &b, &c];
        let picks: Vec<_> = (0..4)
            .map(|n| RoundRobinStrategy.select(&task(TaskPriority::Normal), &eligible, &ctx(n)).unwrap())
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a"]);
        assert!(RoundRobinStrategy.select(&task(TaskPriority::Normal), &[], &ctx(0)).is_none());
    }

    #[test]
    fn test_priority_first_restricts_then_falls_back() {
        let strong = bot("strong", 30, 0, &[]);
        let critical = bot("critical", 0, 0, &[TaskPriority::Critical]);
        let pick = PriorityFirstStrategy.select(&task(TaskPriority::Critical), &[&critical, &strong], &ctx(0));
        assert_eq!(pick.as_deref(), Some("critical"));

        let pick = PriorityFirstStrategy.select(&task(TaskPriority::Low), &[&critical, &strong], &ctx(0));
        assert_eq!(pick.as_deref(), Some("strong"));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = StrategyRegistry::with_builtins();
        assert_eq!(
            registry.names(),
            vec!["best_fit", "load_balanced", "priority_first", "round_robin"]
        );
        assert_eq!(registry.get("round_robin").unwrap().name(), "round_robin");
        assert!(matches!(registry.get("random"), Err(OverwatchError::Validation(_))));
    }
}

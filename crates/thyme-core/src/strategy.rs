//! Scheduling strategies
//!
//! A strategy is a predicate plus an ordering over pending tasks. The
//! `TaskScheduler` composes several strategies and unions their picks by
//! task id, first strategy winning on duplicates. Strategies are stateless;
//! a task left behind by the concurrency cap stays due with the same
//! ordering keys on the next tick.

use chrono::{DateTime, Utc};

use crate::error::SchedulerResult;
use crate::filter::TaskFilter;
use crate::registry::TaskRegistry;
use crate::task::{ScheduleType, Task, TaskStatus};

/// Predicate-plus-sort over pending tasks
pub trait SchedulingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// The subset of `tasks` due at `now`, in execution order
    fn due(&self, tasks: &[Task], now: DateTime<Utc>) -> Vec<Task>;
}

/// Sort by fire time ascending, ties broken by priority descending
fn sort_by_time_then_priority(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| {
        a.scheduled_time
            .cmp(&b.scheduled_time)
            .then(b.priority.cmp(&a.priority))
    });
}

/// Selects pending tasks whose fire time has arrived (inclusive of now)
#[derive(Debug, Default, Clone, Copy)]
pub struct ExplicitTimeStrategy;

impl SchedulingStrategy for ExplicitTimeStrategy {
    fn name(&self) -> &'static str {
        "explicit_time"
    }

    fn due(&self, tasks: &[Task], now: DateTime<Utc>) -> Vec<Task> {
        let mut due: Vec<Task> = tasks.iter().filter(|t| t.is_due(now)).cloned().collect();
        sort_by_time_then_priority(&mut due);
        due
    }
}

/// Selects pending interval tasks whose next fire time has arrived
#[derive(Debug, Default, Clone, Copy)]
pub struct IntervalStrategy;

impl SchedulingStrategy for IntervalStrategy {
    fn name(&self) -> &'static str {
        "interval"
    }

    fn due(&self, tasks: &[Task], now: DateTime<Utc>) -> Vec<Task> {
        let mut due: Vec<Task> = tasks
            .iter()
            .filter(|t| t.schedule_type == ScheduleType::Interval && t.is_due(now))
            .cloned()
            .collect();
        sort_by_time_then_priority(&mut due);
        due
    }
}

/// Selects pending priority-typed tasks at or above a threshold
#[derive(Debug, Clone, Copy)]
pub struct PriorityBasedStrategy {
    pub threshold: u8,
}

impl Default for PriorityBasedStrategy {
    fn default() -> Self {
        Self { threshold: 7 }
    }
}

impl PriorityBasedStrategy {
    pub fn new(threshold: u8) -> Self {
        Self { threshold }
    }
}

impl SchedulingStrategy for PriorityBasedStrategy {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn due(&self, tasks: &[Task], _now: DateTime<Utc>) -> Vec<Task> {
        let mut due: Vec<Task> = tasks
            .iter()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && t.schedule_type == ScheduleType::Priority
                    && t.priority >= self.threshold
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| b.priority.cmp(&a.priority));
        due
    }
}

/// Aggregates strategies into one ordered ready set
pub struct TaskScheduler {
    strategies: Vec<Box<dyn SchedulingStrategy>>,
}

impl TaskScheduler {
    pub fn new(strategies: Vec<Box<dyn SchedulingStrategy>>) -> Self {
        Self { strategies }
    }

    /// Explicit, interval, then priority - the stock lineup
    pub fn with_defaults(priority_threshold: u8) -> Self {
        Self::new(vec![
            Box::new(ExplicitTimeStrategy),
            Box::new(IntervalStrategy),
            Box::new(PriorityBasedStrategy::new(priority_threshold)),
        ])
    }

    /// Union of every strategy's picks over an already-fetched task set,
    /// in strategy order, deduplicated by id (first strategy wins)
    pub fn select(&self, tasks: &[Task], now: DateTime<Utc>) -> Vec<Task> {
        let mut seen: Vec<String> = Vec::new();
        let mut combined = Vec::new();
        for strategy in &self.strategies {
            for task in strategy.due(tasks, now) {
                if !seen.contains(&task.id) {
                    seen.push(task.id.clone());
                    combined.push(task);
                }
            }
        }
        combined
    }

    /// Fetch pending tasks and return the ones due now. Tasks observed in
    /// RUNNING are pending-filtered out here, which is the cross-tick fence
    /// against double starts.
    pub async fn due(
        &self,
        registry: &dyn TaskRegistry,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Task>> {
        let pending = registry.find(&TaskFilter::pending()).await?;
        Ok(self.select(&pending, now))
    }
}

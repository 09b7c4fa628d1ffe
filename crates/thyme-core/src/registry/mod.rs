//! Task registry
//!
//! Durable CRUD for tasks behind a common async trait, with three bindings:
//! - `InMemoryTaskRegistry` - HashMap-backed, for tests and dev
//! - `VectorTaskRegistry` - production, persists into a `StorageBackend`
//! - `CachedTaskRegistry` - composition decorator adding entity/query caches
//!
//! Store-time normalisation happens here: names are validated, ULIDs
//! assigned, and schedule expressions resolved to concrete instants so the
//! polling loop never parses anything.

mod cached;
mod memory;
mod vector;

pub use cached::{CacheSettings, CachedTaskRegistry};
pub use memory::InMemoryTaskRegistry;
pub use vector::VectorTaskRegistry;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use tracing::debug;
use ulid::Ulid;

use crate::datetime::DateTimeProcessor;
use crate::error::{SchedulerError, SchedulerResult};
use crate::filter::TaskFilter;
use crate::task::{HandlerBinding, NewTask, ScheduleSpec, ScheduleType, Task, TaskInterval, TaskStatus};

/// Durable store plus cache for tasks
#[async_trait]
pub trait TaskRegistry: Send + Sync {
    /// Idempotent; ensures the backing collection exists
    async fn initialize(&self) -> SchedulerResult<()>;

    /// Validate, normalise, and persist a draft
    async fn store(&self, draft: NewTask) -> SchedulerResult<Task>;

    async fn get_by_id(&self, id: &str) -> SchedulerResult<Option<Task>>;

    /// Persist changes to an existing task; fails with `TaskNotFound`
    async fn update(&self, task: Task) -> SchedulerResult<Task>;

    /// Returns false when the id is not present
    async fn delete(&self, id: &str) -> SchedulerResult<bool>;

    async fn find(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>>;

    async fn count(&self, filter: &TaskFilter) -> SchedulerResult<usize>;

    async fn clear_all(&self) -> SchedulerResult<bool>;

    fn invalidate_caches(&self);
}

/// Turn a draft into a storable task: validate the name, assign a ULID,
/// stamp timestamps, and resolve the schedule expression (offset, natural
/// language, ISO, vague term - in that order) to a concrete instant.
/// Vague terms also raise the priority when the caller left it unset.
pub(crate) fn materialize_draft(
    draft: NewTask,
    processor: &DateTimeProcessor,
    default_priority: u8,
    now: DateTime<Utc>,
) -> SchedulerResult<Task> {
    if draft.name.trim().is_empty() {
        return Err(SchedulerError::InvalidTask("task name is required".into()));
    }

    let metadata = match draft.metadata {
        Value::Object(map) => Value::Object(map),
        Value::Null => Value::Object(Map::new()),
        other => {
            return Err(SchedulerError::InvalidTask(format!(
                "metadata must be an object, got {other}"
            )))
        }
    };

    let mut priority = draft.priority;
    let scheduled_time = match draft.scheduled {
        Some(ScheduleSpec::At(instant)) => Some(instant),
        Some(ScheduleSpec::Expr(expr)) => Some(resolve_schedule_expr(
            &expr,
            processor,
            now,
            &mut priority,
        )),
        None => match (&draft.schedule_type, &draft.interval_expression) {
            // Interval tasks carry their next fire time from the start
            (ScheduleType::Interval, Some(expr)) => Some(initial_fire_time(expr, processor, now)?),
            _ => None,
        },
    };

    let interval = match draft.schedule_type {
        ScheduleType::Interval => Some(TaskInterval::new(
            draft.interval_expression.ok_or_else(|| {
                SchedulerError::InvalidTask("interval tasks require an interval expression".into())
            })?,
        )),
        _ => draft.interval_expression.map(TaskInterval::new),
    };

    let handler = match (&draft.handler_id, &draft.callback) {
        (Some(id), _) => HandlerBinding::Registered {
            handler_id: id.clone(),
        },
        (None, Some(_)) => HandlerBinding::Placeholder,
        (None, None) => HandlerBinding::None,
    };

    Ok(Task {
        id: draft.id.unwrap_or_else(|| Ulid::new().to_string()),
        name: draft.name,
        description: draft.description,
        status: TaskStatus::Pending,
        schedule_type: draft.schedule_type,
        priority: priority.unwrap_or(default_priority).min(10),
        scheduled_time,
        interval,
        created_at: now,
        updated_at: now,
        last_executed_at: None,
        metadata,
        handler,
        callback: draft.callback,
    })
}

/// Resolve a schedule expression string. Unparseable input falls back to
/// sixty seconds from now rather than failing the store.
fn resolve_schedule_expr(
    expr: &str,
    processor: &DateTimeProcessor,
    now: DateTime<Utc>,
    priority: &mut Option<u8>,
) -> DateTime<Utc> {
    if let Some(offset) = parse_offset(expr) {
        return now + offset;
    }
    if let Some(instant) = processor.parse_natural_language(expr, now) {
        return instant;
    }
    if let Some(vague) = processor.translate_vague_term(expr, now) {
        if priority.is_none() {
            *priority = Some(vague.priority);
        }
        return vague.date;
    }
    debug!("unparseable schedule expression '{}', deferring 60s", expr);
    now + Duration::seconds(60)
}

/// First fire time for a new interval task: "N unit" from now, or the next
/// cron occurrence.
fn initial_fire_time(
    expr: &str,
    processor: &DateTimeProcessor,
    now: DateTime<Utc>,
) -> SchedulerResult<DateTime<Utc>> {
    if let Ok(instant) = processor.calculate_interval(now, expr) {
        return Ok(instant);
    }
    processor
        .next_execution_from_cron(expr, now)
        .ok_or_else(|| SchedulerError::InvalidInterval(expr.to_string()))
}

/// Compact offset form: digits followed by a single s/m/h/d unit ("90m")
fn parse_offset(expr: &str) -> Option<Duration> {
    let trimmed = expr.trim();
    if trimmed.len() < 2 {
        return None;
    }
    let (digits, unit) = trimmed.split_at(trimmed.len() - 1);
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let amount: i64 = digits.parse().ok()?;
    match unit {
        "s" => Some(Duration::seconds(amount)),
        "m" => Some(Duration::minutes(amount)),
        "h" => Some(Duration::hours(amount)),
        "d" => Some(Duration::days(amount)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn processor() -> DateTimeProcessor {
        DateTimeProcessor::default()
    }

    #[test]
    fn test_materialize_requires_name() {
        let draft = NewTask::new("  ");
        let err = materialize_draft(draft, &processor(), 5, Utc::now()).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTask(_)));
    }

    #[test]
    fn test_materialize_assigns_ulid_and_timestamps() {
        let now = Utc::now();
        let task = materialize_draft(NewTask::new("a"), &processor(), 5, now).unwrap();
        assert_eq!(task.id.len(), 26);
        assert!(Ulid::from_string(&task.id).is_ok());
        assert_eq!(task.created_at, now);
        assert_eq!(task.updated_at, now);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, 5);
    }

    #[test]
    fn test_offset_expression_is_relative_to_now() {
        let now = Utc::now();
        let draft = NewTask::new("a").with_schedule(ScheduleSpec::Expr("90m".into()));
        let task = materialize_draft(draft, &processor(), 5, now).unwrap();
        assert_eq!(task.scheduled_time, Some(now + Duration::minutes(90)));
    }

    #[test]
    fn test_vague_expression_sets_priority_when_unset() {
        let now = Utc::now();
        let draft = NewTask::new("a").with_schedule(ScheduleSpec::Expr("urgent".into()));
        let task = materialize_draft(draft, &processor(), 5, now).unwrap();
        assert_eq!(task.scheduled_time, Some(now));
        assert_eq!(task.priority, 10);

        // Explicit priority wins over the vague term's
        let draft = NewTask::new("a")
            .with_schedule(ScheduleSpec::Expr("urgent".into()))
            .with_priority(3);
        let task = materialize_draft(draft, &processor(), 5, now).unwrap();
        assert_eq!(task.priority, 3);
    }

    #[test]
    fn test_unparseable_expression_falls_back_to_60s() {
        let now = Utc::now();
        let draft = NewTask::new("a").with_schedule(ScheduleSpec::Expr("???".into()));
        let task = materialize_draft(draft, &processor(), 5, now).unwrap();
        assert_eq!(task.scheduled_time, Some(now + Duration::seconds(60)));
    }

    #[test]
    fn test_interval_draft_gets_initial_fire_time() {
        let now = Utc::now();
        let draft = NewTask::interval("tick", "1 hour");
        let task = materialize_draft(draft, &processor(), 5, now).unwrap();
        assert_eq!(task.scheduled_time, Some(now + Duration::hours(1)));
        assert_eq!(task.interval.as_ref().unwrap().execution_count, 0);
    }

    #[test]
    fn test_non_object_metadata_is_rejected() {
        let draft = NewTask::new("a").with_metadata(json!("not an object"));
        assert!(materialize_draft(draft, &processor(), 5, Utc::now()).is_err());
    }

    #[test]
    fn test_handler_binding_derivation() {
        let now = Utc::now();
        let with_id = NewTask::new("a").with_handler_id("h-1");
        let task = materialize_draft(with_id, &processor(), 5, now).unwrap();
        assert_eq!(
            task.handler,
            HandlerBinding::Registered {
                handler_id: "h-1".into()
            }
        );

        let with_callback = NewTask::new("a")
            .with_handler(crate::handler::handler_fn(|_| async { Ok(Value::Null) }));
        let task = materialize_draft(with_callback, &processor(), 5, now).unwrap();
        assert_eq!(task.handler, HandlerBinding::Placeholder);

        let bare = materialize_draft(NewTask::new("a"), &processor(), 5, now).unwrap();
        assert_eq!(bare.handler, HandlerBinding::None);
    }

    #[test]
    fn test_parse_offset_shapes() {
        assert_eq!(parse_offset("30s"), Some(Duration::seconds(30)));
        assert_eq!(parse_offset("2h"), Some(Duration::hours(2)));
        assert_eq!(parse_offset("7d"), Some(Duration::days(7)));
        assert_eq!(parse_offset("2 h"), None);
        assert_eq!(parse_offset("h"), None);
        assert_eq!(parse_offset("30x"), None);
    }
}

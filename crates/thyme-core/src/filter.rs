//! Task filter model
//!
//! Filters compose conjunctively. Every filter has two evaluation paths:
//! the registry compiles what it can into the storage filter DSL, and the
//! residue (date ranges, tag sets, due checks) is applied in-process via
//! `matches`/`apply`. The in-memory registry uses the in-process path for
//! everything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::{ScheduleType, Task, TaskStatus};
use thyme_store::lookup_path;

/// Closed date interval (both ends inclusive)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant <= self.end
    }
}

/// Sort key for query results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortBy {
    Priority,
    CreatedAt,
    ScheduledTime,
    LastExecutedAt,
    /// Any other payload field by name
    Field(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Conjunctive task query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_contains: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statuses: Option<Vec<TaskStatus>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_types: Option<Vec<ScheduleType>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_priority: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_priority: Option<u8>,
    /// All of these tags must be present (`metadata.tags`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// At least one of these tags must be present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub any_tags: Option<Vec<String>>,
    /// Pending with a fire time at or before now
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_due_now: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_overdue: bool,
    /// Nested object matched recursively against task metadata; nested keys
    /// flatten to dotted paths
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_between: Option<DateRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_between: Option<DateRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_executed_between: Option<DateRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<SortBy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_direction: Option<SortDirection>,
}

impl TaskFilter {
    pub fn pending() -> Self {
        Self {
            statuses: Some(vec![TaskStatus::Pending]),
            ..Default::default()
        }
    }

    pub fn due_now() -> Self {
        Self {
            is_due_now: true,
            ..Default::default()
        }
    }

    pub fn by_status(status: TaskStatus) -> Self {
        Self {
            statuses: Some(vec![status]),
            ..Default::default()
        }
    }

    /// Tasks carrying the given agent id in `metadata.agentId.id`
    pub fn for_agent(agent_id: &str) -> Self {
        Self {
            metadata: Some(serde_json::json!({"agentId": {"id": agent_id}})),
            ..Default::default()
        }
    }

    /// Full in-process evaluation of this filter against one task
    pub fn matches(&self, task: &Task, now: DateTime<Utc>) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &task.id) {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if &task.name != name {
                return false;
            }
        }
        if let Some(fragment) = &self.name_contains {
            if !task
                .name
                .to_lowercase()
                .contains(&fragment.to_lowercase())
            {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(types) = &self.schedule_types {
            if !types.contains(&task.schedule_type) {
                return false;
            }
        }
        if let Some(min) = self.min_priority {
            if task.priority < min {
                return false;
            }
        }
        if let Some(max) = self.max_priority {
            if task.priority > max {
                return false;
            }
        }
        if let Some(required) = &self.tags {
            let task_tags = task.tags();
            if !required.iter().all(|t| task_tags.contains(t)) {
                return false;
            }
        }
        if let Some(any) = &self.any_tags {
            let task_tags = task.tags();
            if !any.iter().any(|t| task_tags.contains(t)) {
                return false;
            }
        }
        if (self.is_due_now || self.is_overdue) && !task.is_due(now) {
            return false;
        }
        if let Some(metadata) = &self.metadata {
            for (path, expected) in flatten_leaves(metadata) {
                match lookup_path(&task.metadata, &path) {
                    Some(actual) if values_equal(actual, &expected) => {}
                    _ => return false,
                }
            }
        }
        if let Some(range) = &self.created_between {
            if !range.contains(task.created_at) {
                return false;
            }
        }
        if let Some(range) = &self.scheduled_between {
            match task.scheduled_time {
                Some(t) if range.contains(t) => {}
                _ => return false,
            }
        }
        if let Some(range) = &self.last_executed_between {
            match task.last_executed_at {
                Some(t) if range.contains(t) => {}
                _ => return false,
            }
        }
        true
    }

    /// Filter, sort, and paginate in-process
    pub fn apply(&self, tasks: Vec<Task>, now: DateTime<Utc>) -> Vec<Task> {
        let mut matched: Vec<Task> = tasks
            .into_iter()
            .filter(|t| self.matches(t, now))
            .collect();
        self.sort(&mut matched);

        let offset = self.offset.unwrap_or(0);
        let mut page: Vec<Task> = matched.into_iter().skip(offset).collect();
        if let Some(limit) = self.limit {
            page.truncate(limit);
        }
        page
    }

    pub fn sort(&self, tasks: &mut [Task]) {
        let Some(sort_by) = &self.sort_by else {
            return;
        };
        let descending = self.sort_direction == Some(SortDirection::Desc);

        match sort_by {
            SortBy::Priority => tasks.sort_by_key(|t| t.priority),
            SortBy::CreatedAt => tasks.sort_by_key(|t| t.created_at),
            SortBy::ScheduledTime => tasks.sort_by_key(|t| t.scheduled_time),
            SortBy::LastExecutedAt => tasks.sort_by_key(|t| t.last_executed_at),
            SortBy::Field(field) => {
                tasks.sort_by(|a, b| {
                    let av = field_value(a, field);
                    let bv = field_value(b, field);
                    compare_values(&av, &bv)
                });
            }
        }
        if descending {
            tasks.reverse();
        }
    }

    /// True when the result set stays stable enough to cache: the bare
    /// pending query, or any due/overdue query. Everything else bypasses
    /// the query cache.
    pub fn is_hot(&self) -> bool {
        if self.is_due_now || self.is_overdue {
            return true;
        }
        *self == TaskFilter::pending()
    }

    /// Stable key for the query cache
    pub fn cache_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Whether any clause needs in-process evaluation after a DSL fetch
    pub fn has_residual_clauses(&self) -> bool {
        self.is_due_now
            || self.is_overdue
            || self.tags.is_some()
            || self.any_tags.is_some()
            || self.created_between.is_some()
            || self.scheduled_between.is_some()
            || self.last_executed_between.is_some()
    }
}

/// Flatten a nested object to (dotted path, leaf value) pairs
pub(crate) fn flatten_leaves(value: &Value) -> Vec<(String, Value)> {
    let mut leaves = Vec::new();
    collect_leaves(value, String::new(), &mut leaves);
    leaves
}

fn collect_leaves(value: &Value, prefix: String, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                collect_leaves(child, path, out);
            }
        }
        leaf => out.push((prefix, leaf.clone())),
    }
}

/// Loose equality: numbers compare as f64
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn field_value(task: &Task, field: &str) -> Value {
    task.to_payload()
        .ok()
        .and_then(|p| lookup_path(&p, field).cloned())
        .unwrap_or(Value::Null)
}

fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => format!("{a}").cmp(&format!("{b}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::HandlerBinding;
    use chrono::TimeZone;
    use serde_json::json;

    fn task(name: &str, status: TaskStatus, priority: u8) -> Task {
        let now = Utc::now();
        Task {
            id: ulid::Ulid::new().to_string(),
            name: name.into(),
            description: None,
            status,
            schedule_type: ScheduleType::Explicit,
            priority,
            scheduled_time: None,
            interval: None,
            created_at: now,
            updated_at: now,
            last_executed_at: None,
            metadata: json!({}),
            handler: HandlerBinding::None,
            callback: None,
        }
    }

    #[test]
    fn test_status_and_priority_clauses() {
        let now = Utc::now();
        let mut filter = TaskFilter::pending();
        filter.min_priority = Some(6);

        let mut t = task("a", TaskStatus::Pending, 7);
        assert!(filter.matches(&t, now));

        t.priority = 5;
        assert!(!filter.matches(&t, now));

        t.priority = 7;
        t.status = TaskStatus::Completed;
        assert!(!filter.matches(&t, now));
    }

    #[test]
    fn test_due_now_is_inclusive_of_now() {
        let now = Utc::now();
        let filter = TaskFilter::due_now();

        let mut t = task("a", TaskStatus::Pending, 5);
        t.scheduled_time = Some(now);
        assert!(filter.matches(&t, now));

        t.scheduled_time = Some(now + chrono::Duration::seconds(1));
        assert!(!filter.matches(&t, now));

        t.scheduled_time = None;
        assert!(!filter.matches(&t, now));
    }

    #[test]
    fn test_metadata_dotted_path_match() {
        let now = Utc::now();
        let mut t = task("a", TaskStatus::Pending, 5);
        t.metadata = json!({"agentId": {"namespace": "agent", "type": "agent", "id": "agent-1"}});

        assert!(TaskFilter::for_agent("agent-1").matches(&t, now));
        assert!(!TaskFilter::for_agent("agent-2").matches(&t, now));
    }

    #[test]
    fn test_tags_all_of_and_any_of() {
        let now = Utc::now();
        let mut t = task("a", TaskStatus::Pending, 5);
        t.metadata = json!({"tags": ["reports", "daily"]});

        let mut all_of = TaskFilter::default();
        all_of.tags = Some(vec!["reports".into(), "daily".into()]);
        assert!(all_of.matches(&t, now));

        all_of.tags = Some(vec!["reports".into(), "weekly".into()]);
        assert!(!all_of.matches(&t, now));

        let mut any_of = TaskFilter::default();
        any_of.any_tags = Some(vec!["weekly".into(), "daily".into()]);
        assert!(any_of.matches(&t, now));
    }

    #[test]
    fn test_date_range_is_closed() {
        let now = Utc::now();
        let start = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2023, 1, 31, 0, 0, 0).unwrap();

        let mut t = task("a", TaskStatus::Pending, 5);
        t.created_at = end;

        let mut filter = TaskFilter::default();
        filter.created_between = Some(DateRange::new(start, end));
        assert!(filter.matches(&t, now));

        t.created_at = end + chrono::Duration::milliseconds(1);
        assert!(!filter.matches(&t, now));
    }

    #[test]
    fn test_apply_sorts_and_paginates() {
        let now = Utc::now();
        let tasks = vec![
            task("low", TaskStatus::Pending, 2),
            task("high", TaskStatus::Pending, 9),
            task("mid", TaskStatus::Pending, 5),
        ];

        let mut filter = TaskFilter::default();
        filter.sort_by = Some(SortBy::Priority);
        filter.sort_direction = Some(SortDirection::Desc);
        filter.limit = Some(2);

        let result = filter.apply(tasks, now);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].name, "high");
        assert_eq!(result[1].name, "mid");
    }

    #[test]
    fn test_sort_by_custom_field() {
        let now = Utc::now();
        let mut a = task("a", TaskStatus::Pending, 5);
        a.metadata = json!({"weight": 3});
        let mut b = task("b", TaskStatus::Pending, 5);
        b.metadata = json!({"weight": 1});

        let mut filter = TaskFilter::default();
        filter.sort_by = Some(SortBy::Field("metadata.weight".into()));

        let result = filter.apply(vec![a, b], now);
        assert_eq!(result[0].name, "b");
    }

    #[test]
    fn test_hot_query_detection() {
        assert!(TaskFilter::pending().is_hot());
        assert!(TaskFilter::due_now().is_hot());

        let mut pending_with_limit = TaskFilter::pending();
        pending_with_limit.limit = Some(10);
        assert!(!pending_with_limit.is_hot());

        assert!(!TaskFilter::for_agent("agent-1").is_hot());
    }

    #[test]
    fn test_cache_key_is_stable_and_distinct() {
        assert_eq!(
            TaskFilter::pending().cache_key(),
            TaskFilter::pending().cache_key()
        );
        assert_ne!(
            TaskFilter::pending().cache_key(),
            TaskFilter::due_now().cache_key()
        );
    }

    #[test]
    fn test_flatten_leaves() {
        let nested = json!({"a": {"b": {"c": 1}}, "d": "x"});
        let mut leaves = flatten_leaves(&nested);
        leaves.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(
            leaves,
            vec![("a.b.c".to_string(), json!(1)), ("d".to_string(), json!("x"))]
        );
    }

    #[test]
    fn test_filter_serde_roundtrip() {
        // Filters serialize to a stable camelCase wire form
        let mut filter = TaskFilter::pending();
        filter.name_contains = Some("report".into());
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json["nameContains"], "report");
        let back: TaskFilter = serde_json::from_value(json).unwrap();
        assert_eq!(back, filter);
    }
}

//! Task model
//!
//! The central scheduled unit of work: identity (ULID), status, schedule
//! type, priority, temporal fields, free-form metadata, and a handler
//! binding. The live callback is process-local and never persisted.

use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

use crate::error::{SchedulerError, SchedulerResult};
use crate::handler::TaskHandler;

/// Sentinel persisted in place of a live handler
pub const HANDLER_PLACEHOLDER: &str = "function_handler_placeholder";

// ============================================================================
// Enums
// ============================================================================

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Legal transitions: PENDING -> RUNNING -> (COMPLETED | FAILED),
    /// PENDING -> CANCELLED, and RUNNING -> PENDING (interval re-arm).
    /// COMPLETED -> CANCELLED exists only via `Task::tombstone`.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        matches!(
            (self, to),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Pending)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
        )
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(anyhow!("Invalid task status: {}", s)),
        }
    }
}

/// How a task becomes due
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    /// Fires at/after `scheduled_time`
    Explicit,
    /// Recurring; `scheduled_time` holds the next fire time
    Interval,
    /// No time; eligible whenever the priority threshold is met
    Priority,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::Explicit => "explicit",
            ScheduleType::Interval => "interval",
            ScheduleType::Priority => "priority",
        }
    }
}

impl Default for ScheduleType {
    fn default() -> Self {
        ScheduleType::Explicit
    }
}

impl FromStr for ScheduleType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "explicit" => Ok(ScheduleType::Explicit),
            "interval" => Ok(ScheduleType::Interval),
            "priority" => Ok(ScheduleType::Priority),
            _ => Err(anyhow!("Invalid schedule type: {}", s)),
        }
    }
}

// ============================================================================
// Supporting Types
// ============================================================================

/// Recurrence state for interval tasks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInterval {
    /// "N unit" interval or a cron expression
    pub expression: String,
    #[serde(default)]
    pub execution_count: u32,
}

impl TaskInterval {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            execution_count: 0,
        }
    }
}

/// Structured agent identifier carried in task metadata. Treated as an
/// opaque tagged value at the API boundary and flattened to dotted paths
/// only inside storage filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentId {
    pub namespace: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

impl AgentId {
    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            namespace: "agent".to_string(),
            kind: "agent".to_string(),
            id: id.into(),
        }
    }
}

/// Persisted representation of a task's handler. Live callables cannot be
/// serialized; tasks store either an opaque placeholder or a stable
/// `handlerId` the process-local handler registry resolves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HandlerBinding {
    #[default]
    None,
    Placeholder,
    Registered {
        handler_id: String,
    },
}

impl HandlerBinding {
    fn to_value(&self) -> Value {
        match self {
            HandlerBinding::None => Value::Null,
            HandlerBinding::Placeholder => Value::String(HANDLER_PLACEHOLDER.to_string()),
            HandlerBinding::Registered { handler_id } => json!({
                "type": "serialized_function",
                "handlerId": handler_id,
            }),
        }
    }

    fn from_value(value: &Value) -> Self {
        match value {
            Value::String(_) => HandlerBinding::Placeholder,
            Value::Object(obj) => match obj.get("handlerId").and_then(Value::as_str) {
                Some(id) => HandlerBinding::Registered {
                    handler_id: id.to_string(),
                },
                None => HandlerBinding::Placeholder,
            },
            _ => HandlerBinding::None,
        }
    }
}

impl Serialize for HandlerBinding {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for HandlerBinding {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(HandlerBinding::from_value(&value))
    }
}

// ============================================================================
// Task
// ============================================================================

/// A scheduled task
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: TaskStatus,
    pub schedule_type: ScheduleType,
    pub priority: u8,
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub interval: Option<TaskInterval>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_executed_at: Option<DateTime<Utc>>,
    #[serde(default = "empty_metadata")]
    pub metadata: Value,
    #[serde(default)]
    pub handler: HandlerBinding,
    /// Live callback; process-local, never persisted
    #[serde(skip)]
    pub callback: Option<TaskHandler>,
}

fn empty_metadata() -> Value {
    Value::Object(Map::new())
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status)
            .field("schedule_type", &self.schedule_type)
            .field("priority", &self.priority)
            .field("scheduled_time", &self.scheduled_time)
            .field("interval", &self.interval)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

impl Task {
    /// Apply a status transition, enforcing the legal DAG
    pub fn transition(&mut self, to: TaskStatus) -> SchedulerResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(SchedulerError::InvalidTask(format!(
                "illegal status transition {} -> {} for task {}",
                self.status.as_str(),
                to.as_str(),
                self.id
            )));
        }
        self.status = to;
        Ok(())
    }

    /// Explicit COMPLETED -> CANCELLED override used for tombstoning
    pub fn tombstone(&mut self) -> SchedulerResult<()> {
        match self.status {
            TaskStatus::Completed | TaskStatus::Pending => {
                self.status = TaskStatus::Cancelled;
                Ok(())
            }
            other => Err(SchedulerError::InvalidTask(format!(
                "cannot tombstone task {} in status {}",
                self.id,
                other.as_str()
            ))),
        }
    }

    /// Pending with a fire time at or before `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending
            && self.scheduled_time.map_or(false, |t| t <= now)
    }

    pub fn agent_id(&self) -> Option<AgentId> {
        let value = self.metadata.get("agentId")?;
        serde_json::from_value(value.clone()).ok()
    }

    /// Tags live under `metadata.tags` as a string array
    pub fn tags(&self) -> Vec<String> {
        self.metadata
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Optional per-task handler timeout from `metadata.timeoutMs`
    pub fn timeout_ms(&self) -> Option<u64> {
        self.metadata.get("timeoutMs").and_then(Value::as_u64)
    }

    pub fn set_metadata_key(&mut self, key: &str, value: Value) {
        if let Some(obj) = self.metadata.as_object_mut() {
            obj.insert(key.to_string(), value);
        }
    }

    /// Serialize to the persisted payload shape
    pub fn to_payload(&self) -> SchedulerResult<Value> {
        serde_json::to_value(self)
            .map_err(|e| SchedulerError::InvalidTask(format!("unserializable task: {e}")))
    }

    /// Lenient decode of a stored payload.
    ///
    /// Accepts the regular task shape (string name/status/scheduleType) and
    /// the legacy "memory task" shape (`type: "task"` or `metadata.taskType`
    /// set, with the status recovered from `metadata.status`). Payloads with
    /// no recognisable status are rejected. Dates may be ISO strings or
    /// epoch seconds/milliseconds.
    pub fn from_payload(payload: &Value) -> SchedulerResult<Task> {
        let obj = payload
            .as_object()
            .ok_or_else(|| SchedulerError::InvalidTask("payload is not an object".into()))?;

        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SchedulerError::InvalidTask("payload has no id".into()))?
            .to_string();

        let metadata = obj
            .get("metadata")
            .filter(|m| m.is_object())
            .cloned()
            .unwrap_or_else(empty_metadata);

        let is_memory_shape = obj.get("type").and_then(Value::as_str) == Some("task")
            || metadata.get("taskType").is_some();

        let status_str = obj
            .get("status")
            .and_then(Value::as_str)
            .or_else(|| {
                is_memory_shape
                    .then(|| metadata.get("status").and_then(Value::as_str))
                    .flatten()
            })
            .ok_or_else(|| {
                SchedulerError::InvalidTask(format!("payload {id} has no recognisable status"))
            })?;
        let status = TaskStatus::from_str(status_str).map_err(|e| {
            SchedulerError::InvalidTask(format!("payload {id}: {e}"))
        })?;

        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| {
                metadata
                    .get("title")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| id.clone());

        let schedule_type = obj
            .get("scheduleType")
            .and_then(Value::as_str)
            .and_then(|s| ScheduleType::from_str(s).ok())
            .unwrap_or(ScheduleType::Explicit);

        let priority = obj
            .get("priority")
            .and_then(Value::as_u64)
            .map(|p| p.min(10) as u8)
            .unwrap_or(5);

        let now = Utc::now();
        let created_at = obj
            .get("createdAt")
            .and_then(parse_date_value)
            .unwrap_or(now);
        let updated_at = obj
            .get("updatedAt")
            .and_then(parse_date_value)
            .unwrap_or(now);

        let interval = obj.get("interval").and_then(|v| {
            let iobj = v.as_object()?;
            Some(TaskInterval {
                expression: iobj.get("expression")?.as_str()?.to_string(),
                execution_count: iobj
                    .get("executionCount")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32,
            })
        });

        Ok(Task {
            id,
            name,
            description: obj
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            status,
            schedule_type,
            priority,
            scheduled_time: obj.get("scheduledTime").and_then(parse_date_value),
            interval,
            created_at,
            updated_at,
            last_executed_at: obj.get("lastExecutedAt").and_then(parse_date_value),
            metadata,
            handler: obj
                .get("handler")
                .map(HandlerBinding::from_value)
                .unwrap_or_default(),
            callback: None,
        })
    }
}

/// Parse a stored date: ISO string, epoch seconds, or epoch milliseconds
/// (values above 10^12 are treated as milliseconds).
pub(crate) fn parse_date_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
                return Some(dt.and_utc());
            }
            if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                return Some(dt.and_utc());
            }
            None
        }
        Value::Number(n) => {
            let n = n.as_f64()?;
            if n > 1e12 {
                Utc.timestamp_millis_opt(n as i64).single()
            } else {
                Utc.timestamp_opt(n as i64, 0).single()
            }
        }
        _ => None,
    }
}

// ============================================================================
// Drafts
// ============================================================================

/// When a draft should fire: a concrete instant, or an expression that is
/// normalised once at store time (never at poll time).
#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    At(DateTime<Utc>),
    /// Offset (`"90m"`), natural language, ISO string, or a vague term
    Expr(String),
}

/// Draft for creating a task. `name` is required; everything else has a
/// sensible default applied at store time.
#[derive(Clone, Default)]
pub struct NewTask {
    pub id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub schedule_type: ScheduleType,
    pub priority: Option<u8>,
    pub scheduled: Option<ScheduleSpec>,
    pub interval_expression: Option<String>,
    pub metadata: Value,
    pub handler_id: Option<String>,
    pub callback: Option<TaskHandler>,
}

impl NewTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metadata: empty_metadata(),
            ..Default::default()
        }
    }

    /// One-off task firing at a concrete instant
    pub fn explicit(name: impl Into<String>, at: DateTime<Utc>) -> Self {
        let mut draft = Self::new(name);
        draft.schedule_type = ScheduleType::Explicit;
        draft.scheduled = Some(ScheduleSpec::At(at));
        draft
    }

    /// Recurring task; `expression` is "N unit" or cron
    pub fn interval(name: impl Into<String>, expression: impl Into<String>) -> Self {
        let mut draft = Self::new(name);
        draft.schedule_type = ScheduleType::Interval;
        draft.interval_expression = Some(expression.into());
        draft
    }

    /// Priority-driven task with no fire time
    pub fn priority_based(name: impl Into<String>, priority: u8) -> Self {
        let mut draft = Self::new(name);
        draft.schedule_type = ScheduleType::Priority;
        draft.priority = Some(priority);
        draft
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority.min(10));
        self
    }

    pub fn with_schedule(mut self, spec: ScheduleSpec) -> Self {
        self.scheduled = Some(spec);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_handler(mut self, callback: TaskHandler) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_handler_id(mut self, handler_id: impl Into<String>) -> Self {
        self.handler_id = Some(handler_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_task() -> Task {
        Task {
            id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".into(),
            name: "test".into(),
            description: None,
            status: TaskStatus::Pending,
            schedule_type: ScheduleType::Explicit,
            priority: 5,
            scheduled_time: None,
            interval: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_executed_at: None,
            metadata: empty_metadata(),
            handler: HandlerBinding::None,
            callback: None,
        }
    }

    #[test]
    fn test_status_transitions() {
        let mut task = base_task();
        assert!(task.transition(TaskStatus::Running).is_ok());
        assert!(task.transition(TaskStatus::Completed).is_ok());
        // Completed is terminal outside the tombstone override
        assert!(task.transition(TaskStatus::Running).is_err());
        assert!(task.transition(TaskStatus::Cancelled).is_err());
        assert!(task.tombstone().is_ok());
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_interval_rearm_transition_is_legal() {
        let mut task = base_task();
        task.transition(TaskStatus::Running).unwrap();
        assert!(task.transition(TaskStatus::Pending).is_ok());
    }

    #[test]
    fn test_pending_to_cancelled() {
        let mut task = base_task();
        assert!(task.transition(TaskStatus::Cancelled).is_ok());
    }

    #[test]
    fn test_payload_roundtrip_preserves_nested_metadata() {
        let mut task = base_task();
        task.metadata = serde_json::json!({
            "agentId": {"namespace": "agent", "type": "agent", "id": "agent-1"},
            "nested": {"deep": {"value": [1, 2, 3]}},
        });
        task.handler = HandlerBinding::Registered {
            handler_id: "h-1".into(),
        };

        let payload = task.to_payload().unwrap();
        assert_eq!(payload["handler"]["handlerId"], "h-1");

        let decoded = Task::from_payload(&payload).unwrap();
        assert_eq!(decoded.id, task.id);
        assert_eq!(decoded.metadata, task.metadata);
        assert_eq!(decoded.handler, task.handler);
        assert_eq!(
            decoded.agent_id(),
            Some(AgentId::agent("agent-1"))
        );
    }

    #[test]
    fn test_from_payload_rejects_missing_status() {
        let payload = serde_json::json!({"id": "x", "name": "no status"});
        assert!(Task::from_payload(&payload).is_err());
    }

    #[test]
    fn test_from_payload_memory_task_shape() {
        let payload = serde_json::json!({
            "id": "mem-1",
            "type": "task",
            "metadata": {"status": "PENDING", "title": "from memory"},
        });
        let task = Task::from_payload(&payload).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.name, "from memory");
    }

    #[test]
    fn test_from_payload_epoch_heuristic() {
        let ms = 1_700_000_000_000_i64;
        let payload = serde_json::json!({
            "id": "x",
            "name": "epoch",
            "status": "pending",
            "scheduleType": "explicit",
            "createdAt": ms,
            "updatedAt": ms / 1000,
        });
        let task = Task::from_payload(&payload).unwrap();
        assert_eq!(task.created_at.timestamp_millis(), ms);
        assert_eq!(task.updated_at.timestamp(), ms / 1000);
    }

    #[test]
    fn test_handler_binding_wire_forms() {
        assert_eq!(
            HandlerBinding::from_value(&Value::String(HANDLER_PLACEHOLDER.into())),
            HandlerBinding::Placeholder
        );
        assert_eq!(
            HandlerBinding::from_value(&serde_json::json!({
                "type": "serialized_function",
                "handlerId": "send-report",
            })),
            HandlerBinding::Registered {
                handler_id: "send-report".into()
            }
        );
        assert_eq!(HandlerBinding::from_value(&Value::Null), HandlerBinding::None);
    }
}

//! Vector-store-backed task registry
//!
//! Persists tasks as points in a `StorageBackend` collection. The store only
//! accepts UUID point ids, so ULID task ids are deterministically mapped:
//! a valid ULID decodes to its own 128 bits, anything else derives a v5
//! UUID. The ULID kept in the payload stays authoritative on read.
//!
//! Semantic search is not used; every point carries the same zero vector.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::warn;
use ulid::Ulid;
use uuid::Uuid;

use thyme_store::{
    Condition, Distance, Filter as StoreFilter, MatchValue, Point, PointSelector, ScrollRequest,
    StorageBackend,
};

use crate::datetime::DateTimeProcessor;
use crate::error::{SchedulerError, SchedulerResult};
use crate::filter::{flatten_leaves, TaskFilter};
use crate::registry::{materialize_draft, TaskRegistry};
use crate::task::{NewTask, Task, TaskStatus};

/// Collections are created with this dimensionality; the vectors are
/// zero-filled placeholders.
pub const VECTOR_SIZE: usize = 1536;

/// Upper bound on one in-process filter pass
const MAX_SCAN: usize = 10_000;

pub struct VectorTaskRegistry {
    backend: Arc<dyn StorageBackend>,
    collection: String,
    processor: DateTimeProcessor,
    default_priority: u8,
}

impl VectorTaskRegistry {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        collection: impl Into<String>,
        processor: DateTimeProcessor,
        default_priority: u8,
    ) -> Self {
        Self {
            backend,
            collection: collection.into(),
            processor,
            default_priority,
        }
    }

    fn point_for(&self, task: &Task) -> SchedulerResult<Point> {
        Ok(Point::new(
            ulid_to_uuid(&task.id),
            vec![0.0; VECTOR_SIZE],
            task.to_payload()?,
        ))
    }

    /// Decode a batch of payloads, skipping the undecodable ones
    fn decode_points(&self, points: Vec<Point>) -> Vec<Task> {
        points
            .into_iter()
            .filter_map(|p| match Task::from_payload(&p.payload) {
                Ok(task) => Some(task),
                Err(e) => {
                    warn!("skipping undecodable task payload {}: {}", p.id, e);
                    None
                }
            })
            .collect()
    }
}

/// Deterministically derive a UUID point id from a task id. A well-formed
/// ULID is 128 bits and converts losslessly; other ids hash via UUIDv5.
/// Collision resistance is not required here because task ids originate
/// from trusted code.
pub fn ulid_to_uuid(id: &str) -> Uuid {
    match Ulid::from_string(id) {
        Ok(ulid) => Uuid::from_u128(u128::from(ulid)),
        Err(_) => Uuid::new_v5(&Uuid::NAMESPACE_OID, id.as_bytes()),
    }
}

/// Compile the DSL-expressible part of a task filter. Date ranges, tag
/// sets, and due checks stay in-process.
fn to_store_filter(filter: &TaskFilter) -> StoreFilter {
    let mut must = Vec::new();

    if let Some(ids) = &filter.ids {
        must.push(Condition::HasId(
            ids.iter().map(|id| ulid_to_uuid(id)).collect(),
        ));
    }
    if let Some(name) = &filter.name {
        must.push(Condition::Match {
            key: "name".into(),
            value: MatchValue::Value(Value::String(name.clone())),
        });
    }
    if let Some(fragment) = &filter.name_contains {
        must.push(Condition::TextContains {
            key: "name".into(),
            contains: fragment.clone(),
        });
    }
    if let Some(statuses) = &filter.statuses {
        must.push(match_any(
            "status",
            statuses.iter().map(|s| s.as_str().to_string()).collect(),
        ));
    }
    if filter.is_due_now || filter.is_overdue {
        // The scheduled-time comparison happens in-process; narrowing to
        // pending keeps the fetch small
        must.push(Condition::Match {
            key: "status".into(),
            value: MatchValue::Value(Value::String(
                TaskStatus::Pending.as_str().to_string(),
            )),
        });
    }
    if let Some(types) = &filter.schedule_types {
        must.push(match_any(
            "scheduleType",
            types.iter().map(|t| t.as_str().to_string()).collect(),
        ));
    }
    if filter.min_priority.is_some() || filter.max_priority.is_some() {
        must.push(Condition::Range {
            key: "priority".into(),
            gte: filter.min_priority.map(f64::from),
            lte: filter.max_priority.map(f64::from),
        });
    }
    if let Some(metadata) = &filter.metadata {
        for (path, leaf) in flatten_leaves(metadata) {
            must.push(Condition::Match {
                key: format!("metadata.{path}"),
                value: MatchValue::Value(leaf),
            });
        }
    }

    StoreFilter {
        must,
        must_not: Vec::new(),
    }
}

fn match_any(key: &str, values: Vec<String>) -> Condition {
    if values.len() == 1 {
        Condition::Match {
            key: key.into(),
            value: MatchValue::Value(Value::String(values.into_iter().next().unwrap())),
        }
    } else {
        Condition::Match {
            key: key.into(),
            value: MatchValue::Any(values.into_iter().map(Value::String).collect()),
        }
    }
}

#[async_trait]
impl TaskRegistry for VectorTaskRegistry {
    async fn initialize(&self) -> SchedulerResult<()> {
        self.backend
            .ensure_collection(&self.collection, VECTOR_SIZE, Distance::Dot)
            .await?;
        Ok(())
    }

    async fn store(&self, draft: NewTask) -> SchedulerResult<Task> {
        let task = materialize_draft(draft, &self.processor, self.default_priority, Utc::now())?;

        let key = ulid_to_uuid(&task.id);
        let existing = self.backend.retrieve(&self.collection, &[key]).await?;
        if !existing.is_empty() {
            return Err(SchedulerError::InvalidTask(format!(
                "task id {} already exists",
                task.id
            )));
        }

        self.backend
            .upsert(&self.collection, vec![self.point_for(&task)?])
            .await?;
        Ok(task)
    }

    async fn get_by_id(&self, id: &str) -> SchedulerResult<Option<Task>> {
        let points = self
            .backend
            .retrieve(&self.collection, &[ulid_to_uuid(id)])
            .await?;
        Ok(self.decode_points(points).into_iter().next())
    }

    async fn update(&self, mut task: Task) -> SchedulerResult<Task> {
        let key = ulid_to_uuid(&task.id);
        let existing = self.backend.retrieve(&self.collection, &[key]).await?;
        if existing.is_empty() {
            return Err(SchedulerError::TaskNotFound(task.id));
        }

        task.updated_at = Utc::now();
        self.backend
            .upsert(&self.collection, vec![self.point_for(&task)?])
            .await?;
        Ok(task)
    }

    async fn delete(&self, id: &str) -> SchedulerResult<bool> {
        let key = ulid_to_uuid(id);
        let existing = self.backend.retrieve(&self.collection, &[key]).await?;
        if existing.is_empty() {
            return Ok(false);
        }
        self.backend
            .delete_points(&self.collection, PointSelector::Ids(vec![key]))
            .await?;
        Ok(true)
    }

    async fn find(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>> {
        let store_filter = to_store_filter(filter);
        let store_filter = (!store_filter.is_empty()).then_some(store_filter);

        // Pagination can be pushed down only when no clause or sort needs
        // in-process evaluation; otherwise fetch the full candidate set
        let pushdown = !filter.has_residual_clauses() && filter.sort_by.is_none();
        let request = ScrollRequest {
            filter: store_filter,
            limit: if pushdown { filter.limit.or(Some(MAX_SCAN)) } else { Some(MAX_SCAN) },
            offset: if pushdown { filter.offset } else { None },
        };

        let points = self.backend.scroll(&self.collection, request).await?;
        let tasks = self.decode_points(points);

        if pushdown {
            Ok(tasks)
        } else {
            Ok(filter.apply(tasks, Utc::now()))
        }
    }

    async fn count(&self, filter: &TaskFilter) -> SchedulerResult<usize> {
        if !filter.has_residual_clauses() {
            let store_filter = to_store_filter(filter);
            let store_filter = (!store_filter.is_empty()).then_some(store_filter);
            return Ok(self.backend.count(&self.collection, store_filter).await?);
        }

        let now = Utc::now();
        let points = self
            .backend
            .scroll(
                &self.collection,
                ScrollRequest {
                    filter: Some(to_store_filter(filter)),
                    limit: Some(MAX_SCAN),
                    offset: None,
                },
            )
            .await?;
        Ok(self
            .decode_points(points)
            .into_iter()
            .filter(|t| filter.matches(t, now))
            .count())
    }

    async fn clear_all(&self) -> SchedulerResult<bool> {
        // Drop and recreate rather than deleting point by point
        self.backend.delete_collection(&self.collection).await?;
        self.backend
            .ensure_collection(&self.collection, VECTOR_SIZE, Distance::Dot)
            .await?;
        Ok(true)
    }

    fn invalidate_caches(&self) {}
}

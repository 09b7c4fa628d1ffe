//! Thyme Storage Layer
//!
//! Point-store abstraction the task registry persists into:
//! - `StorageBackend` - async trait over a Qdrant-shaped collection of points
//! - A portable filter DSL (`Filter`, `Condition`) with in-process evaluation
//! - `memory::InMemoryBackend` - HashMap-backed store for tests and dev
//! - `qdrant::QdrantBackend` - production binding via qdrant-client

pub mod memory;
pub mod qdrant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub use memory::InMemoryBackend;
pub use qdrant::{QdrantBackend, QdrantBackendConfig};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("collection '{0}' does not exist")]
    CollectionNotFound(String),

    #[error("invalid point: {0}")]
    InvalidPoint(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Points
// ============================================================================

/// Distance metric for a collection's vector index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distance {
    Dot,
    Cosine,
    Euclid,
}

/// A stored point: UUID key, vector, and a JSON payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Point {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: Value,
}

impl Point {
    pub fn new(id: Uuid, vector: Vec<f32>, payload: Value) -> Self {
        Self {
            id,
            vector,
            payload,
        }
    }
}

/// Paged filter query over a collection
#[derive(Debug, Clone, Default)]
pub struct ScrollRequest {
    pub filter: Option<Filter>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Which points a delete targets
#[derive(Debug, Clone)]
pub enum PointSelector {
    Ids(Vec<Uuid>),
    Filter(Filter),
}

// ============================================================================
// Filter DSL
// ============================================================================

/// Match clause for a payload field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchValue {
    /// Field equals this value exactly
    Value(Value),
    /// Field equals any of these values
    Any(Vec<Value>),
}

/// A single filter clause. Keys are dotted paths into the payload
/// (e.g. `metadata.agentId.id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    HasId(Vec<Uuid>),
    Match { key: String, value: MatchValue },
    Range {
        key: String,
        gte: Option<f64>,
        lte: Option<f64>,
    },
    TextContains { key: String, contains: String },
}

/// Conjunctive filter: every `must` clause holds, no `must_not` clause does
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub must: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub must_not: Vec<Condition>,
}

impl Filter {
    pub fn is_empty(&self) -> bool {
        self.must.is_empty() && self.must_not.is_empty()
    }

    pub fn must(condition: Condition) -> Self {
        Self {
            must: vec![condition],
            must_not: Vec::new(),
        }
    }

    /// Evaluate this filter against a point in-process. Backends whose native
    /// query language covers the DSL translate instead of calling this.
    pub fn matches(&self, id: &Uuid, payload: &Value) -> bool {
        self.must.iter().all(|c| c.matches(id, payload))
            && !self.must_not.iter().any(|c| c.matches(id, payload))
    }
}

impl Condition {
    pub fn matches(&self, id: &Uuid, payload: &Value) -> bool {
        match self {
            Condition::HasId(ids) => ids.contains(id),
            Condition::Match { key, value } => match lookup_path(payload, key) {
                Some(found) => match value {
                    MatchValue::Value(v) => json_eq(found, v),
                    MatchValue::Any(vs) => vs.iter().any(|v| json_eq(found, v)),
                },
                None => false,
            },
            Condition::Range { key, gte, lte } => {
                let Some(n) = lookup_path(payload, key).and_then(Value::as_f64) else {
                    return false;
                };
                gte.map_or(true, |lo| n >= lo) && lte.map_or(true, |hi| n <= hi)
            }
            Condition::TextContains { key, contains } => lookup_path(payload, key)
                .and_then(Value::as_str)
                .map(|s| s.to_lowercase().contains(&contains.to_lowercase()))
                .unwrap_or(false),
        }
    }
}

/// Resolve a dotted path (`a.b.c`) through nested payload objects
pub fn lookup_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = payload;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Loose equality: numbers compare as f64 so `5` matches `5.0`
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

// ============================================================================
// Backend Trait
// ============================================================================

/// Async point-store interface. Implementations must tolerate repeated
/// `ensure_collection` calls for the same name.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Create the collection if it does not exist
    async fn ensure_collection(
        &self,
        name: &str,
        vector_size: usize,
        distance: Distance,
    ) -> StoreResult<()>;

    async fn collection_exists(&self, name: &str) -> StoreResult<bool>;

    async fn list_collections(&self) -> StoreResult<Vec<String>>;

    async fn delete_collection(&self, name: &str) -> StoreResult<()>;

    /// Insert or replace points by id
    async fn upsert(&self, collection: &str, points: Vec<Point>) -> StoreResult<()>;

    /// Merge payload keys into existing points without touching vectors
    async fn set_payload(
        &self,
        collection: &str,
        ids: &[Uuid],
        payload: Value,
    ) -> StoreResult<()>;

    async fn retrieve(&self, collection: &str, ids: &[Uuid]) -> StoreResult<Vec<Point>>;

    async fn scroll(&self, collection: &str, request: ScrollRequest) -> StoreResult<Vec<Point>>;

    async fn count(&self, collection: &str, filter: Option<Filter>) -> StoreResult<usize>;

    async fn delete_points(&self, collection: &str, selector: PointSelector) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_path() {
        let payload = json!({"metadata": {"agentId": {"id": "agent-1"}}});
        assert_eq!(
            lookup_path(&payload, "metadata.agentId.id"),
            Some(&json!("agent-1"))
        );
        assert_eq!(lookup_path(&payload, "metadata.agentId.namespace"), None);
        assert_eq!(lookup_path(&payload, "missing"), None);
    }

    #[test]
    fn test_match_condition() {
        let id = Uuid::new_v4();
        let payload = json!({"status": "pending", "priority": 5});

        let cond = Condition::Match {
            key: "status".into(),
            value: MatchValue::Value(json!("pending")),
        };
        assert!(cond.matches(&id, &payload));

        let cond = Condition::Match {
            key: "status".into(),
            value: MatchValue::Any(vec![json!("running"), json!("pending")]),
        };
        assert!(cond.matches(&id, &payload));

        // Integer payloads match float query values
        let cond = Condition::Match {
            key: "priority".into(),
            value: MatchValue::Value(json!(5.0)),
        };
        assert!(cond.matches(&id, &payload));
    }

    #[test]
    fn test_range_condition() {
        let id = Uuid::new_v4();
        let payload = json!({"priority": 7});

        let in_range = Condition::Range {
            key: "priority".into(),
            gte: Some(7.0),
            lte: None,
        };
        assert!(in_range.matches(&id, &payload));

        let out_of_range = Condition::Range {
            key: "priority".into(),
            gte: Some(8.0),
            lte: None,
        };
        assert!(!out_of_range.matches(&id, &payload));
    }

    #[test]
    fn test_text_contains_is_case_insensitive() {
        let id = Uuid::new_v4();
        let payload = json!({"name": "Daily Report"});
        let cond = Condition::TextContains {
            key: "name".into(),
            contains: "report".into(),
        };
        assert!(cond.matches(&id, &payload));
    }

    #[test]
    fn test_filter_must_and_must_not() {
        let id = Uuid::new_v4();
        let payload = json!({"status": "pending", "priority": 9});

        let filter = Filter {
            must: vec![Condition::Match {
                key: "status".into(),
                value: MatchValue::Value(json!("pending")),
            }],
            must_not: vec![Condition::Range {
                key: "priority".into(),
                gte: Some(9.0),
                lte: None,
            }],
        };
        assert!(!filter.matches(&id, &payload));

        let filter = Filter::must(Condition::Match {
            key: "status".into(),
            value: MatchValue::Value(json!("pending")),
        });
        assert!(filter.matches(&id, &payload));
    }
}

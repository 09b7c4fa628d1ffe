//! Qdrant-backed storage backend
//!
//! Production binding of `StorageBackend` over qdrant-client. The portable
//! filter DSL is translated to Qdrant's native filter types; conditions the
//! registry cannot express here (date ranges) are applied in-process by the
//! caller after the fetch.

use std::collections::HashMap;

use async_trait::async_trait;
use qdrant_client::qdrant::{
    point_id::PointIdOptions, CountPointsBuilder, CreateCollectionBuilder, DeletePointsBuilder,
    Distance as QdrantDistance, Filter as QdrantFilter, GetPointsBuilder, PointId, PointStruct,
    PointsIdsList, QueryPointsBuilder, Range as QdrantRange, SetPayloadPointsBuilder,
    UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::qdrant::{Condition as QdrantCondition, Value as QdrantValue};
use qdrant_client::{Payload, Qdrant};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    Condition, Distance, Filter, MatchValue, Point, PointSelector, ScrollRequest, StorageBackend,
    StoreError, StoreResult,
};

/// Connection settings for a Qdrant instance
#[derive(Debug, Clone)]
pub struct QdrantBackendConfig {
    /// Server URL, e.g. "http://localhost:6334"
    pub url: String,
    /// API key for Qdrant Cloud or authenticated instances
    pub api_key: Option<String>,
}

/// Qdrant point store
pub struct QdrantBackend {
    client: Qdrant,
}

impl QdrantBackend {
    pub fn connect(config: QdrantBackendConfig) -> StoreResult<Self> {
        let mut builder = Qdrant::from_url(&config.url);
        if let Some(api_key) = config.api_key {
            builder = builder.api_key(api_key);
        }
        let client = builder
            .build()
            .map_err(|e| StoreError::Backend(format!("qdrant connection failed: {e}")))?;
        Ok(Self { client })
    }

    fn to_qdrant_distance(distance: Distance) -> QdrantDistance {
        match distance {
            Distance::Dot => QdrantDistance::Dot,
            Distance::Cosine => QdrantDistance::Cosine,
            Distance::Euclid => QdrantDistance::Euclid,
        }
    }
}

fn backend_err(op: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(format!("qdrant {op} failed: {e}"))
}

/// Translate one DSL condition to its Qdrant counterpart
fn to_qdrant_condition(condition: &Condition) -> Option<QdrantCondition> {
    match condition {
        Condition::HasId(ids) => Some(QdrantCondition::has_id(
            ids.iter().map(|id| PointId::from(id.to_string())),
        )),
        Condition::Match { key, value } => match value {
            MatchValue::Value(v) => match v {
                Value::String(s) => Some(QdrantCondition::matches(key.clone(), s.clone())),
                Value::Bool(b) => Some(QdrantCondition::matches(key.clone(), *b)),
                Value::Number(n) => n
                    .as_i64()
                    .map(|i| QdrantCondition::matches(key.clone(), i)),
                _ => None,
            },
            MatchValue::Any(values) => {
                let keywords: Vec<String> = values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
                if keywords.len() == values.len() {
                    Some(QdrantCondition::matches(key.clone(), keywords))
                } else {
                    let integers: Vec<i64> = values.iter().filter_map(Value::as_i64).collect();
                    (integers.len() == values.len())
                        .then(|| QdrantCondition::matches(key.clone(), integers))
                }
            }
        },
        Condition::Range { key, gte, lte } => Some(QdrantCondition::range(
            key.clone(),
            QdrantRange {
                gte: *gte,
                lte: *lte,
                gt: None,
                lt: None,
            },
        )),
        Condition::TextContains { key, contains } => {
            Some(QdrantCondition::matches_text(key.clone(), contains.clone()))
        }
    }
}

/// Translate the portable filter to a Qdrant filter. Returns an error if a
/// clause has no native representation, so callers never get silently
/// widened results.
fn to_qdrant_filter(filter: &Filter) -> StoreResult<QdrantFilter> {
    let mut must = Vec::with_capacity(filter.must.len());
    for condition in &filter.must {
        must.push(to_qdrant_condition(condition).ok_or_else(|| {
            StoreError::Backend(format!("filter clause not expressible in qdrant: {condition:?}"))
        })?);
    }
    let mut must_not = Vec::with_capacity(filter.must_not.len());
    for condition in &filter.must_not {
        must_not.push(to_qdrant_condition(condition).ok_or_else(|| {
            StoreError::Backend(format!("filter clause not expressible in qdrant: {condition:?}"))
        })?);
    }
    Ok(QdrantFilter {
        must,
        must_not,
        ..Default::default()
    })
}

fn to_point_struct(point: Point) -> StoreResult<PointStruct> {
    let payload = Payload::try_from(point.payload)
        .map_err(|e| StoreError::InvalidPoint(format!("payload not an object: {e}")))?;
    Ok(PointStruct::new(
        point.id.to_string(),
        point.vector,
        payload,
    ))
}

fn parse_point_id(id: Option<PointId>) -> Uuid {
    match id.and_then(|p| p.point_id_options) {
        Some(PointIdOptions::Uuid(s)) => s.parse().unwrap_or(Uuid::nil()),
        Some(PointIdOptions::Num(n)) => Uuid::from_u128(n as u128),
        None => Uuid::nil(),
    }
}

fn payload_to_json(payload: HashMap<String, QdrantValue>) -> Value {
    Value::Object(
        payload
            .into_iter()
            .map(|(k, v)| (k, v.into_json()))
            .collect(),
    )
}

#[async_trait]
impl StorageBackend for QdrantBackend {
    async fn ensure_collection(
        &self,
        name: &str,
        vector_size: usize,
        distance: Distance,
    ) -> StoreResult<()> {
        let exists = self
            .client
            .collection_exists(name)
            .await
            .map_err(|e| backend_err("collection check", e))?;
        if exists {
            return Ok(());
        }

        self.client
            .create_collection(
                CreateCollectionBuilder::new(name).vectors_config(VectorParamsBuilder::new(
                    vector_size as u64,
                    Self::to_qdrant_distance(distance),
                )),
            )
            .await
            .map_err(|e| backend_err("create collection", e))?;
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> StoreResult<bool> {
        self.client
            .collection_exists(name)
            .await
            .map_err(|e| backend_err("collection check", e))
    }

    async fn list_collections(&self) -> StoreResult<Vec<String>> {
        let response = self
            .client
            .list_collections()
            .await
            .map_err(|e| backend_err("list collections", e))?;
        Ok(response
            .collections
            .into_iter()
            .map(|c| c.name)
            .collect())
    }

    async fn delete_collection(&self, name: &str) -> StoreResult<()> {
        self.client
            .delete_collection(name)
            .await
            .map_err(|e| backend_err("delete collection", e))?;
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: Vec<Point>) -> StoreResult<()> {
        if points.is_empty() {
            return Ok(());
        }
        let points: Vec<PointStruct> = points
            .into_iter()
            .map(to_point_struct)
            .collect::<StoreResult<_>>()?;
        self.client
            .upsert_points(UpsertPointsBuilder::new(collection, points).wait(true))
            .await
            .map_err(|e| backend_err("upsert", e))?;
        Ok(())
    }

    async fn set_payload(
        &self,
        collection: &str,
        ids: &[Uuid],
        payload: Value,
    ) -> StoreResult<()> {
        let payload = Payload::try_from(payload)
            .map_err(|e| StoreError::InvalidPoint(format!("payload not an object: {e}")))?;
        let ids: Vec<PointId> = ids.iter().map(|id| PointId::from(id.to_string())).collect();
        self.client
            .set_payload(
                SetPayloadPointsBuilder::new(collection, payload)
                    .points_selector(PointsIdsList { ids })
                    .wait(true),
            )
            .await
            .map_err(|e| backend_err("set payload", e))?;
        Ok(())
    }

    async fn retrieve(&self, collection: &str, ids: &[Uuid]) -> StoreResult<Vec<Point>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<PointId> = ids.iter().map(|id| PointId::from(id.to_string())).collect();
        let response = self
            .client
            .get_points(GetPointsBuilder::new(collection, ids).with_payload(true))
            .await
            .map_err(|e| backend_err("retrieve", e))?;
        Ok(response
            .result
            .into_iter()
            .map(|p| Point {
                id: parse_point_id(p.id),
                vector: Vec::new(),
                payload: payload_to_json(p.payload),
            })
            .collect())
    }

    async fn scroll(&self, collection: &str, request: ScrollRequest) -> StoreResult<Vec<Point>> {
        // The universal query API supports numeric offsets, which the scroll
        // API does not (it pages by point id).
        let mut query = QueryPointsBuilder::new(collection).with_payload(true);
        if let Some(filter) = &request.filter {
            query = query.filter(to_qdrant_filter(filter)?);
        }
        if let Some(limit) = request.limit {
            query = query.limit(limit as u64);
        }
        if let Some(offset) = request.offset {
            query = query.offset(offset as u64);
        }

        let response = self
            .client
            .query(query)
            .await
            .map_err(|e| backend_err("scroll", e))?;
        Ok(response
            .result
            .into_iter()
            .map(|p| Point {
                id: parse_point_id(p.id),
                vector: Vec::new(),
                payload: payload_to_json(p.payload),
            })
            .collect())
    }

    async fn count(&self, collection: &str, filter: Option<Filter>) -> StoreResult<usize> {
        let mut count = CountPointsBuilder::new(collection).exact(true);
        if let Some(filter) = &filter {
            count = count.filter(to_qdrant_filter(filter)?);
        }
        let response = self
            .client
            .count(count)
            .await
            .map_err(|e| backend_err("count", e))?;
        Ok(response.result.map(|c| c.count as usize).unwrap_or(0))
    }

    async fn delete_points(&self, collection: &str, selector: PointSelector) -> StoreResult<()> {
        let builder = match selector {
            PointSelector::Ids(ids) => {
                let ids: Vec<PointId> =
                    ids.iter().map(|id| PointId::from(id.to_string())).collect();
                DeletePointsBuilder::new(collection).points(PointsIdsList { ids })
            }
            PointSelector::Filter(filter) => {
                DeletePointsBuilder::new(collection).points(to_qdrant_filter(&filter)?)
            }
        };
        self.client
            .delete_points(builder.wait(true))
            .await
            .map_err(|e| backend_err("delete", e))?;
        Ok(())
    }
}

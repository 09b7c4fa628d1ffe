//! In-memory storage backend
//!
//! HashMap-backed implementation of `StorageBackend` for tests and local
//! development. Evaluates the filter DSL in-process.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    Distance, Filter, Point, PointSelector, ScrollRequest, StorageBackend, StoreError,
    StoreResult,
};

#[derive(Default)]
struct Collection {
    points: HashMap<Uuid, Point>,
}

/// In-memory point store. All operations synchronize on a single mutex;
/// the lock is never held across an await.
#[derive(Default)]
pub struct InMemoryBackend {
    collections: Mutex<HashMap<String, Collection>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, HashMap<String, Collection>>> {
        self.collections
            .lock()
            .map_err(|_| StoreError::Backend("storage lock poisoned".into()))
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn ensure_collection(
        &self,
        name: &str,
        _vector_size: usize,
        _distance: Distance,
    ) -> StoreResult<()> {
        let mut collections = self.lock()?;
        collections.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> StoreResult<bool> {
        Ok(self.lock()?.contains_key(name))
    }

    async fn list_collections(&self) -> StoreResult<Vec<String>> {
        let mut names: Vec<String> = self.lock()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete_collection(&self, name: &str) -> StoreResult<()> {
        self.lock()?.remove(name);
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: Vec<Point>) -> StoreResult<()> {
        let mut collections = self.lock()?;
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::CollectionNotFound(collection.to_string()))?;
        for point in points {
            coll.points.insert(point.id, point);
        }
        Ok(())
    }

    async fn set_payload(
        &self,
        collection: &str,
        ids: &[Uuid],
        payload: Value,
    ) -> StoreResult<()> {
        let patch = payload
            .as_object()
            .ok_or_else(|| StoreError::InvalidPoint("payload patch must be an object".into()))?
            .clone();

        let mut collections = self.lock()?;
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::CollectionNotFound(collection.to_string()))?;

        for id in ids {
            if let Some(point) = coll.points.get_mut(id) {
                if let Some(obj) = point.payload.as_object_mut() {
                    for (k, v) in &patch {
                        obj.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        Ok(())
    }

    async fn retrieve(&self, collection: &str, ids: &[Uuid]) -> StoreResult<Vec<Point>> {
        let collections = self.lock()?;
        let coll = collections
            .get(collection)
            .ok_or_else(|| StoreError::CollectionNotFound(collection.to_string()))?;
        Ok(ids
            .iter()
            .filter_map(|id| coll.points.get(id).cloned())
            .collect())
    }

    async fn scroll(&self, collection: &str, request: ScrollRequest) -> StoreResult<Vec<Point>> {
        let collections = self.lock()?;
        let coll = collections
            .get(collection)
            .ok_or_else(|| StoreError::CollectionNotFound(collection.to_string()))?;

        let mut matched: Vec<Point> = coll
            .points
            .values()
            .filter(|p| {
                request
                    .filter
                    .as_ref()
                    .map_or(true, |f| f.matches(&p.id, &p.payload))
            })
            .cloned()
            .collect();

        // Stable ordering so pagination is deterministic
        matched.sort_by_key(|p| p.id);

        let offset = request.offset.unwrap_or(0);
        let mut page: Vec<Point> = matched.into_iter().skip(offset).collect();
        if let Some(limit) = request.limit {
            page.truncate(limit);
        }
        Ok(page)
    }

    async fn count(&self, collection: &str, filter: Option<Filter>) -> StoreResult<usize> {
        let collections = self.lock()?;
        let coll = collections
            .get(collection)
            .ok_or_else(|| StoreError::CollectionNotFound(collection.to_string()))?;
        Ok(coll
            .points
            .values()
            .filter(|p| filter.as_ref().map_or(true, |f| f.matches(&p.id, &p.payload)))
            .count())
    }

    async fn delete_points(&self, collection: &str, selector: PointSelector) -> StoreResult<()> {
        let mut collections = self.lock()?;
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::CollectionNotFound(collection.to_string()))?;
        match selector {
            PointSelector::Ids(ids) => {
                for id in ids {
                    coll.points.remove(&id);
                }
            }
            PointSelector::Filter(filter) => {
                coll.points.retain(|id, p| !filter.matches(id, &p.payload));
            }
        }
        Ok(())
    }
}

//! Caching registry decorator
//!
//! Wraps any base registry with an entity cache (id -> task) and a query
//! cache for hot filters. Every successful mutation clears both caches, so
//! a read after a write never sees a stale task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::TtlCache;
use crate::error::SchedulerResult;
use crate::filter::TaskFilter;
use crate::registry::TaskRegistry;
use crate::task::{NewTask, Task};

/// Cache sizing knobs; defaults follow the registry contract
/// (500-entry/60s entity cache, 50-entry/30s query cache).
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub entity_capacity: usize,
    pub entity_ttl: Duration,
    pub query_capacity: usize,
    pub query_ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            entity_capacity: 500,
            entity_ttl: Duration::from_secs(60),
            query_capacity: 50,
            query_ttl: Duration::from_secs(30),
        }
    }
}

pub struct CachedTaskRegistry {
    inner: Arc<dyn TaskRegistry>,
    entity_cache: TtlCache<String, Task>,
    query_cache: TtlCache<String, Vec<Task>>,
}

impl CachedTaskRegistry {
    pub fn new(inner: Arc<dyn TaskRegistry>, settings: CacheSettings) -> Self {
        Self {
            inner,
            entity_cache: TtlCache::new(settings.entity_capacity, settings.entity_ttl),
            query_cache: TtlCache::new(settings.query_capacity, settings.query_ttl),
        }
    }

    pub fn with_defaults(inner: Arc<dyn TaskRegistry>) -> Self {
        Self::new(inner, CacheSettings::default())
    }

    fn clear_caches(&self) {
        self.entity_cache.clear();
        self.query_cache.clear();
    }
}

#[async_trait]
impl TaskRegistry for CachedTaskRegistry {
    async fn initialize(&self) -> SchedulerResult<()> {
        self.inner.initialize().await
    }

    async fn store(&self, draft: NewTask) -> SchedulerResult<Task> {
        let task = self.inner.store(draft).await?;
        self.clear_caches();
        Ok(task)
    }

    async fn get_by_id(&self, id: &str) -> SchedulerResult<Option<Task>> {
        if let Some(task) = self.entity_cache.get(&id.to_string()) {
            return Ok(Some(task));
        }
        let task = self.inner.get_by_id(id).await?;
        if let Some(task) = &task {
            self.entity_cache.insert(id.to_string(), task.clone());
        }
        Ok(task)
    }

    async fn update(&self, task: Task) -> SchedulerResult<Task> {
        let updated = self.inner.update(task).await?;
        self.clear_caches();
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> SchedulerResult<bool> {
        let deleted = self.inner.delete(id).await?;
        if deleted {
            self.clear_caches();
        }
        Ok(deleted)
    }

    async fn find(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>> {
        // Only hot queries are worth caching; complex filters bypass
        if !filter.is_hot() {
            return self.inner.find(filter).await;
        }

        let key = filter.cache_key();
        if let Some(tasks) = self.query_cache.get(&key) {
            return Ok(tasks);
        }
        let tasks = self.inner.find(filter).await?;
        self.query_cache.insert(key, tasks.clone());
        Ok(tasks)
    }

    async fn count(&self, filter: &TaskFilter) -> SchedulerResult<usize> {
        self.inner.count(filter).await
    }

    async fn clear_all(&self) -> SchedulerResult<bool> {
        let cleared = self.inner.clear_all().await?;
        self.clear_caches();
        Ok(cleared)
    }

    fn invalidate_caches(&self) {
        self.clear_caches();
        self.inner.invalidate_caches();
    }
}

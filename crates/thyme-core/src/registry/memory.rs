//! In-memory task registry for tests and local development

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::datetime::DateTimeProcessor;
use crate::error::{SchedulerError, SchedulerResult};
use crate::filter::TaskFilter;
use crate::registry::{materialize_draft, TaskRegistry};
use crate::task::{NewTask, Task};

/// HashMap-backed registry. Live handler callbacks are kept on the stored
/// tasks, so nothing is lost across store/fetch within a process.
pub struct InMemoryTaskRegistry {
    tasks: Mutex<HashMap<String, Task>>,
    processor: DateTimeProcessor,
    default_priority: u8,
}

impl InMemoryTaskRegistry {
    pub fn new(processor: DateTimeProcessor, default_priority: u8) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            processor,
            default_priority,
        }
    }

    fn lock(&self) -> SchedulerResult<std::sync::MutexGuard<'_, HashMap<String, Task>>> {
        self.tasks
            .lock()
            .map_err(|_| SchedulerError::InvalidState("task map lock poisoned".into()))
    }
}

impl Default for InMemoryTaskRegistry {
    fn default() -> Self {
        Self::new(DateTimeProcessor::default(), 5)
    }
}

#[async_trait]
impl TaskRegistry for InMemoryTaskRegistry {
    async fn initialize(&self) -> SchedulerResult<()> {
        Ok(())
    }

    async fn store(&self, draft: NewTask) -> SchedulerResult<Task> {
        let task = materialize_draft(draft, &self.processor, self.default_priority, Utc::now())?;
        let mut tasks = self.lock()?;
        if tasks.contains_key(&task.id) {
            return Err(SchedulerError::InvalidTask(format!(
                "task id {} already exists",
                task.id
            )));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn get_by_id(&self, id: &str) -> SchedulerResult<Option<Task>> {
        Ok(self.lock()?.get(id).cloned())
    }

    async fn update(&self, mut task: Task) -> SchedulerResult<Task> {
        let mut tasks = self.lock()?;
        if !tasks.contains_key(&task.id) {
            return Err(SchedulerError::TaskNotFound(task.id));
        }
        task.updated_at = Utc::now();
        tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn delete(&self, id: &str) -> SchedulerResult<bool> {
        Ok(self.lock()?.remove(id).is_some())
    }

    async fn find(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>> {
        let tasks: Vec<Task> = self.lock()?.values().cloned().collect();
        Ok(filter.apply(tasks, Utc::now()))
    }

    async fn count(&self, filter: &TaskFilter) -> SchedulerResult<usize> {
        let now = Utc::now();
        Ok(self.lock()?.values().filter(|t| filter.matches(t, now)).count())
    }

    async fn clear_all(&self) -> SchedulerResult<bool> {
        self.lock()?.clear();
        Ok(true)
    }

    fn invalidate_caches(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ScheduleSpec, TaskStatus};
    use chrono::Duration;

    #[tokio::test]
    async fn test_store_and_get_roundtrip() {
        let registry = InMemoryTaskRegistry::default();
        let stored = registry
            .store(NewTask::new("roundtrip").with_description("keeps fields"))
            .await
            .unwrap();

        let fetched = registry.get_by_id(&stored.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "roundtrip");
        assert_eq!(fetched.description.as_deref(), Some("keeps fields"));
        assert_eq!(fetched.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_store_rejects_duplicate_id() {
        let registry = InMemoryTaskRegistry::default();
        let stored = registry.store(NewTask::new("a")).await.unwrap();
        let err = registry
            .store(NewTask::new("b").with_id(stored.id))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTask(_)));
    }

    #[tokio::test]
    async fn test_concurrent_stores_get_distinct_ids() {
        let registry = std::sync::Arc::new(InMemoryTaskRegistry::default());
        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.store(NewTask::new(format!("t{i}"))).await.unwrap().id
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 16);
    }

    #[tokio::test]
    async fn test_update_requires_existing_id() {
        let registry = InMemoryTaskRegistry::default();
        let mut task = registry.store(NewTask::new("a")).await.unwrap();
        task.priority = 9;

        let updated = registry.update(task.clone()).await.unwrap();
        assert_eq!(updated.priority, 9);
        assert!(updated.updated_at >= updated.created_at);

        task.id = "01ARZ3NDEKTSV4RRFFQ69G5FAV".into();
        assert!(matches!(
            registry.update(task).await,
            Err(SchedulerError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_returns_false_when_absent() {
        let registry = InMemoryTaskRegistry::default();
        let stored = registry.store(NewTask::new("a")).await.unwrap();
        assert!(registry.delete(&stored.id).await.unwrap());
        assert!(!registry.delete(&stored.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_find_due_now() {
        let registry = InMemoryTaskRegistry::default();
        registry
            .store(NewTask::explicit("past", Utc::now() - Duration::seconds(5)))
            .await
            .unwrap();
        registry
            .store(NewTask::explicit("future", Utc::now() + Duration::seconds(60)))
            .await
            .unwrap();
        registry
            .store(NewTask::new("untimed").with_schedule(ScheduleSpec::At(
                Utc::now() - Duration::seconds(5),
            )))
            .await
            .unwrap();

        let due = registry.find(&TaskFilter::due_now()).await.unwrap();
        assert_eq!(due.len(), 2);
        assert!(due.iter().all(|t| t.name != "future"));

        assert_eq!(registry.count(&TaskFilter::pending()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_clear_all() {
        let registry = InMemoryTaskRegistry::default();
        registry.store(NewTask::new("a")).await.unwrap();
        assert!(registry.clear_all().await.unwrap());
        assert_eq!(registry.count(&TaskFilter::default()).await.unwrap(), 0);
    }
}

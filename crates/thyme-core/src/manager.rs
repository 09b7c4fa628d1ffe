//! Scheduler manager
//!
//! The single public entry point: owns the registry, the strategy
//! composition, the executor, and the polling ticker. Ticks are serial; if
//! one is still executing when the next would fire, the next is skipped,
//! never queued. Tick errors are logged and do not stop the ticker.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::datetime::DateTimeProcessor;
use crate::error::{SchedulerError, SchedulerResult};
use crate::executor::{TaskExecutionResult, TaskExecutor};
use crate::filter::TaskFilter;
use crate::handler::HandlerRegistry;
use crate::registry::{
    CacheSettings, CachedTaskRegistry, InMemoryTaskRegistry, TaskRegistry, VectorTaskRegistry,
};
use crate::strategy::TaskScheduler;
use crate::task::{AgentId, NewTask, Task, TaskStatus};
use thyme_store::StorageBackend;

/// Manager lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
    Disposed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStatusCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerMetrics {
    pub total_tasks: usize,
    pub task_status_counts: TaskStatusCounts,
    pub is_running: bool,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_tick_duration_ms: Option<u64>,
}

#[derive(Default)]
struct TickStats {
    last_tick_at: Option<DateTime<Utc>>,
    last_tick_duration_ms: Option<u64>,
}

pub struct SchedulerManager {
    config: SchedulerConfig,
    registry: Arc<dyn TaskRegistry>,
    handlers: Arc<HandlerRegistry>,
    scheduler: Arc<TaskScheduler>,
    executor: Arc<TaskExecutor>,
    state: StdMutex<LifecycleState>,
    shutdown: StdMutex<watch::Sender<bool>>,
    ticker: TokioMutex<Option<JoinHandle<()>>>,
    tick_stats: Arc<StdMutex<TickStats>>,
}

impl SchedulerManager {
    /// Build a manager over any base registry. The registry is wrapped with
    /// the caching decorator configured from `config`.
    pub fn with_registry(
        config: SchedulerConfig,
        base: Arc<dyn TaskRegistry>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        let registry: Arc<dyn TaskRegistry> = Arc::new(CachedTaskRegistry::new(
            base,
            CacheSettings {
                entity_capacity: config.entity_cache_size,
                entity_ttl: Duration::from_millis(config.entity_cache_ttl_ms),
                query_capacity: config.query_cache_size,
                query_ttl: Duration::from_millis(config.query_cache_ttl_ms),
            },
        ));

        let processor = DateTimeProcessor::new(config.timezone);
        let scheduler = Arc::new(TaskScheduler::with_defaults(
            config.priority_strategy_threshold,
        ));
        let executor = Arc::new(TaskExecutor::new(
            registry.clone(),
            handlers.clone(),
            config.max_concurrent_tasks,
            processor,
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            registry,
            handlers,
            scheduler,
            executor,
            state: StdMutex::new(LifecycleState::Uninitialized),
            shutdown: StdMutex::new(shutdown_tx),
            ticker: TokioMutex::new(None),
            tick_stats: Arc::new(StdMutex::new(TickStats::default())),
        }
    }

    /// In-memory manager for tests and development
    pub fn in_memory(config: SchedulerConfig) -> Self {
        let processor = DateTimeProcessor::new(config.timezone);
        let base: Arc<dyn TaskRegistry> = Arc::new(InMemoryTaskRegistry::new(
            processor,
            config.default_priority,
        ));
        Self::with_registry(config, base, Arc::new(HandlerRegistry::new()))
    }

    /// Production manager persisting into a storage backend
    pub fn with_backend(
        config: SchedulerConfig,
        backend: Arc<dyn StorageBackend>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        let processor = DateTimeProcessor::new(config.timezone);
        let base: Arc<dyn TaskRegistry> = Arc::new(VectorTaskRegistry::new(
            backend,
            config.collection_name.clone(),
            processor,
            config.default_priority,
        ));
        Self::with_registry(config, base, handlers)
    }

    pub fn handlers(&self) -> Arc<HandlerRegistry> {
        self.handlers.clone()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, state: LifecycleState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    fn ensure_not_disposed(&self) -> SchedulerResult<()> {
        if self.state() == LifecycleState::Disposed {
            return Err(SchedulerError::InvalidState(
                "scheduler manager is disposed".into(),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Verify the backing collection and move to INITIALIZED. Idempotent.
    /// Starts the ticker when auto-scheduling is configured.
    pub async fn initialize(&self) -> SchedulerResult<()> {
        self.ensure_not_disposed()?;
        self.registry.initialize().await?;
        if self.state() == LifecycleState::Uninitialized {
            self.set_state(LifecycleState::Initialized);
        }
        info!("scheduler manager initialized");

        if self.config.enabled && self.config.enable_auto_scheduling {
            self.start_scheduler().await?;
        }
        Ok(())
    }

    /// Start the polling ticker. A no-op returning true when already
    /// running; returns false when the master switch is off.
    pub async fn start_scheduler(&self) -> SchedulerResult<bool> {
        self.ensure_not_disposed()?;
        if !self.config.enabled {
            warn!("scheduler is disabled by configuration");
            return Ok(false);
        }
        match self.state() {
            LifecycleState::Uninitialized => {
                return Err(SchedulerError::InvalidState(
                    "initialize the scheduler manager before starting it".into(),
                ))
            }
            LifecycleState::Running => return Ok(true),
            _ => {}
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock().expect("shutdown lock poisoned") = shutdown_tx;

        let handle = self.spawn_ticker(shutdown_rx);
        *self.ticker.lock().await = Some(handle);
        self.set_state(LifecycleState::Running);
        info!(
            interval_ms = self.config.scheduling_interval_ms,
            "scheduler started"
        );
        Ok(true)
    }

    /// Signal the ticker and in-flight handlers, then wait up to the
    /// shutdown grace period. Handlers still running at the deadline are
    /// abandoned and their state transitions may be lost.
    pub async fn stop_scheduler(&self) -> SchedulerResult<bool> {
        if self.state() != LifecycleState::Running {
            return Ok(false);
        }

        let _ = self
            .shutdown
            .lock()
            .expect("shutdown lock poisoned")
            .send(true);

        if let Some(handle) = self.ticker.lock().await.take() {
            let grace = Duration::from_millis(self.config.shutdown_grace_ms);
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("shutdown grace expired, abandoning in-flight handlers");
            }
        }

        // Fresh channel so manual executions after the stop are not born
        // cancelled
        *self.shutdown.lock().expect("shutdown lock poisoned") = watch::channel(false).0;

        self.set_state(LifecycleState::Stopped);
        info!("scheduler stopped");
        Ok(true)
    }

    pub fn is_scheduler_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Stop the ticker, clear the registry and caches, return to
    /// INITIALIZED. Valid from any state.
    pub async fn reset(&self) -> SchedulerResult<()> {
        let _ = self
            .shutdown
            .lock()
            .expect("shutdown lock poisoned")
            .send(true);
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }
        *self.shutdown.lock().expect("shutdown lock poisoned") = watch::channel(false).0;

        self.registry.clear_all().await?;
        self.registry.invalidate_caches();
        *self.tick_stats.lock().expect("stats lock poisoned") = TickStats::default();
        self.set_state(LifecycleState::Initialized);
        info!("scheduler manager reset");
        Ok(())
    }

    /// Terminal stop; the manager rejects further operations
    pub async fn dispose(&self) -> SchedulerResult<()> {
        if self.state() == LifecycleState::Running {
            self.stop_scheduler().await?;
        }
        self.set_state(LifecycleState::Disposed);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Task CRUD
    // ------------------------------------------------------------------

    pub async fn create_task(&self, draft: NewTask) -> SchedulerResult<Task> {
        self.ensure_not_disposed()?;
        self.registry.store(draft).await
    }

    /// Create a task owned by an agent: injects the structured agent id
    /// into `metadata.agentId` before storing.
    pub async fn create_task_for_agent(
        &self,
        mut draft: NewTask,
        agent_id: &str,
    ) -> SchedulerResult<Task> {
        self.ensure_not_disposed()?;
        let tag = serde_json::to_value(AgentId::agent(agent_id))
            .map_err(|e| SchedulerError::InvalidTask(e.to_string()))?;
        match draft.metadata.as_object_mut() {
            Some(obj) => {
                obj.insert("agentId".to_string(), tag);
            }
            None => {
                draft.metadata = serde_json::json!({ "agentId": tag });
            }
        }
        self.registry.store(draft).await
    }

    pub async fn update_task(&self, task: Task) -> SchedulerResult<Task> {
        self.ensure_not_disposed()?;
        self.registry.update(task).await
    }

    pub async fn delete_task(&self, id: &str) -> SchedulerResult<bool> {
        self.ensure_not_disposed()?;
        self.registry.delete(id).await
    }

    pub async fn get_task(&self, id: &str) -> SchedulerResult<Option<Task>> {
        self.ensure_not_disposed()?;
        self.registry.get_by_id(id).await
    }

    pub async fn find_tasks(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>> {
        self.ensure_not_disposed()?;
        self.registry.find(filter).await
    }

    pub async fn find_tasks_for_agent(&self, agent_id: &str) -> SchedulerResult<Vec<Task>> {
        self.find_tasks(&TaskFilter::for_agent(agent_id)).await
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// One due-task pass. Safe to call while the ticker is stopped.
    pub async fn execute_due_tasks(&self) -> SchedulerResult<Vec<TaskExecutionResult>> {
        self.ensure_not_disposed()?;
        if !self.config.enabled {
            return Ok(Vec::new());
        }
        let due = self.scheduler.due(self.registry.as_ref(), Utc::now()).await?;
        if due.is_empty() {
            return Ok(Vec::new());
        }
        let cancel = self
            .shutdown
            .lock()
            .expect("shutdown lock poisoned")
            .subscribe();
        Ok(self.executor.run_batch(due, cancel).await)
    }

    /// Due-task pass restricted to one agent's tasks
    pub async fn execute_due_tasks_for_agent(
        &self,
        agent_id: &str,
    ) -> SchedulerResult<Vec<TaskExecutionResult>> {
        self.ensure_not_disposed()?;
        if !self.config.enabled {
            return Ok(Vec::new());
        }
        let mut filter = TaskFilter::for_agent(agent_id);
        filter.statuses = Some(vec![TaskStatus::Pending]);
        let pending = self.registry.find(&filter).await?;
        let due = self.scheduler.select(&pending, Utc::now());
        if due.is_empty() {
            return Ok(Vec::new());
        }
        let cancel = self
            .shutdown
            .lock()
            .expect("shutdown lock poisoned")
            .subscribe();
        Ok(self.executor.run_batch(due, cancel).await)
    }

    /// Run one task immediately, bypassing the due-check but not the
    /// concurrency cap
    pub async fn execute_task_now(&self, id: &str) -> SchedulerResult<TaskExecutionResult> {
        self.ensure_not_disposed()?;
        let task = self
            .registry
            .get_by_id(id)
            .await?
            .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?;
        Ok(self.executor.run_single(task).await)
    }

    // ------------------------------------------------------------------
    // Metrics
    // ------------------------------------------------------------------

    pub async fn get_metrics(&self) -> SchedulerResult<SchedulerMetrics> {
        let counts = TaskStatusCounts {
            pending: self.count_status(TaskStatus::Pending).await?,
            running: self.count_status(TaskStatus::Running).await?,
            completed: self.count_status(TaskStatus::Completed).await?,
            failed: self.count_status(TaskStatus::Failed).await?,
            cancelled: self.count_status(TaskStatus::Cancelled).await?,
        };
        let total = self.registry.count(&TaskFilter::default()).await?;
        let stats = self.tick_stats.lock().expect("stats lock poisoned");
        Ok(SchedulerMetrics {
            total_tasks: total,
            task_status_counts: counts,
            is_running: self.is_scheduler_running(),
            last_tick_at: stats.last_tick_at,
            last_tick_duration_ms: stats.last_tick_duration_ms,
        })
    }

    async fn count_status(&self, status: TaskStatus) -> SchedulerResult<usize> {
        self.registry.count(&TaskFilter::by_status(status)).await
    }

    // ------------------------------------------------------------------
    // Ticker
    // ------------------------------------------------------------------

    fn spawn_ticker(&self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let scheduler = self.scheduler.clone();
        let executor = self.executor.clone();
        let tick_stats = self.tick_stats.clone();
        let period = Duration::from_millis(self.config.scheduling_interval_ms.max(1));
        let cancel_rx = shutdown_rx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // A tick that would fire while the previous one is still
            // executing is skipped, not queued
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await; // immediate first tick consumed

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("ticker shutting down");
                            return;
                        }
                    }
                    _ = interval.tick() => {
                        let started = std::time::Instant::now();
                        let tick_at = Utc::now();

                        match scheduler.due(registry.as_ref(), tick_at).await {
                            Ok(due) if due.is_empty() => {}
                            Ok(due) => {
                                debug!(count = due.len(), "tick found due tasks");
                                let results = executor.run_batch(due, cancel_rx.clone()).await;
                                let failed =
                                    results.iter().filter(|r| !r.successful).count();
                                if failed > 0 {
                                    warn!(failed, total = results.len(), "tick had failures");
                                }
                            }
                            Err(e) => {
                                // Orchestration errors abort the tick only
                                error!("tick aborted: {}", e);
                            }
                        }

                        let mut stats = tick_stats.lock().expect("stats lock poisoned");
                        stats.last_tick_at = Some(tick_at);
                        stats.last_tick_duration_ms =
                            Some(started.elapsed().as_millis() as u64);
                    }
                }
            }
        })
    }
}

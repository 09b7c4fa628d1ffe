//! Task executor
//!
//! Runs batches of due tasks with a hard concurrency cap. Each task goes
//! through the PENDING -> RUNNING fence before its handler is invoked, and
//! the outcome (completion, interval re-arm, or failure) is written back in
//! a single registry update. Handler errors and panics are contained per
//! task; they never abort the batch.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::datetime::DateTimeProcessor;
use crate::handler::{noop_handler, HandlerContext, HandlerRegistry, TaskHandler};
use crate::registry::TaskRegistry;
use crate::task::{HandlerBinding, ScheduleType, Task, TaskStatus};

/// Outcome of one task execution
#[derive(Debug, Clone)]
pub struct TaskExecutionResult {
    pub task_id: String,
    pub successful: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

pub struct TaskExecutor {
    registry: Arc<dyn TaskRegistry>,
    handlers: Arc<HandlerRegistry>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    processor: DateTimeProcessor,
}

impl TaskExecutor {
    pub fn new(
        registry: Arc<dyn TaskRegistry>,
        handlers: Arc<HandlerRegistry>,
        max_concurrent: usize,
        processor: DateTimeProcessor,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            registry,
            handlers,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            processor,
        }
    }

    /// Run a batch of due tasks. At most `max_concurrent` run; tasks beyond
    /// the cap stay PENDING and are re-selected on the next tick. Tasks are
    /// started in the given order but may complete in any order.
    pub async fn run_batch(
        &self,
        mut tasks: Vec<Task>,
        cancel: watch::Receiver<bool>,
    ) -> Vec<TaskExecutionResult> {
        if tasks.len() > self.max_concurrent {
            debug!(
                deferred = tasks.len() - self.max_concurrent,
                "concurrency cap reached, deferring remainder to next tick"
            );
            tasks.truncate(self.max_concurrent);
        }

        let mut join_set = JoinSet::new();
        for task in tasks {
            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let executor = self.clone_parts();
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let result = executor.execute(task, cancel).await;
                drop(permit);
                result
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!("task execution join failed: {}", e),
            }
        }
        results
    }

    /// Run one task immediately, still honouring the concurrency cap
    pub async fn run_single(&self, task: Task) -> TaskExecutionResult {
        let task_id = task.id.clone();
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return TaskExecutionResult {
                    task_id,
                    successful: false,
                    error: Some("executor is shut down".into()),
                    duration_ms: 0,
                }
            }
        };
        let (_tx, cancel) = watch::channel(false);
        let result = self.clone_parts().execute(task, cancel).await;
        drop(permit);
        result
    }

    fn clone_parts(&self) -> ExecutorParts {
        ExecutorParts {
            registry: self.registry.clone(),
            handlers: self.handlers.clone(),
            processor: self.processor.clone(),
        }
    }
}

/// The pieces one task execution needs, detached from the executor so the
/// spawned future is 'static
struct ExecutorParts {
    registry: Arc<dyn TaskRegistry>,
    handlers: Arc<HandlerRegistry>,
    processor: DateTimeProcessor,
}

impl ExecutorParts {
    async fn execute(self, mut task: Task, cancel: watch::Receiver<bool>) -> TaskExecutionResult {
        let task_id = task.id.clone();

        // PENDING -> RUNNING is the fence against double starts; skip the
        // handler entirely if it cannot be persisted
        if let Err(e) = task.transition(TaskStatus::Running) {
            return TaskExecutionResult {
                task_id,
                successful: false,
                error: Some(e.to_string()),
                duration_ms: 0,
            };
        }
        task.updated_at = Utc::now();
        match self.registry.update(task.clone()).await {
            Ok(updated) => task = updated,
            Err(e) => {
                warn!("could not mark task {} running: {}", task_id, e);
                return TaskExecutionResult {
                    task_id,
                    successful: false,
                    error: Some(e.to_string()),
                    duration_ms: 0,
                };
            }
        }

        let handler = self.resolve_handler(&task);
        let context = HandlerContext::new(&task.id, cancel);
        let timeout_ms = task.timeout_ms();

        let started = Instant::now();
        let outcome = run_handler(handler, context, timeout_ms).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (successful, error) = match outcome {
            Ok(_) => (true, None),
            Err(message) => (false, Some(message)),
        };

        self.write_back(&mut task, successful, error.as_deref()).await;

        TaskExecutionResult {
            task_id,
            successful,
            error,
            duration_ms,
        }
    }

    fn resolve_handler(&self, task: &Task) -> TaskHandler {
        if let Some(callback) = &task.callback {
            return callback.clone();
        }
        if let HandlerBinding::Registered { handler_id } = &task.handler {
            if let Some(handler) = self.handlers.resolve(handler_id) {
                return handler;
            }
            warn!(
                "handler '{}' for task {} is not registered in this process",
                handler_id, task.id
            );
        }
        noop_handler()
    }

    /// Post-run state transition, persisted in one update and retried once.
    /// Interval tasks re-arm to PENDING with an advanced fire time and a
    /// bumped execution count; everything else lands on COMPLETED or FAILED.
    async fn write_back(&self, task: &mut Task, successful: bool, error: Option<&str>) {
        let now = Utc::now();
        task.last_executed_at = Some(now);
        task.updated_at = now;

        if successful && task.schedule_type == ScheduleType::Interval {
            let expression = task.interval.as_ref().map(|i| i.expression.clone());
            let next_fire = expression.as_deref().and_then(|expr| {
                self.processor
                    .calculate_interval(now, expr)
                    .ok()
                    .or_else(|| self.processor.next_execution_from_cron(expr, now))
            });

            match next_fire {
                Some(next) => {
                    let _ = task.transition(TaskStatus::Pending);
                    task.scheduled_time = Some(next);
                    if let Some(interval) = task.interval.as_mut() {
                        interval.execution_count += 1;
                    }
                }
                None => {
                    error!(
                        "cannot re-arm interval task {}: bad expression {:?}",
                        task.id, expression
                    );
                    let _ = task.transition(TaskStatus::Failed);
                    task.set_metadata_key(
                        "lastError",
                        serde_json::json!("unparseable interval expression"),
                    );
                }
            }
        } else if successful {
            let _ = task.transition(TaskStatus::Completed);
        } else {
            let _ = task.transition(TaskStatus::Failed);
            if let Some(message) = error {
                task.set_metadata_key("lastError", serde_json::json!(message));
            }
        }

        if let Err(first) = self.registry.update(task.clone()).await {
            warn!(
                "write-back for task {} failed, retrying once: {}",
                task.id, first
            );
            if let Err(second) = self.registry.update(task.clone()).await {
                error!(
                    "write-back for task {} failed twice, state may be lost: {}",
                    task.id, second
                );
                task.status = TaskStatus::Failed;
            }
        }
    }
}

/// Invoke a handler inside its own tokio task so a panic is contained, with
/// an optional deadline.
async fn run_handler(
    handler: TaskHandler,
    context: HandlerContext,
    timeout_ms: Option<u64>,
) -> Result<serde_json::Value, String> {
    let handle = tokio::spawn(handler(context));

    let joined = match timeout_ms {
        Some(ms) => match tokio::time::timeout(std::time::Duration::from_millis(ms), handle).await
        {
            Ok(joined) => joined,
            Err(_) => {
                return Err(crate::error::SchedulerError::HandlerTimeout(ms).to_string());
            }
        },
        None => handle.await,
    };

    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) if e.is_panic() => Err(format!("handler panicked: {e}")),
        Err(e) => Err(format!("handler task failed: {e}")),
    }
}

//! Task handlers
//!
//! A handler is the caller-supplied async callback a task runs. Handlers are
//! live callables and do not survive a process restart; tasks persist a
//! placeholder (or a `handlerId` reference) instead, and the process-local
//! `HandlerRegistry` re-binds them on execution. A task loaded without a
//! registered handler runs a no-op and logs at warn.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::Value;
use tokio::sync::watch;
use tracing::warn;

/// Boxed future a handler returns. The success value is recorded but not
/// interpreted; any error marks the task failed.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// The async callback a task runs
pub type TaskHandler = Arc<dyn Fn(HandlerContext) -> HandlerFuture + Send + Sync>;

/// Per-invocation context passed to a handler. Carries the task id and a
/// cancellation signal that flips when the scheduler shuts down.
#[derive(Clone)]
pub struct HandlerContext {
    task_id: String,
    cancel: watch::Receiver<bool>,
    // Keeps a detached context's sender alive so the receiver never closes
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

impl HandlerContext {
    pub fn new(task_id: impl Into<String>, cancel: watch::Receiver<bool>) -> Self {
        Self {
            task_id: task_id.into(),
            cancel,
            _keepalive: None,
        }
    }

    /// Context that can never be cancelled (manual one-off executions)
    pub fn detached(task_id: impl Into<String>) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            task_id: task_id.into(),
            cancel: rx,
            _keepalive: Some(Arc::new(tx)),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves when the scheduler signals shutdown
    pub async fn cancelled(&mut self) {
        while !*self.cancel.borrow() {
            if self.cancel.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Wrap an async closure as a `TaskHandler`
pub fn handler_fn<F, Fut>(f: F) -> TaskHandler
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Default handler substituted for tasks whose real handler is not bound
/// in this process. Logs and succeeds without doing anything.
pub fn noop_handler() -> TaskHandler {
    handler_fn(|ctx| async move {
        warn!(
            task_id = %ctx.task_id(),
            "no handler bound for task, running no-op"
        );
        Ok(Value::Null)
    })
}

/// Process-local mapping from stable handler ids to live handlers.
/// Callers populate this at startup so tasks that outlive the process can be
/// re-bound to their callbacks.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Mutex<HashMap<String, TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler_id: impl Into<String>, handler: TaskHandler) {
        self.handlers
            .lock()
            .expect("handler registry lock poisoned")
            .insert(handler_id.into(), handler);
    }

    pub fn resolve(&self, handler_id: &str) -> Option<TaskHandler> {
        self.handlers
            .lock()
            .expect("handler registry lock poisoned")
            .get(handler_id)
            .cloned()
    }

    pub fn unregister(&self, handler_id: &str) -> bool {
        self.handlers
            .lock()
            .expect("handler registry lock poisoned")
            .remove(handler_id)
            .is_some()
    }
}

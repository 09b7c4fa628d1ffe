//! Scheduler error taxonomy
//!
//! Handler failures are captured per task and never escape a tick; storage
//! errors during tick orchestration abort the tick but not the ticker;
//! initialization errors propagate to the caller.

use thiserror::Error;
use thyme_store::StoreError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("invalid interval expression: '{0}'")]
    InvalidInterval(String),

    #[error("handler failed: {0}")]
    HandlerFailed(String),

    #[error("handler timed out after {0}ms")]
    HandlerTimeout(u64),

    #[error("invalid scheduler state: {0}")]
    InvalidState(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

//! Error types of the worker runtime.

use std::fmt;
use thiserror::Error;
use trialbench_ipc::{FrameError, RecordError};

/// Failure raised by benchmarked code or its fixtures.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}")]
    Message(String),

    #[error("panicked: {0}")]
    Panic(String),

    #[error("non-finite sample value {0}")]
    NonFinite(f64),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TaskError {
    /// Error carrying a plain message
    pub fn msg(message: impl fmt::Display) -> Self {
        TaskError::Message(message.to_string())
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        TaskError::Panic(message)
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        TaskError::Message(message)
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        TaskError::Message(message.to_string())
    }
}

/// A record that cannot be turned into runnable parameters.
#[derive(Debug, Error, PartialEq)]
pub enum ParamError {
    #[error("unknown benchmark task: {0}")]
    UnknownTask(String),

    #[error("mode {0} must be expanded before running")]
    UnexpandedMode(trialbench_stats::Mode),

    #[error("{0} must be positive")]
    NotPositive(&'static str),

    #[error("task declares {expected} thread groups, got {got}")]
    GroupCount { expected: usize, got: usize },

    #[error("unknown internal profiler: {0}")]
    UnknownProfiler(String),
}

/// Errors from a profiler hook. Never fatal to a trial.
#[derive(Debug, Error)]
pub enum ProfilerError {
    #[error("profiler unavailable: {0}")]
    Unavailable(String),

    #[error("profiler failed: {0}")]
    Failed(String),

    #[error("profiler panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors of the worker process itself (transport, protocol).
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("malformed benchmark record: {0}")]
    Record(#[from] RecordError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("invalid IPC descriptor setting {0:?}")]
    Transport(String),
}

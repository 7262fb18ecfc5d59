use std::time::Duration;

use thiserror::Error;

use crate::domain::{ChangeId, TaskId, TaskKind};

#[derive(Debug, Error)]
pub enum Error {
    #[error("no handler registered for task kind \"{0}\"")]
    HandlerNotFound(TaskKind),

    #[error("task kind \"{kind}\" is already handled by manager {existing:?}")]
    DuplicateHandler { kind: TaskKind, existing: String },

    #[error("missing handlers for task kinds: {0:?}")]
    MissingKinds(Vec<String>),

    #[error("no state entry for key {0:?}")]
    NoState(String),

    #[error("no such task: {0}")]
    UnknownTask(TaskId),

    #[error("no such change: {0}")]
    UnknownChange(ChangeId),

    #[error("{task} already belongs to {change}")]
    TaskInOtherChange { task: TaskId, change: ChangeId },

    #[error("dependency cycle detected between tasks {0:?}")]
    Cycle(Vec<TaskId>),

    #[error("settle did not complete within {0:?}")]
    SettleTimeout(Duration),

    /// Returned by a handler to have its task run again later.
    #[error("task should be retried in {0:?}")]
    Retry(Duration),

    #[error("cannot decode {key:?}: {source}")]
    Decode {
        key: String,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("snap {snap:?} has no {key:?} configuration option")]
    NoOption { snap: String, key: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cannot read gadget metadata: {0}")]
    Gadget(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Free-form handler failure.
    pub fn task(message: impl Into<String>) -> Self {
        Error::Other(message.into())
    }

    pub(crate) fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

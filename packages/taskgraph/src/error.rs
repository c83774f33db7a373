//! Error surface of the task graph.
//!
//! Every variant here is cheap to clone: causes that are not themselves
//! clonable (`io::Error`, `rusqlite::Error`, user `Report`s) are shared
//! behind an `Arc`. This is what lets repeated `join` calls re-raise the
//! same failure, and lets a single task failure fan out as the cause of
//! every transitively dependent task.

use std::{io, path::PathBuf, sync::Arc};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The submission itself is malformed (duplicate targets, an empty op
    /// identity, targets declared on an empty task, ...). Raised
    /// synchronously from `add_task`.
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    /// `add_task` was called after `close`.
    #[error("add_task called on a closed task graph")]
    GraphClosed,

    /// `add_task` was called after a task failure terminated the graph.
    #[error("add_task called on a terminated task graph")]
    GraphTerminated,

    /// The task function returned successfully but one or more declared
    /// target paths do not exist. Subject to the task's retry policy.
    #[error("task '{task}' ran without creating declared targets: {missing:?}")]
    MissingTargetOutput { task: String, missing: Vec<PathBuf> },

    /// A task with an identical identity digest was resubmitted with a
    /// different declared target set.
    #[error("task '{task}' resubmitted with a different target set")]
    DuplicateTargetMismatch { task: String },

    /// The task function returned an error (or panicked). Carries the
    /// original report so callers can downcast to the source error type.
    #[error("task '{task}' failed: {cause}")]
    UserTask {
        task: String,
        cause: Arc<color_eyre::Report>,
    },

    #[error("memo store: {0}")]
    Store(Arc<rusqlite::Error>),

    #[error("memo store record encoding: {0}")]
    Encoding(Arc<serde_json::Error>),

    #[error("i/o: {0}")]
    Io(Arc<io::Error>),
}

impl Error {
    /// The original report of a failed task function, when this error is a
    /// [`Error::UserTask`].
    pub fn user_cause(&self) -> Option<&color_eyre::Report> {
        match self {
            Error::UserTask { cause, .. } => Some(&**cause),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Store(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Encoding(Arc::new(err))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

//! Error types for actorflow.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::workflow::WorkflowId;

/// A `Result` alias with [`enum@Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error for wrapping arbitrary failures raised by step bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while running or controlling a workflow.
#[derive(Debug, Error)]
pub enum Error {
    /// Unrecoverable failure. Steps raising it are not retried.
    #[error("critical error: {0}")]
    Critical(String),

    /// Failure that aborts the workflow without retry, signalling that the
    /// workflow author performs compensation.
    #[error("rollback: {0}")]
    Rollback(String),

    /// A step exceeded its retry budget. The workflow fails until
    /// [`WorkflowHandle::recover`](crate::WorkflowHandle::recover) is called.
    #[error("step `{name}` exhausted after {attempts} attempts: {last_error}")]
    StepExhausted {
        /// Key of the exhausted entry.
        name: String,
        /// Attempts made, including the first.
        attempts: u32,
        /// Message of the last failure.
        last_error: String,
    },

    /// Replayed code no longer matches the recorded history.
    #[error("history diverged at `{key}`: {reason}")]
    HistoryDiverged {
        /// Entry key where the mismatch was detected.
        key: String,
        /// What did not match.
        reason: String,
    },

    /// A combinator was started in a scope whose previous entry is still running.
    #[error("entry `{attempted}` started while `{active}` is still in progress")]
    EntryInProgress {
        /// Entry currently executing.
        active: String,
        /// Entry that was started concurrently.
        attempted: String,
    },

    /// The workflow was cancelled; raised by result queries.
    #[error("workflow was cancelled and evicted")]
    Evicted,

    /// A step body ran past its timeout. Treated as critical.
    #[error("step `{name}` timed out after {timeout:?}")]
    StepTimeout {
        /// Key of the step entry.
        name: String,
        /// Configured timeout.
        timeout: std::time::Duration,
    },

    /// The pass cannot make progress until a wake time, a message, or a new
    /// pass. Combinators return it; workflow code must propagate it with `?`.
    #[error("{0}")]
    Suspended(Suspension),

    /// Retryable failure with a message.
    #[error("{0}")]
    Workflow(String),

    /// Retryable failure wrapping an arbitrary error.
    #[error(transparent)]
    Other(BoxError),

    /// Failed to serialize or deserialize persisted data.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage or message driver failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// PostgreSQL driver error.
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// Entry or branch name is empty or uses a reserved character.
    #[error("invalid entry name `{name}`: {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Join or race invoked without branches.
    #[error("`{0}` requires at least one branch")]
    EmptyBranches(String),

    /// A workflow with this id is already owned by a running task.
    #[error("workflow `{0}` is already running")]
    AlreadyRunning(WorkflowId),

    /// No workflow record exists for this id.
    #[error("workflow `{0}` not found")]
    NotFound(WorkflowId),

    /// The runtime driving this workflow shut down before it settled.
    #[error("workflow `{0}` is no longer driven by a runtime")]
    Stopped(WorkflowId),

    /// Recovery was requested but no entry is exhausted.
    #[error("workflow `{0}` has no exhausted step to recover")]
    NothingToRecover(WorkflowId),
}

impl Error {
    /// Create a critical error.
    pub fn critical(message: impl Into<String>) -> Self {
        Error::Critical(message.into())
    }

    /// Create a rollback error.
    pub fn rollback(message: impl Into<String>) -> Self {
        Error::Rollback(message.into())
    }

    /// Create a retryable failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Error::Workflow(message.into())
    }

    /// Wrap an arbitrary error as a retryable failure.
    pub fn other(error: impl Into<BoxError>) -> Self {
        Error::Other(error.into())
    }

    pub(crate) fn storage(error: impl std::fmt::Display) -> Self {
        Error::Storage(error.to_string())
    }

    pub(crate) fn diverged(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::HistoryDiverged {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Whether a step failing with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Workflow(_) | Error::Other(_) | Error::Storage(_) => true,
            #[cfg(feature = "postgres")]
            Error::Postgres(_) => true,
            _ => false,
        }
    }

    /// Whether this is a driver failure rather than a workflow outcome.
    pub(crate) fn is_storage(&self) -> bool {
        match self {
            Error::Storage(_) => true,
            #[cfg(feature = "postgres")]
            Error::Postgres(_) => true,
            _ => false,
        }
    }

    /// Returns the suspension if this error ends the pass without failing it.
    pub fn as_suspension(&self) -> Option<&Suspension> {
        match self {
            Error::Suspended(suspension) => Some(suspension),
            _ => None,
        }
    }
}

/// Why a pass stopped before the workflow finished.
///
/// Concurrent branches merge their suspensions: the earliest wake time wins,
/// awaited message names are unioned, and eviction dominates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Suspension {
    /// Earliest time at which another pass can make progress.
    pub wake_at: Option<OffsetDateTime>,
    /// Message names that would let the pass make progress.
    pub messages: Vec<String>,
    /// The pass was interrupted by eviction.
    pub evicted: bool,
}

impl Suspension {
    pub(crate) fn until(wake_at: OffsetDateTime) -> Self {
        Self {
            wake_at: Some(wake_at),
            ..Default::default()
        }
    }

    pub(crate) fn messages(names: &[String], deadline: Option<OffsetDateTime>) -> Self {
        Self {
            wake_at: deadline,
            messages: names.to_vec(),
            evicted: false,
        }
    }

    pub(crate) fn evicted() -> Self {
        Self {
            evicted: true,
            ..Default::default()
        }
    }

    pub(crate) fn merge(mut self, other: Suspension) -> Self {
        self.wake_at = match (self.wake_at, other.wake_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        for name in other.messages {
            if !self.messages.contains(&name) {
                self.messages.push(name);
            }
        }
        self.evicted |= other.evicted;
        self
    }
}

impl std::fmt::Display for Suspension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.evicted {
            return f.write_str("workflow pass evicted");
        }
        f.write_str("workflow suspended")?;
        if !self.messages.is_empty() {
            write!(f, " awaiting {}", self.messages.join(", "))?;
        }
        if let Some(wake_at) = self.wake_at {
            write!(f, " until {wake_at}")?;
        }
        Ok(())
    }
}

/// Persisted form of the error that failed a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorRecord {
    Critical {
        message: String,
    },
    Rollback {
        message: String,
    },
    StepTimeout {
        name: String,
        timeout: std::time::Duration,
    },
    StepExhausted {
        name: String,
        attempts: u32,
        last_error: String,
    },
    HistoryDiverged {
        key: String,
        reason: String,
    },
    EntryInProgress {
        active: String,
        attempted: String,
    },
    Failed {
        message: String,
    },
}

impl From<&Error> for ErrorRecord {
    fn from(error: &Error) -> Self {
        match error {
            Error::Critical(message) => ErrorRecord::Critical {
                message: message.clone(),
            },
            Error::StepTimeout { name, timeout } => ErrorRecord::StepTimeout {
                name: name.clone(),
                timeout: *timeout,
            },
            Error::Rollback(message) => ErrorRecord::Rollback {
                message: message.clone(),
            },
            Error::StepExhausted {
                name,
                attempts,
                last_error,
            } => ErrorRecord::StepExhausted {
                name: name.clone(),
                attempts: *attempts,
                last_error: last_error.clone(),
            },
            Error::HistoryDiverged { key, reason } => ErrorRecord::HistoryDiverged {
                key: key.clone(),
                reason: reason.clone(),
            },
            Error::EntryInProgress { active, attempted } => ErrorRecord::EntryInProgress {
                active: active.clone(),
                attempted: attempted.clone(),
            },
            other => ErrorRecord::Failed {
                message: other.to_string(),
            },
        }
    }
}

impl From<ErrorRecord> for Error {
    fn from(record: ErrorRecord) -> Self {
        match record {
            ErrorRecord::Critical { message } => Error::Critical(message),
            ErrorRecord::Rollback { message } => Error::Rollback(message),
            ErrorRecord::StepTimeout { name, timeout } => Error::StepTimeout { name, timeout },
            ErrorRecord::StepExhausted {
                name,
                attempts,
                last_error,
            } => Error::StepExhausted {
                name,
                attempts,
                last_error,
            },
            ErrorRecord::HistoryDiverged { key, reason } => Error::HistoryDiverged { key, reason },
            ErrorRecord::EntryInProgress { active, attempted } => {
                Error::EntryInProgress { active, attempted }
            }
            ErrorRecord::Failed { message } => Error::Workflow(message),
        }
    }
}

//! History entries and their lifecycle.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use super::location::Location;
use crate::driver::Message;
use crate::error::{Error, ErrorRecord, Result};

/// Combinator that produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Step,
    Loop,
    Sleep,
    Listen,
    Join,
    Race,
    Removed,
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            EntryType::Step => "step",
            EntryType::Loop => "loop",
            EntryType::Sleep => "sleep",
            EntryType::Listen => "listen",
            EntryType::Join => "join",
            EntryType::Race => "race",
            EntryType::Removed => "removed",
        };
        f.write_str(label)
    }
}

/// Kind-specific payload of an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryKind {
    Step {
        output: Option<Value>,
        ephemeral: bool,
    },
    Loop {
        /// State after `iteration` completed iterations.
        state: Value,
        iteration: u64,
        output: Option<Value>,
    },
    Sleep {
        wake_at: OffsetDateTime,
    },
    Listen {
        names: Vec<String>,
        count: usize,
        deadline: Option<OffsetDateTime>,
        messages: Vec<Message>,
    },
    Join {
        branches: Vec<BranchRecord>,
    },
    Race {
        branches: Vec<BranchRecord>,
        winner: Option<usize>,
    },
    Removed {
        original: EntryType,
    },
}

impl EntryKind {
    pub fn entry_type(&self) -> EntryType {
        match self {
            EntryKind::Step { .. } => EntryType::Step,
            EntryKind::Loop { .. } => EntryType::Loop,
            EntryKind::Sleep { .. } => EntryType::Sleep,
            EntryKind::Listen { .. } => EntryType::Listen,
            EntryKind::Join { .. } => EntryType::Join,
            EntryKind::Race { .. } => EntryType::Race,
            EntryKind::Removed { .. } => EntryType::Removed,
        }
    }
}

/// Durable record of one combinator invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub name: String,
    pub location: Location,
    /// Ordinal among the entries of `location`.
    pub position: u32,
    pub kind: EntryKind,
    pub created_at: OffsetDateTime,
}

impl Entry {
    pub(crate) fn new(name: &str, location: Location, position: u32, kind: EntryKind) -> Self {
        Self {
            key: location.key_for(name),
            name: name.to_owned(),
            location,
            position,
            kind,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn entry_type(&self) -> EntryType {
        self.kind.entry_type()
    }
}

/// Outcome of one join or race branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRecord {
    pub name: String,
    pub status: BranchStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl BranchRecord {
    pub(crate) fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: BranchStatus::Pending,
            output: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

/// Lifecycle of an entry.
///
/// ```text
/// pending ──► running ──► completed
///    ▲           ├──────► failed
///    │           ├──────► exhausted ──(recover)──┐
///    └───────────┴──(retry scheduled)◄───────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Exhausted,
}

impl EntryStatus {
    fn can_move_to(self, next: EntryStatus) -> bool {
        use EntryStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Running, Pending)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Exhausted)
                | (Exhausted, Pending)
        )
    }
}

/// Mutable bookkeeping kept next to an entry. Retries rewrite only this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub status: EntryStatus,
    pub attempts: u32,
    pub error: Option<String>,
    /// Typed failure of a failed entry, rebuilt on replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ErrorRecord>,
    pub retry_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
}

impl Default for EntryMetadata {
    fn default() -> Self {
        Self {
            status: EntryStatus::Pending,
            attempts: 0,
            error: None,
            failure: None,
            retry_at: None,
            updated_at: OffsetDateTime::now_utc(),
        }
    }
}

impl EntryMetadata {
    fn transition(&mut self, next: EntryStatus) -> Result<()> {
        if !self.status.can_move_to(next) {
            return Err(Error::critical(format!(
                "entry cannot move from {:?} to {:?}",
                self.status, next
            )));
        }
        self.status = next;
        self.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    pub(crate) fn start(&mut self) -> Result<()> {
        self.transition(EntryStatus::Running)
    }

    pub(crate) fn complete(&mut self) -> Result<()> {
        self.retry_at = None;
        self.transition(EntryStatus::Completed)
    }

    /// Record a failed attempt that will be retried at `retry_at`.
    pub(crate) fn retry_later(&mut self, error: String, retry_at: OffsetDateTime) -> Result<()> {
        self.attempts += 1;
        self.error = Some(error);
        self.retry_at = Some(retry_at);
        self.transition(EntryStatus::Pending)
    }

    /// Record a failure that is never retried.
    pub(crate) fn fail(&mut self, error: &Error) -> Result<()> {
        if self.status == EntryStatus::Running {
            self.attempts += 1;
        }
        self.error = Some(error.to_string());
        self.failure = Some(ErrorRecord::from(error));
        self.retry_at = None;
        self.transition(EntryStatus::Failed)
    }

    /// Record the attempt that used up the retry budget.
    pub(crate) fn exhaust(&mut self, error: String) -> Result<()> {
        self.attempts += 1;
        self.error = Some(error);
        self.retry_at = None;
        self.transition(EntryStatus::Exhausted)
    }

    /// Clear exhaustion so the next pass retries from attempt zero.
    pub(crate) fn reset(&mut self) -> Result<()> {
        self.attempts = 0;
        self.error = None;
        self.failure = None;
        self.retry_at = None;
        self.transition(EntryStatus::Pending)
    }

    pub fn is_completed(&self) -> bool {
        self.status == EntryStatus::Completed
    }
}

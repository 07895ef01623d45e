//! Host-provided storage and message contracts.
//!
//! The engine never talks to a database directly. Everything it persists goes
//! through a [`StorageDriver`] and every message it consumes comes from a
//! [`MessageDriver`]. Two implementations ship with the crate:
//!
//! - [`MemoryStorage`] / [`MemoryMessages`]: in-process drivers for tests and embedded hosts
//! - `PgDriver`: PostgreSQL implementation of both contracts (requires the `postgres` feature)

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use memory::{MemoryMessages, MemoryStorage};
#[cfg(feature = "postgres")]
pub use postgres::PgDriver;

use crate::error::Result;
use crate::workflow::WorkflowId;

/// One write inside an atomic [`StorageDriver::batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvWrite {
    Set { key: String, value: Vec<u8> },
    Delete { key: String },
    DeletePrefix { prefix: String },
}

impl KvWrite {
    /// The key or prefix this write targets.
    pub fn key(&self) -> &str {
        match self {
            KvWrite::Set { key, .. } | KvWrite::Delete { key } => key,
            KvWrite::DeletePrefix { prefix } => prefix,
        }
    }
}

/// Key/value persistence plus a single wake-up alarm per workflow.
///
/// `batch` must apply all writes atomically: after a crash either every
/// write of a batch is visible or none is. Writes inside a batch apply in
/// order, so a `DeletePrefix` followed by a `Set` under the same prefix
/// keeps the new value.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn delete_prefix(&self, prefix: &str) -> Result<()>;

    /// All pairs whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    async fn batch(&self, writes: Vec<KvWrite>) -> Result<()>;

    /// Schedule a wake-up for the workflow, replacing any previous alarm.
    async fn set_alarm(&self, workflow_id: &WorkflowId, wake_at: OffsetDateTime) -> Result<()>;

    async fn clear_alarm(&self, workflow_id: &WorkflowId) -> Result<()>;
}

/// Identifier of a queued message. Time-ordered (UUID v7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// A named message delivered to a workflow's queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub name: String,
    pub data: Value,
    pub sent_at: OffsetDateTime,
}

impl Message {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            id: MessageId::new(),
            name: name.into(),
            data,
            sent_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Receives the response passed to [`MessageDriver::complete_message`].
pub type CompletionSender = oneshot::Sender<Option<Value>>;

/// Filter for [`MessageDriver::receive_messages`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveRequest {
    /// Names to match. `None` matches every name.
    pub names: Option<Vec<String>>,
    /// Maximum number of messages to return.
    pub count: usize,
    /// Keep returned messages queued (hidden from other receivers) until
    /// they are completed, instead of removing them immediately.
    pub completable: bool,
}

/// Durable per-workflow message queue.
///
/// Messages are delivered FIFO by arrival. A completable receive hides the
/// message until [`complete_message`](Self::complete_message) removes it;
/// [`load_messages`](Self::load_messages) makes hidden messages visible
/// again, which is how a new process recovers after a crash between receive
/// and completion.
#[async_trait]
pub trait MessageDriver: Send + Sync {
    /// Every queued message in arrival order. Resets completable receives.
    async fn load_messages(&self) -> Result<Vec<Message>>;

    async fn add_message(
        &self,
        message: Message,
        on_complete: Option<CompletionSender>,
    ) -> Result<()>;

    async fn receive_messages(&self, request: ReceiveRequest) -> Result<Vec<Message>>;

    /// Remove messages by id. Returns the ids that were still queued.
    async fn delete_messages(&self, ids: &[MessageId]) -> Result<Vec<MessageId>>;

    /// Remove a received message and hand `response` to its sender, if any.
    async fn complete_message(&self, id: MessageId, response: Option<Value>) -> Result<()>;

    /// Resolve once a visible message matching `names` is queued, or when
    /// `abort` is cancelled.
    async fn wait_for_messages(
        &self,
        names: Option<&[String]>,
        abort: CancellationToken,
    ) -> Result<()>;
}

/// The pair of drivers a workflow runs against.
#[derive(Clone)]
pub struct Drivers {
    pub storage: Arc<dyn StorageDriver>,
    pub messages: Arc<dyn MessageDriver>,
}

impl Drivers {
    pub fn new(storage: Arc<dyn StorageDriver>, messages: Arc<dyn MessageDriver>) -> Self {
        Self { storage, messages }
    }

    /// Fresh in-memory drivers.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryMessages::new()),
        )
    }
}

impl std::fmt::Debug for Drivers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drivers").finish_non_exhaustive()
    }
}

pub(crate) fn matches_names(names: Option<&[String]>, name: &str) -> bool {
    names.is_none_or(|names| names.iter().any(|n| n == name))
}

//! Persisted per-workflow record.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::driver::{KvWrite, StorageDriver};
use crate::error::{Error, ErrorRecord, Result};
use crate::history::record_key;
use crate::workflow::{WorkflowId, WorkflowState};

/// Durable state of one workflow, stored next to its history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub workflow_type: String,
    pub state: WorkflowState,
    /// Serialized input, replayed on every pass.
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<ErrorRecord>,
    /// When a sleeping workflow next wants a pass.
    pub wake_at: Option<OffsetDateTime>,
    /// Message names a sleeping workflow is waiting for.
    #[serde(default)]
    pub awaiting: Vec<String>,
    /// Key of the entry whose exhaustion failed the workflow.
    pub exhausted_entry: Option<String>,
    pub passes: u64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl WorkflowRecord {
    pub(crate) fn new(workflow_type: &str, input: Value) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            workflow_type: workflow_type.to_owned(),
            state: WorkflowState::Pending,
            input,
            output: None,
            error: None,
            wake_at: None,
            awaiting: Vec::new(),
            exhausted_entry: None,
            passes: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Load the record of `workflow_id`, if the workflow was ever started.
    pub async fn load(storage: &dyn StorageDriver, workflow_id: &WorkflowId) -> Result<Option<Self>> {
        match storage.get(&record_key(workflow_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn fetch(storage: &dyn StorageDriver, workflow_id: &WorkflowId) -> Result<Self> {
        Self::load(storage, workflow_id)
            .await?
            .ok_or_else(|| Error::NotFound(workflow_id.clone()))
    }

    pub(crate) async fn save(&self, storage: &dyn StorageDriver, workflow_id: &WorkflowId) -> Result<()> {
        storage
            .set(&record_key(workflow_id), serde_json::to_vec(self)?)
            .await
    }

    /// The record as a write for an atomic batch.
    pub(crate) fn write(&self, workflow_id: &WorkflowId) -> Result<KvWrite> {
        Ok(KvWrite::Set {
            key: record_key(workflow_id),
            value: serde_json::to_vec(self)?,
        })
    }

    pub(crate) fn set_state(&mut self, state: WorkflowState) {
        self.state = state;
        self.updated_at = OffsetDateTime::now_utc();
        if state != WorkflowState::Sleeping {
            self.wake_at = None;
            self.awaiting.clear();
        }
    }
}

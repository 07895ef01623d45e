//! External control surface of a running workflow.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::info;

use super::task::TaskShared;
use crate::driver::{Drivers, Message, MessageId};
use crate::error::{Error, Result};
use crate::history::History;
use crate::record::WorkflowRecord;
use crate::workflow::{Workflow, WorkflowId, WorkflowState};

/// Handle to a workflow owned by a [`WorkflowRuntime`](super::WorkflowRuntime).
///
/// Handles are cheap to clone and may outlive the task; queries keep
/// working against storage after the task stops.
pub struct WorkflowHandle<W: Workflow> {
    id: WorkflowId,
    drivers: Drivers,
    shared: Arc<TaskShared>,
    _workflow: PhantomData<fn() -> W>,
}

impl<W: Workflow> Clone for WorkflowHandle<W> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            drivers: self.drivers.clone(),
            shared: Arc::clone(&self.shared),
            _workflow: PhantomData,
        }
    }
}

impl<W: Workflow> WorkflowHandle<W> {
    pub(crate) fn new(id: WorkflowId, drivers: Drivers, shared: Arc<TaskShared>) -> Self {
        Self {
            id,
            drivers,
            shared,
            _workflow: PhantomData,
        }
    }

    pub fn id(&self) -> &WorkflowId {
        &self.id
    }

    /// Queue a message for the workflow and trigger a pass.
    pub async fn message(&self, name: &str, payload: impl Serialize) -> Result<MessageId> {
        let message = Message::new(name, serde_json::to_value(payload)?);
        let id = message.id;
        self.drivers.messages.add_message(message, None).await?;
        self.shared.trigger.notify_one();
        Ok(id)
    }

    /// Queue a message and wait until the workflow has consumed it.
    ///
    /// Resolves with the completion response, which is `None` for messages
    /// consumed by the listen combinators.
    pub async fn send_and_wait(&self, name: &str, payload: impl Serialize) -> Result<Option<Value>> {
        let message = Message::new(name, serde_json::to_value(payload)?);
        let (tx, rx) = oneshot::channel();
        self.drivers.messages.add_message(message, Some(tx)).await?;
        self.shared.trigger.notify_one();
        rx.await
            .map_err(|_| Error::storage(format!("message `{name}` was discarded before completion")))
    }

    /// Run a pass now, regardless of the wake time.
    pub fn wake(&self) {
        self.shared.trigger.notify_one();
    }

    /// Interrupt the running pass. The workflow stays resumable; the next
    /// trigger starts a fresh pass.
    pub fn evict(&self) {
        info!(workflow_id = %self.id, "evicting workflow pass");
        self.shared.evict();
    }

    /// Stop the workflow for good.
    ///
    /// The cancelled state and the cleared alarm are persisted before this
    /// returns; a running pass is interrupted but not waited for. Cancelling
    /// a completed workflow does nothing.
    pub async fn cancel(&self) -> Result<()> {
        {
            let _guard = self.shared.record_lock.lock().await;
            let storage = self.drivers.storage.as_ref();
            let mut record = WorkflowRecord::fetch(storage, &self.id).await?;
            if record.state.is_final() {
                return Ok(());
            }
            record.set_state(WorkflowState::Cancelled);
            record.save(storage, &self.id).await?;
            storage.clear_alarm(&self.id).await?;
        }
        self.shared.signal.cancel();
        self.shared.state.send_replace(WorkflowState::Cancelled);
        info!(workflow_id = %self.id, "workflow cancelled");
        Ok(())
    }

    /// Clear the exhaustion of the step that failed the workflow and run
    /// another pass. The step starts again from its first attempt.
    pub async fn recover(&self) -> Result<()> {
        {
            let _guard = self.shared.record_lock.lock().await;
            let storage = self.drivers.storage.as_ref();
            let mut record = WorkflowRecord::fetch(storage, &self.id).await?;
            let key = match (record.state, record.exhausted_entry.take()) {
                (WorkflowState::Failed, Some(key)) => key,
                _ => return Err(Error::NothingToRecover(self.id.clone())),
            };

            let mut history = History::load(storage, &self.id).await?;
            history.reset_exhausted(&key)?;
            record.error = None;
            record.set_state(WorkflowState::Pending);

            let mut writes = history.take_pending()?;
            writes.push(record.write(&self.id)?);
            storage.batch(writes).await?;
            info!(workflow_id = %self.id, entry = %key, "exhausted step recovered");
        }
        self.shared.state.send_replace(WorkflowState::Pending);
        self.shared.trigger.notify_one();
        Ok(())
    }

    /// Wait until the workflow settles and return its outcome.
    ///
    /// A failed workflow reports the error that failed it, and a cancelled
    /// one reports [`Error::Evicted`].
    pub async fn result(&self) -> Result<W::Output> {
        let mut state = self.shared.state.subscribe();
        tokio::select! {
            _ = state.wait_for(|state| state.is_settled()) => {}
            _ = self.shared.stopped.cancelled() => {}
        }

        let record = WorkflowRecord::fetch(self.drivers.storage.as_ref(), &self.id).await?;
        match record.state {
            WorkflowState::Completed => Ok(serde_json::from_value(
                record.output.unwrap_or(Value::Null),
            )?),
            WorkflowState::Cancelled => Err(Error::Evicted),
            WorkflowState::Failed => Err(record
                .error
                .map(Error::from)
                .unwrap_or_else(|| Error::critical("workflow failed"))),
            _ => Err(Error::Stopped(self.id.clone())),
        }
    }

    pub async fn get_state(&self) -> Result<WorkflowState> {
        let record = WorkflowRecord::fetch(self.drivers.storage.as_ref(), &self.id).await?;
        Ok(record.state)
    }

    /// Output of a completed workflow.
    pub async fn get_output(&self) -> Result<Option<W::Output>> {
        let record = WorkflowRecord::fetch(self.drivers.storage.as_ref(), &self.id).await?;
        match (record.state, record.output) {
            (WorkflowState::Completed, Some(output)) => Ok(Some(serde_json::from_value(output)?)),
            _ => Ok(None),
        }
    }

    /// The persisted history, for inspection.
    pub async fn history(&self) -> Result<History> {
        History::load(self.drivers.storage.as_ref(), &self.id).await
    }
}

impl<W: Workflow> std::fmt::Debug for WorkflowHandle<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowHandle")
            .field("id", &self.id)
            .field("workflow_type", &W::TYPE)
            .finish_non_exhaustive()
    }
}

//! One logical execution pass of a workflow.

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::abort::AbortSignal;
use crate::context::{PassShared, WorkflowContext};
use crate::driver::Drivers;
use crate::error::{Error, ErrorRecord, Result};
use crate::history::History;
use crate::record::WorkflowRecord;
use crate::runtime::RuntimeConfig;
use crate::workflow::{Workflow, WorkflowId, WorkflowState};

/// What a pass left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassOutcome {
    pub state: WorkflowState,
    /// When the next pass is due, for a sleeping workflow.
    pub wake_at: Option<OffsetDateTime>,
    /// Message names that would wake a sleeping workflow.
    pub awaiting: Vec<String>,
}

impl PassOutcome {
    fn from_record(record: &WorkflowRecord) -> Self {
        Self {
            state: record.state,
            wake_at: record.wake_at,
            awaiting: record.awaiting.clone(),
        }
    }
}

/// Executes passes of one workflow instance.
///
/// The runner owns no task. [`WorkflowRuntime`](crate::WorkflowRuntime)
/// drives it for most hosts; hosts with their own scheduling (an actor's
/// alarm handler, say) call [`run_pass`](Self::run_pass) directly and must
/// never run two passes of the same workflow at once.
pub struct WorkflowRunner<W: Workflow> {
    id: WorkflowId,
    workflow: Arc<W>,
    drivers: Drivers,
    config: RuntimeConfig,
    record_lock: Arc<AsyncMutex<()>>,
}

impl<W: Workflow> WorkflowRunner<W> {
    pub fn new(id: WorkflowId, workflow: Arc<W>, drivers: Drivers, config: &RuntimeConfig) -> Self {
        Self::with_record_lock(id, workflow, drivers, config, Arc::default())
    }

    pub(crate) fn with_record_lock(
        id: WorkflowId,
        workflow: Arc<W>,
        drivers: Drivers,
        config: &RuntimeConfig,
        record_lock: Arc<AsyncMutex<()>>,
    ) -> Self {
        Self {
            id,
            workflow,
            drivers,
            config: config.clone(),
            record_lock,
        }
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.id
    }

    /// Create the workflow record with `input`.
    ///
    /// Starting a workflow that already has a record leaves it untouched, so
    /// the persisted input is the one every pass replays.
    pub async fn start(&self, input: W::Input) -> Result<WorkflowRecord> {
        let _guard = self.record_lock.lock().await;
        let storage = self.drivers.storage.as_ref();
        if let Some(existing) = WorkflowRecord::load(storage, &self.id).await? {
            debug!(
                workflow_id = %self.id,
                state = %existing.state,
                "workflow record already exists"
            );
            return Ok(existing);
        }

        let record = WorkflowRecord::new(W::TYPE, serde_json::to_value(&input)?);
        record.save(storage, &self.id).await?;
        info!(workflow_id = %self.id, workflow_type = W::TYPE, "workflow started");
        Ok(record)
    }

    /// Run one pass: replay the workflow from the top and continue until it
    /// finishes, fails, suspends, or `signal` evicts it.
    ///
    /// Workflow outcomes, failures included, are persisted and returned as
    /// `Ok`. `Err` means a driver failed; the record is left for another
    /// pass to retry.
    pub async fn run_pass(&self, signal: &AbortSignal) -> Result<PassOutcome> {
        let storage = self.drivers.storage.as_ref();
        let (input, pass) = {
            let _guard = self.record_lock.lock().await;
            let mut record = WorkflowRecord::fetch(storage, &self.id).await?;
            if record.state.is_settled() {
                debug!(workflow_id = %self.id, state = %record.state, "workflow already settled");
                return Ok(PassOutcome::from_record(&record));
            }
            record.passes += 1;
            record.set_state(WorkflowState::Running);
            record.save(storage, &self.id).await?;
            (record.input, record.passes)
        };

        let span = info_span!(
            "workflow_pass",
            workflow_id = %self.id,
            workflow_type = W::TYPE,
            pass
        );
        let result = self.execute(input, signal).instrument(span).await?;
        self.settle(result).await
    }

    async fn execute(
        &self,
        input: serde_json::Value,
        signal: &AbortSignal,
    ) -> Result<Result<serde_json::Value>> {
        // Receives a crashed pass never completed become visible again.
        let queued = self.drivers.messages.load_messages().await?;
        if !queued.is_empty() {
            debug!(queued = queued.len(), "messages queued at pass start");
        }
        let history = History::load(self.drivers.storage.as_ref(), &self.id).await?;
        let shared = Arc::new(PassShared::new(
            &self.drivers,
            history,
            self.config.mode.strategy(),
            signal.clone(),
            self.config.clone(),
        ));
        let ctx = WorkflowContext::root(Arc::clone(&shared));

        debug!(mode = ?self.config.mode, "pass started");
        let result = match serde_json::from_value::<W::Input>(input) {
            Ok(input) => match self.workflow.run(ctx, input).await {
                Ok(output) => serde_json::to_value(output).map_err(Error::from),
                Err(error) => Err(error),
            },
            Err(error) => Err(Error::from(error)),
        };

        let result = match result {
            Err(error) if error.is_storage() => return Err(error),
            other => other,
        };
        // Ephemeral writes staged after the last durable commit.
        shared.flush().await?;
        Ok(result)
    }

    /// Persist the outcome of a pass.
    async fn settle(&self, result: Result<serde_json::Value>) -> Result<PassOutcome> {
        let storage = self.drivers.storage.as_ref();
        let _guard = self.record_lock.lock().await;
        let mut record = WorkflowRecord::fetch(storage, &self.id).await?;
        if record.state == WorkflowState::Cancelled {
            debug!(workflow_id = %self.id, "pass ended after cancellation");
            return Ok(PassOutcome::from_record(&record));
        }

        match result {
            Ok(output) => {
                record.output = Some(output);
                record.error = None;
                record.set_state(WorkflowState::Completed);
                info!(workflow_id = %self.id, passes = record.passes, "workflow completed");
            }
            Err(Error::Suspended(suspension)) if suspension.evicted => {
                record.set_state(WorkflowState::Pending);
                info!(workflow_id = %self.id, "pass evicted");
            }
            Err(Error::Suspended(suspension)) => {
                record.set_state(WorkflowState::Sleeping);
                record.wake_at = suspension.wake_at;
                record.awaiting = suspension.messages;
                debug!(
                    workflow_id = %self.id,
                    wake_at = ?record.wake_at,
                    awaiting = ?record.awaiting,
                    "workflow sleeping"
                );
            }
            Err(failure) => {
                if let Error::StepExhausted { name, .. } = &failure {
                    record.exhausted_entry = Some(name.clone());
                }
                record.error = Some(ErrorRecord::from(&failure));
                record.set_state(WorkflowState::Failed);
                error!(workflow_id = %self.id, error = %failure, "workflow failed");
            }
        }

        record.save(storage, &self.id).await?;
        match (record.state, record.wake_at) {
            (WorkflowState::Sleeping, Some(wake_at)) => {
                storage.set_alarm(&self.id, wake_at).await?;
            }
            (WorkflowState::Pending, _) => {}
            _ => {
                if let Err(error) = storage.clear_alarm(&self.id).await {
                    warn!(workflow_id = %self.id, %error, "failed to clear alarm");
                }
            }
        }
        Ok(PassOutcome::from_record(&record))
    }
}

impl<W: Workflow> std::fmt::Debug for WorkflowRunner<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRunner")
            .field("id", &self.id)
            .field("workflow_type", &W::TYPE)
            .field("mode", &self.config.mode)
            .finish_non_exhaustive()
    }
}

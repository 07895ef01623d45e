//! Per-workflow task that drives passes.

use std::sync::Arc;

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::{Mutex as AsyncMutex, Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::RuntimeConfig;
use crate::abort::AbortSignal;
use crate::runner::WorkflowRunner;
use crate::strategy::sleep_until;
use crate::workflow::{Workflow, WorkflowState};

/// State shared between a workflow task and its handles.
pub(crate) struct TaskShared {
    /// Wakes the task for another pass.
    pub(crate) trigger: Notify,
    /// Root signal of the workflow.
    pub(crate) signal: AbortSignal,
    /// Signal of the pass currently running, or of the last one.
    pub(crate) current: Mutex<AbortSignal>,
    /// Serializes record updates between passes, cancel, and recover.
    pub(crate) record_lock: Arc<AsyncMutex<()>>,
    pub(crate) state: watch::Sender<WorkflowState>,
    /// Cancelled once the task has exited.
    pub(crate) stopped: CancellationToken,
}

impl TaskShared {
    pub(crate) fn new() -> Self {
        let signal = AbortSignal::new();
        Self {
            trigger: Notify::new(),
            current: Mutex::new(signal.clone()),
            signal,
            record_lock: Arc::default(),
            state: watch::channel(WorkflowState::Pending).0,
            stopped: CancellationToken::new(),
        }
    }

    fn begin_pass(&self) -> AbortSignal {
        let pass = self.signal.next_pass();
        *self.current.lock() = pass.clone();
        pass
    }

    /// Evict the running pass, if any.
    pub(crate) fn evict(&self) {
        self.current.lock().evict();
    }
}

/// Owns one workflow and runs its passes until it settles for good, is
/// cancelled, or the runtime shuts down.
///
/// A settled workflow keeps its task parked so that recovery can trigger
/// another pass.
pub(crate) struct WorkflowTask<W: Workflow> {
    runner: WorkflowRunner<W>,
    shared: Arc<TaskShared>,
    config: RuntimeConfig,
}

impl<W: Workflow> WorkflowTask<W> {
    pub(crate) fn new(
        runner: WorkflowRunner<W>,
        shared: Arc<TaskShared>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            runner,
            shared,
            config,
        }
    }

    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let id = self.runner.workflow_id().clone();
        info!(workflow_id = %id, workflow_type = W::TYPE, "workflow task started");

        loop {
            // Shutdown raises the flag before evicting, so a pass begun
            // after the eviction still sees it here.
            let pass = self.shared.begin_pass();
            if *shutdown.borrow() || pass.is_cancelled() {
                break;
            }
            let wake_at = match self.runner.run_pass(&pass).await {
                Ok(outcome) => {
                    self.shared.state.send_replace(outcome.state);
                    if outcome.state.is_final() {
                        break;
                    }
                    outcome.wake_at
                }
                Err(error) => {
                    warn!(
                        workflow_id = %id,
                        %error,
                        backoff = ?self.config.error_backoff,
                        "pass failed, retrying"
                    );
                    Some(OffsetDateTime::now_utc() + self.config.error_backoff)
                }
            };

            tokio::select! {
                _ = self.shared.trigger.notified() => {
                    debug!(workflow_id = %id, "pass triggered");
                }
                _ = sleep_until(wake_at) => {
                    debug!(workflow_id = %id, "wake time reached");
                }
                _ = self.shared.signal.cancelled() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.shared.stopped.cancel();
        info!(workflow_id = %id, "workflow task stopped");
    }
}

//! Keyed registry of workflow tasks.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::config::RuntimeConfig;
use super::handle::WorkflowHandle;
use super::task::{TaskShared, WorkflowTask};
use crate::driver::Drivers;
use crate::error::{Error, Result};
use crate::runner::WorkflowRunner;
use crate::workflow::{Workflow, WorkflowId};

struct TaskEntry {
    shared: Arc<TaskShared>,
    drivers: Drivers,
    join: JoinHandle<()>,
}

/// Owns one task per workflow id and drives its passes.
///
/// A workflow id can be owned by at most one live task, which makes every
/// workflow single-writer within the process.
///
/// # Example
///
/// ```ignore
/// let runtime = WorkflowRuntime::new(RuntimeConfig::default());
///
/// let handle = runtime
///     .spawn(WorkflowId::new("order-7"), Checkout, cart, Drivers::in_memory())
///     .await?;
/// handle.message("paid", receipt).await?;
/// let shipped = handle.result().await?;
///
/// runtime.shutdown().await;
/// ```
pub struct WorkflowRuntime {
    config: RuntimeConfig,
    tasks: Mutex<HashMap<WorkflowId, TaskEntry>>,
    shutdown: watch::Sender<bool>,
}

impl WorkflowRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            tasks: Mutex::new(HashMap::new()),
            shutdown: watch::channel(false).0,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Start `workflow` under `id` and spawn the task that drives it.
    ///
    /// When a record already exists for `id` the workflow resumes from its
    /// history with the persisted input, and `input` is ignored. Fails with
    /// [`Error::AlreadyRunning`] while another task owns `id`.
    pub async fn spawn<W: Workflow>(
        &self,
        id: WorkflowId,
        workflow: W,
        input: W::Input,
        drivers: Drivers,
    ) -> Result<WorkflowHandle<W>> {
        if *self.shutdown.borrow() {
            return Err(Error::Stopped(id));
        }
        let mut tasks = self.tasks.lock().await;
        if tasks.get(&id).is_some_and(|task| !task.join.is_finished()) {
            return Err(Error::AlreadyRunning(id));
        }

        let shared = Arc::new(TaskShared::new());
        let runner = WorkflowRunner::with_record_lock(
            id.clone(),
            Arc::new(workflow),
            drivers.clone(),
            &self.config,
            Arc::clone(&shared.record_lock),
        );
        let record = runner.start(input).await?;
        shared.state.send_replace(record.state);

        let task = WorkflowTask::new(runner, Arc::clone(&shared), self.config.clone());
        let join = tokio::spawn(task.run(self.shutdown.subscribe()));
        tasks.insert(
            id.clone(),
            TaskEntry {
                shared: Arc::clone(&shared),
                drivers: drivers.clone(),
                join,
            },
        );

        Ok(WorkflowHandle::new(id, drivers, shared))
    }

    /// Handle to a workflow spawned on this runtime.
    pub async fn handle<W: Workflow>(&self, id: &WorkflowId) -> Option<WorkflowHandle<W>> {
        let tasks = self.tasks.lock().await;
        tasks.get(id).map(|task| {
            WorkflowHandle::new(id.clone(), task.drivers.clone(), Arc::clone(&task.shared))
        })
    }

    /// Whether a live task owns `id`.
    pub async fn is_running(&self, id: &WorkflowId) -> bool {
        let tasks = self.tasks.lock().await;
        tasks.get(id).is_some_and(|task| !task.join.is_finished())
    }

    /// Evict every running pass and wait for the tasks to stop, up to
    /// [`RuntimeConfig::shutdown_timeout`].
    ///
    /// Workflows are left resumable: a later runtime spawning the same ids
    /// continues from their histories.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);

        let tasks: Vec<_> = self.tasks.lock().await.drain().collect();
        info!(workflows = tasks.len(), "runtime shutting down");
        for (_, task) in &tasks {
            task.shared.evict();
        }

        let timeout = self.config.shutdown_timeout;
        let all_tasks = async {
            for (_, task) in tasks {
                let _ = task.join.await;
            }
        };
        match tokio::time::timeout(timeout, all_tasks).await {
            Ok(()) => info!("runtime stopped gracefully"),
            Err(_) => warn!(
                timeout_secs = timeout.as_secs(),
                "shutdown timeout exceeded, abandoning workflow tasks"
            ),
        }
    }
}

impl std::fmt::Debug for WorkflowRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRuntime")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

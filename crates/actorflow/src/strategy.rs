//! How a pass waits at suspension points.
//!
//! Every combinator is written once against [`SuspendStrategy`]. The two
//! implementations differ only in what "wait" means:
//!
//! - [`ExecutionMode::Yield`] ends the pass with [`Error::Suspended`] and lets
//!   the host start a new pass once the wake time or a message arrives.
//! - [`ExecutionMode::Live`] keeps the pass running and waits in place.
//!
//! Both write the same history for the same sequence of triggers.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use crate::abort::AbortSignal;
use crate::driver::MessageDriver;
use crate::error::{Error, Result, Suspension};

/// Execution strategy of a workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Return control at every suspension point.
    #[default]
    Yield,
    /// Keep one continuation running and wait in place.
    Live,
}

impl ExecutionMode {
    pub(crate) fn strategy(self) -> Arc<dyn SuspendStrategy> {
        match self {
            ExecutionMode::Yield => Arc::new(YieldStrategy),
            ExecutionMode::Live => Arc::new(LiveStrategy),
        }
    }
}

#[async_trait]
pub(crate) trait SuspendStrategy: Send + Sync {
    /// Wait until `wake_at`.
    async fn sleep_until(&self, signal: &AbortSignal, wake_at: OffsetDateTime) -> Result<()>;

    /// Wait until a message named in `names` is queued or `deadline` passes.
    async fn await_messages(
        &self,
        signal: &AbortSignal,
        messages: &dyn MessageDriver,
        names: &[String],
        deadline: Option<OffsetDateTime>,
    ) -> Result<()>;

    /// Called after a loop commits its state.
    async fn after_loop_commit(&self);
}

struct YieldStrategy;

#[async_trait]
impl SuspendStrategy for YieldStrategy {
    async fn sleep_until(&self, _signal: &AbortSignal, wake_at: OffsetDateTime) -> Result<()> {
        if OffsetDateTime::now_utc() >= wake_at {
            return Ok(());
        }
        Err(Error::Suspended(Suspension::until(wake_at)))
    }

    async fn await_messages(
        &self,
        _signal: &AbortSignal,
        _messages: &dyn MessageDriver,
        names: &[String],
        deadline: Option<OffsetDateTime>,
    ) -> Result<()> {
        Err(Error::Suspended(Suspension::messages(names, deadline)))
    }

    async fn after_loop_commit(&self) {}
}

struct LiveStrategy;

#[async_trait]
impl SuspendStrategy for LiveStrategy {
    async fn sleep_until(&self, signal: &AbortSignal, wake_at: OffsetDateTime) -> Result<()> {
        debug!(%wake_at, "sleeping in place");
        tokio::select! {
            _ = sleep_until(Some(wake_at)) => Ok(()),
            _ = signal.evicted() => Err(Error::Suspended(Suspension::evicted())),
        }
    }

    async fn await_messages(
        &self,
        signal: &AbortSignal,
        messages: &dyn MessageDriver,
        names: &[String],
        deadline: Option<OffsetDateTime>,
    ) -> Result<()> {
        let abort = signal.token().child_token();
        let waited = tokio::select! {
            result = messages.wait_for_messages(Some(names), abort.clone()) => result,
            _ = sleep_until(deadline) => Ok(()),
        };
        abort.cancel();

        if signal.is_evicted() {
            return Err(Error::Suspended(Suspension::evicted()));
        }
        waited
    }

    async fn after_loop_commit(&self) {
        tokio::task::yield_now().await;
    }
}

/// Sleep until `at`, or forever when there is no deadline.
pub(crate) async fn sleep_until(at: Option<OffsetDateTime>) {
    let Some(at) = at else {
        return std::future::pending().await;
    };
    let remaining =
        std::time::Duration::try_from(at - OffsetDateTime::now_utc()).unwrap_or_default();
    tokio::time::sleep(remaining).await;
}

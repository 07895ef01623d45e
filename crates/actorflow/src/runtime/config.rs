//! Runtime configuration.

use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::strategy::ExecutionMode;

/// Configuration shared by every workflow a runtime drives.
///
/// Per-call settings on [`StepConfig`](crate::StepConfig) and
/// [`LoopConfig`](crate::LoopConfig) override the defaults held here.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use actorflow::{ExecutionMode, RuntimeConfig};
///
/// let config = RuntimeConfig {
///     mode: ExecutionMode::Live,
///     step_timeout: Some(Duration::from_secs(5)),
///     ..Default::default()
/// };
/// assert_eq!(config.loops.commit_interval, 20);
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How passes wait at suspension points. Default: [`ExecutionMode::Yield`].
    pub mode: ExecutionMode,

    /// Retry budget and backoff for steps that do not set their own.
    pub retry_policy: RetryPolicy,

    /// Time limit for one step attempt. `None` disables it.
    /// Default: 30 seconds.
    pub step_timeout: Option<Duration>,

    /// Commit and pruning settings for loops.
    pub loops: LoopDefaults,

    /// Delay before a pass is retried after a storage or message driver
    /// failure escaped it. Default: 1 second.
    pub error_backoff: Duration,

    /// Maximum time to wait for workflow tasks to stop during shutdown.
    /// Default: 30 seconds.
    pub shutdown_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            retry_policy: RetryPolicy::default(),
            step_timeout: Some(Duration::from_secs(30)),
            loops: LoopDefaults::default(),
            error_backoff: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Loop settings used when a [`LoopConfig`](crate::LoopConfig) leaves them unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopDefaults {
    /// Iterations between durable state commits. Default: 20.
    pub commit_interval: u64,
    /// Retain the entries of every N-th iteration. Default: 1.
    pub history_every: u64,
    /// Number of retained iterations kept. Default: 20.
    pub history_keep: u64,
}

impl Default for LoopDefaults {
    fn default() -> Self {
        Self {
            commit_interval: 20,
            history_every: 1,
            history_keep: 20,
        }
    }
}

//! Runtime for driving workflows.
//!
//! - [`WorkflowRuntime`] owns one task per workflow id and rejects a second
//!   spawn for an id it already drives.
//! - [`WorkflowHandle`] is the control surface handed to callers: messages,
//!   wake, evict, cancel, recover, and result queries.
//! - [`RuntimeConfig`] holds execution mode, retry and loop defaults, and
//!   shutdown behavior.
//!
//! Each task runs a pass, then parks until its wake time, a trigger from a
//! handle, cancellation, or shutdown.

mod config;
mod handle;
mod registry;
mod task;

pub use config::{LoopDefaults, RuntimeConfig};
pub use handle::WorkflowHandle;
pub use registry::WorkflowRuntime;

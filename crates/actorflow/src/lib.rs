//! Durable workflow execution by replaying recorded history.
//!
//! A workflow is ordinary async Rust that calls combinators on a
//! [`WorkflowContext`]: steps, loops, sleeps, message listens, joins and
//! races. Every combinator records an entry in the workflow's history, so a
//! workflow can be re-run from the top at any time and skip the work it has
//! already done:
//!
//! - **Exactly-once-effective steps**: a completed step returns its recorded
//!   output on replay without running its body again.
//! - **Durable waits**: sleeps, retry backoff, and message waits survive
//!   process restarts.
//! - **Two execution modes, one history**: [`ExecutionMode::Yield`] ends a
//!   pass at every suspension point, [`ExecutionMode::Live`] waits in place.
//!   Both write the same history for the same triggers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │ WorkflowRuntime ── one task per WorkflowId ── WorkflowHandle         │
//! │        │                                                             │
//! │        ▼                                                             │
//! │ WorkflowRunner::run_pass                                             │
//! │   1. Load record and history                                         │
//! │   2. Run Workflow::run with a WorkflowContext                        │
//! │   3. Combinators replay or extend history, commit in atomic batches  │
//! │   4. Persist the outcome: completed, failed, sleeping, or pending    │
//! └──────────────────────────────────────────────────────────────────────┘
//!                     │                          │
//!               StorageDriver              MessageDriver
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use actorflow::{Drivers, Result, RuntimeConfig, Workflow, WorkflowContext, WorkflowId, WorkflowRuntime};
//!
//! struct Reminder;
//!
//! impl Workflow for Reminder {
//!     type Input = String;
//!     type Output = bool;
//!
//!     const TYPE: &'static str = "reminder";
//!
//!     async fn run(&self, ctx: WorkflowContext, email: String) -> Result<bool> {
//!         ctx.sleep("wait-a-day", Duration::from_secs(86_400)).await?;
//!         let sent = ctx.step("send", |_| mailer::send(email.clone())).await?;
//!         Ok(sent)
//!     }
//! }
//!
//! let runtime = WorkflowRuntime::new(RuntimeConfig::default());
//! let handle = runtime
//!     .spawn(WorkflowId::new("reminder-1"), Reminder, "a@b.c".into(), Drivers::in_memory())
//!     .await?;
//! let sent = handle.result().await?;
//! ```
//!
//! # Feature Flags
//!
//! - `postgres`: enables [`PgDriver`], a storage and message driver on PostgreSQL.

mod abort;
mod context;
pub mod driver;
mod error;
pub mod history;
mod record;
mod retry;
mod runner;
pub mod runtime;
mod strategy;
mod workflow;

pub use abort::AbortSignal;
pub use context::{
    Branch, LoopConfig, LoopControl, RaceWinner, StepConfig, StepContext, WorkflowContext,
};
#[cfg(feature = "postgres")]
pub use driver::PgDriver;
pub use driver::{
    Drivers, KvWrite, MemoryMessages, MemoryStorage, Message, MessageDriver, MessageId,
    ReceiveRequest, StorageDriver,
};
pub use error::{BoxError, Error, ErrorRecord, Result, Suspension};
pub use history::{Entry, EntryKind, EntryMetadata, EntryStatus, EntryType, History, Location};
pub use record::WorkflowRecord;
pub use retry::RetryPolicy;
pub use runner::{PassOutcome, WorkflowRunner};
pub use runtime::{LoopDefaults, RuntimeConfig, WorkflowHandle, WorkflowRuntime};
pub use strategy::ExecutionMode;
pub use workflow::{Workflow, WorkflowId, WorkflowState};

//! Core workflow trait and identifiers.

use std::future::Future;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::context::WorkflowContext;
use crate::error::Result;

/// A durable procedure executed by replaying its history.
///
/// [`run`](Self::run) is re-executed from the top on every pass. Everything
/// that touches the outside world must go through the [`WorkflowContext`]
/// combinators so that completed work is memoized and not repeated. Code
/// outside combinators must be deterministic given the input and the values
/// the combinators return.
///
/// Errors returned by combinators must be propagated with `?`: suspensions
/// and evictions travel as [`Error::Suspended`](crate::Error::Suspended) and
/// end the pass without failing the workflow.
///
/// # Example
///
/// ```ignore
/// use actorflow::{Result, Workflow, WorkflowContext};
///
/// struct Onboarding;
///
/// impl Workflow for Onboarding {
///     type Input = String;
///     type Output = bool;
///
///     const TYPE: &'static str = "onboarding";
///
///     async fn run(&self, ctx: WorkflowContext, email: String) -> Result<bool> {
///         ctx.step("send-welcome", move |_| {
///             let email = email.clone();
///             async move { mailer::send(&email).await.map_err(actorflow::Error::other) }
///         })
///         .await?;
///
///         let confirmed: Option<()> = ctx
///             .listen_with_timeout("confirm", "confirmed", Duration::from_secs(86_400))
///             .await?;
///         Ok(confirmed.is_some())
///     }
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Input supplied when the workflow starts. Persisted with the workflow
    /// record so later passes replay with the same value.
    type Input: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Value produced when the workflow completes.
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Workflow type identifier. Used in logs and the persisted record.
    const TYPE: &'static str;

    /// The workflow body.
    fn run(
        &self,
        ctx: WorkflowContext,
        input: Self::Input,
    ) -> impl Future<Output = Result<Self::Output>> + Send;
}

/// A workflow instance identifier.
///
/// Hosts usually derive it from the owning actor's key.
///
/// # Example
///
/// ```
/// use actorflow::WorkflowId;
///
/// let id = WorkflowId::new("cart-42");
/// assert_eq!(id.as_str(), "cart-42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(String);

impl WorkflowId {
    /// Create a new workflow ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Consume the wrapper and return the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }

    /// Borrow the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<String> for WorkflowId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for WorkflowId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Lifecycle state of a workflow instance.
///
/// ```text
/// pending ──► running ──► sleeping ──► running ──► … ──► completed
///                │                                   └─► failed ──(recover)──► pending
///                └─(evicted)──► pending
/// any non-terminal state ──(cancel)──► cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Waiting for its next pass.
    Pending,
    /// A pass is executing.
    Running,
    /// Suspended until a wake time or a message.
    Sleeping,
    /// Finished with an output.
    Completed,
    /// Finished with an error. Exhausted steps can still be recovered.
    Failed,
    /// Cancelled by the host.
    Cancelled,
}

impl WorkflowState {
    /// Whether no further pass will run without external intervention.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }

    /// Whether the workflow can never run again.
    pub fn is_final(self) -> bool {
        matches!(self, WorkflowState::Completed | WorkflowState::Cancelled)
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            WorkflowState::Pending => "pending",
            WorkflowState::Running => "running",
            WorkflowState::Sleeping => "sleeping",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
            WorkflowState::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

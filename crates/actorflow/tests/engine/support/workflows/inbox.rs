//! Workflows waiting on messages.

use std::time::Duration;

use actorflow::{Result, Workflow, WorkflowContext};

/// Collects two notes in arrival order.
pub struct Inbox;

impl Workflow for Inbox {
    type Input = ();
    type Output = Vec<String>;

    const TYPE: &'static str = "inbox";

    async fn run(&self, ctx: WorkflowContext, _: ()) -> Result<Vec<String>> {
        ctx.listen_n("notes", "note", 2).await
    }
}

/// Waits a bounded time for a reply.
pub struct Reminder {
    pub patience: Duration,
}

impl Workflow for Reminder {
    type Input = ();
    type Output = Option<String>;

    const TYPE: &'static str = "reminder";

    async fn run(&self, ctx: WorkflowContext, _: ()) -> Result<Option<String>> {
        ctx.listen_with_timeout("reply", "reply", self.patience).await
    }
}

/// Sleeps for an hour, for exercising eviction and cancellation.
pub struct Sleeper;

impl Workflow for Sleeper {
    type Input = ();
    type Output = ();

    const TYPE: &'static str = "sleeper";

    async fn run(&self, ctx: WorkflowContext, _: ()) -> Result<()> {
        ctx.sleep("long-nap", Duration::from_secs(3600)).await
    }
}

//! A workflow mixing steps, a sleep, a join and a listen, for comparing
//! execution modes.

use std::time::Duration;

use actorflow::{Branch, Result, Workflow, WorkflowContext};

pub struct Errand;

impl Workflow for Errand {
    type Input = u32;
    type Output = u32;

    const TYPE: &'static str = "errand";

    async fn run(&self, ctx: WorkflowContext, base: u32) -> Result<u32> {
        let fetched = ctx.step("fetch", move |_| async move { Ok(base * 2) }).await?;
        ctx.sleep("cool-down", Duration::from_millis(20)).await?;

        let parts = ctx
            .join(
                "split",
                [
                    Branch::new("left", move |branch| async move {
                        branch.step("weigh", move |_| async move { Ok(fetched + 1) }).await
                    }),
                    Branch::new("right", move |branch| async move {
                        branch.step("weigh", move |_| async move { Ok(fetched + 2) }).await
                    }),
                ],
            )
            .await?;

        let weight: u32 = parts.iter().sum();

        let go: u32 = ctx.listen("approval", "go").await?;

        ctx.step("settle", move |_| async move { Ok(weight + go) })
            .await
    }
}

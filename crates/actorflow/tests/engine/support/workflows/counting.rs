//! Workflows that count how often their step bodies run.
//!
//! Supports testing:
//! - Replay skipping completed steps across passes
//! - Retry with backoff and exhaustion
//! - Loop resumption from the last committed state
//! - Divergence between code versions
//! - Resuming after an evicted pass

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use actorflow::{
    Error, LoopConfig, LoopControl, Result, StepConfig, Workflow, WorkflowContext,
};

#[derive(Debug, Default)]
pub struct Counter(AtomicU32);

impl Counter {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    /// Increment and return the new value.
    pub fn bump(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Keeps its first pass open until that pass is evicted, then finishes on
/// the next pass.
pub struct Watchman {
    pub steps: Arc<Counter>,
    pub saw_eviction: Arc<AtomicBool>,
}

impl Workflow for Watchman {
    type Input = u32;
    type Output = u32;

    const TYPE: &'static str = "watchman";

    async fn run(&self, ctx: WorkflowContext, input: u32) -> Result<u32> {
        let doubled = ctx
            .step("double", |_| {
                self.steps.bump();
                async move { Ok(input * 2) }
            })
            .await?;
        if !self.saw_eviction.load(Ordering::SeqCst) {
            while !ctx.is_evicted() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            self.saw_eviction.store(true, Ordering::SeqCst);
        }
        ctx.step("finish", |_| {
            self.steps.bump();
            async move { Ok(doubled + 1) }
        })
        .await
    }
}

/// Three steps separated by two naps. In yield mode it completes on the
/// third pass.
pub struct Napper {
    pub steps: Arc<Counter>,
    pub nap: Duration,
}

impl Workflow for Napper {
    type Input = u32;
    type Output = u32;

    const TYPE: &'static str = "napper";

    async fn run(&self, ctx: WorkflowContext, start: u32) -> Result<u32> {
        let first = ctx
            .step("first", |_| {
                self.steps.bump();
                async move { Ok(start + 1) }
            })
            .await?;
        ctx.sleep("nap-1", self.nap).await?;

        let second = ctx
            .step("second", |_| {
                self.steps.bump();
                async move { Ok(first * 2) }
            })
            .await?;
        ctx.sleep("nap-2", self.nap).await?;

        ctx.step("third", |_| {
            self.steps.bump();
            async move { Ok(second + 10) }
        })
        .await
    }
}

/// A step that fails its first `failures` attempts.
pub struct Flaky {
    pub attempts: Arc<Counter>,
    pub failures: u32,
}

impl Workflow for Flaky {
    type Input = ();
    type Output = u32;

    const TYPE: &'static str = "flaky";

    async fn run(&self, ctx: WorkflowContext, _: ()) -> Result<u32> {
        ctx.step("charge", |step| {
            let failing = self.attempts.bump() <= self.failures;
            async move {
                if failing {
                    return Err(Error::failed(format!("attempt {} declined", step.attempt())));
                }
                Ok(step.attempt())
            }
        })
        .await
    }
}

/// A step that fails until its upstream is marked healthy.
pub struct Outage {
    pub healthy: Arc<AtomicBool>,
    pub attempts: Arc<Counter>,
}

impl Workflow for Outage {
    type Input = ();
    type Output = String;

    const TYPE: &'static str = "outage";

    async fn run(&self, ctx: WorkflowContext, _: ()) -> Result<String> {
        let config = StepConfig::new("call-upstream").max_retries(2);
        ctx.step_with(config, |_| {
            self.attempts.bump();
            let healthy = self.healthy.load(Ordering::SeqCst);
            async move {
                if healthy {
                    Ok("pong".to_owned())
                } else {
                    Err(Error::failed("upstream unavailable"))
                }
            }
        })
        .await
    }
}

/// Sums `0..=last` in a loop that naps once, at iteration `nap_at`.
pub struct Summer {
    pub ticks: Arc<Counter>,
    pub bodies: Arc<Counter>,
    pub nap_at: u32,
    pub last: u32,
}

impl Workflow for Summer {
    type Input = ();
    type Output = u32;

    const TYPE: &'static str = "summer";

    async fn run(&self, ctx: WorkflowContext, _: ()) -> Result<u32> {
        ctx.run_loop_with(
            LoopConfig::new("sum").commit_interval(2),
            (0u32, 0u32),
            |iteration, (i, total)| async move {
                self.bodies.bump();
                let value = iteration
                    .step("tick", |_| {
                        self.ticks.bump();
                        async move { Ok(i) }
                    })
                    .await?;
                if i == self.nap_at {
                    iteration.sleep("nap", Duration::from_millis(20)).await?;
                }
                if i == self.last {
                    return Ok(LoopControl::Break(total + value));
                }
                Ok(LoopControl::Continue((i + 1, total + value)))
            },
        )
        .await
    }
}

/// First version of a checkout: charges, then waits to ship.
pub struct CheckoutV1;

impl Workflow for CheckoutV1 {
    type Input = ();
    type Output = ();

    const TYPE: &'static str = "checkout";

    async fn run(&self, ctx: WorkflowContext, _: ()) -> Result<()> {
        ctx.step("charge", |_| async { Ok(42u32) }).await?;
        ctx.sleep("ship", Duration::from_secs(3600)).await
    }
}

/// Second version that replaced the charge step with a sleep of the same
/// name without marking the step removed.
pub struct CheckoutV2;

impl Workflow for CheckoutV2 {
    type Input = ();
    type Output = ();

    const TYPE: &'static str = "checkout";

    async fn run(&self, ctx: WorkflowContext, _: ()) -> Result<()> {
        ctx.sleep("charge", Duration::from_millis(1)).await?;
        ctx.sleep("ship", Duration::from_secs(3600)).await
    }
}

/// Third version that marks the charge step removed.
pub struct CheckoutV3;

impl Workflow for CheckoutV3 {
    type Input = ();
    type Output = ();

    const TYPE: &'static str = "checkout";

    async fn run(&self, ctx: WorkflowContext, _: ()) -> Result<()> {
        ctx.removed("charge", actorflow::EntryType::Step).await?;
        ctx.sleep("ship", Duration::from_secs(3600)).await
    }
}

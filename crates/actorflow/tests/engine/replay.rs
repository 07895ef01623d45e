//! Replay, retry, loop, and divergence behavior across passes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use actorflow::{
    AbortSignal, EntryStatus, EntryType, Error, ErrorRecord, ExecutionMode, KvWrite, Result,
    RuntimeConfig, StepConfig, Workflow, WorkflowContext, WorkflowId, WorkflowRunner,
    WorkflowRuntime, WorkflowState,
};

use crate::support::helpers::{
    DEFAULT_TEST_TIMEOUT, init_test_tracing, load_history, load_record, memory_drivers,
    test_runtime_config,
};
use crate::support::workflows::counting::{
    CheckoutV1, CheckoutV2, CheckoutV3, Counter, Flaky, Napper, Outage, Summer,
};
use crate::support::workflows::errand::Errand;

#[tokio::test]
async fn completed_steps_run_once_across_passes() -> anyhow::Result<()> {
    init_test_tracing();
    let runtime = WorkflowRuntime::new(test_runtime_config(ExecutionMode::Yield));
    let (drivers, storage) = memory_drivers();
    let steps = Counter::new();
    let id = WorkflowId::new("napper-1");

    let handle = runtime
        .spawn(
            id.clone(),
            Napper {
                steps: steps.clone(),
                nap: Duration::from_millis(20),
            },
            5,
            drivers,
        )
        .await?;
    let output = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, handle.result()).await??;

    assert_eq!(output, 22);
    assert_eq!(steps.get(), 3);
    let record = load_record(&storage, &id).await?;
    assert_eq!(record.state, WorkflowState::Completed);
    assert_eq!(record.passes, 3);
    assert_eq!(storage.alarm(&id), None);

    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn failed_attempts_retry_with_backoff() -> anyhow::Result<()> {
    init_test_tracing();
    let runtime = WorkflowRuntime::new(test_runtime_config(ExecutionMode::Yield));
    let (drivers, storage) = memory_drivers();
    let attempts = Counter::new();
    let id = WorkflowId::new("flaky-1");

    let handle = runtime
        .spawn(
            id.clone(),
            Flaky {
                attempts: attempts.clone(),
                failures: 2,
            },
            (),
            drivers,
        )
        .await?;
    let succeeded_on = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, handle.result()).await??;

    assert_eq!(succeeded_on, 3);
    assert_eq!(attempts.get(), 3);
    let history = load_history(&storage, &id).await?;
    let meta = history.metadata("charge").expect("charge metadata");
    assert_eq!(meta.status, EntryStatus::Completed);
    // Failed attempts only.
    assert_eq!(meta.attempts, 2);

    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn exhausted_step_fails_until_recovered() -> anyhow::Result<()> {
    init_test_tracing();
    let runtime = WorkflowRuntime::new(test_runtime_config(ExecutionMode::Yield));
    let (drivers, storage) = memory_drivers();
    let healthy = Arc::new(AtomicBool::new(false));
    let attempts = Counter::new();
    let id = WorkflowId::new("outage-1");

    let handle = runtime
        .spawn(
            id.clone(),
            Outage {
                healthy: healthy.clone(),
                attempts: attempts.clone(),
            },
            (),
            drivers,
        )
        .await?;

    let err = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, handle.result())
        .await?
        .unwrap_err();
    assert!(
        matches!(&err, Error::StepExhausted { name, attempts: 2, .. } if name == "call-upstream"),
        "unexpected error: {err}"
    );
    assert_eq!(attempts.get(), 2);
    let record = load_record(&storage, &id).await?;
    assert_eq!(record.state, WorkflowState::Failed);
    assert_eq!(record.exhausted_entry.as_deref(), Some("call-upstream"));

    healthy.store(true, Ordering::SeqCst);
    handle.recover().await?;
    let output = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, handle.result()).await??;

    assert_eq!(output, "pong");
    assert_eq!(attempts.get(), 3);
    assert_eq!(load_record(&storage, &id).await?.error, None);

    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn loop_resumes_from_last_commit() -> anyhow::Result<()> {
    init_test_tracing();
    let runtime = WorkflowRuntime::new(test_runtime_config(ExecutionMode::Yield));
    let (drivers, _storage) = memory_drivers();
    let ticks = Counter::new();
    let bodies = Counter::new();

    let handle = runtime
        .spawn(
            WorkflowId::new("summer-1"),
            Summer {
                ticks: ticks.clone(),
                bodies: bodies.clone(),
                nap_at: 2,
                last: 4,
            },
            (),
            drivers,
        )
        .await?;
    let total = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, handle.result()).await??;

    assert_eq!(total, 10);
    // Each iteration's step ran once.
    assert_eq!(ticks.get(), 5);
    // The second pass resumed at the commit after iteration 1 and re-ran
    // iteration 2 before continuing.
    assert_eq!(bodies.get(), 6);

    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn changed_code_diverges_from_history() -> anyhow::Result<()> {
    let (drivers, storage) = memory_drivers();
    let config = RuntimeConfig::default();
    let id = WorkflowId::new("checkout-1");

    let v1 = WorkflowRunner::new(id.clone(), Arc::new(CheckoutV1), drivers.clone(), &config);
    v1.start(()).await?;
    let first = v1.run_pass(&AbortSignal::new()).await?;
    assert_eq!(first.state, WorkflowState::Sleeping);

    let v2 = WorkflowRunner::new(id.clone(), Arc::new(CheckoutV2), drivers, &config);
    let second = v2.run_pass(&AbortSignal::new()).await?;

    assert_eq!(second.state, WorkflowState::Failed);
    let record = load_record(&storage, &id).await?;
    assert!(
        matches!(&record.error, Some(ErrorRecord::HistoryDiverged { key, .. }) if key == "charge"),
        "unexpected error: {:?}",
        record.error
    );
    assert_eq!(storage.alarm(&id), None);
    Ok(())
}

#[tokio::test]
async fn removed_step_keeps_history_compatible() -> anyhow::Result<()> {
    let (drivers, storage) = memory_drivers();
    let config = RuntimeConfig::default();
    let id = WorkflowId::new("checkout-2");

    let v1 = WorkflowRunner::new(id.clone(), Arc::new(CheckoutV1), drivers.clone(), &config);
    v1.start(()).await?;
    v1.run_pass(&AbortSignal::new()).await?;

    let v3 = WorkflowRunner::new(id.clone(), Arc::new(CheckoutV3), drivers, &config);
    let outcome = v3.run_pass(&AbortSignal::new()).await?;

    assert_eq!(outcome.state, WorkflowState::Sleeping);
    let history = load_history(&storage, &id).await?;
    let charge = history.get("charge").expect("charge entry");
    assert_eq!(charge.entry_type(), EntryType::Removed);
    assert_eq!(history.get("ship").map(|e| e.entry_type()), Some(EntryType::Sleep));
    Ok(())
}

struct Batched;

impl Workflow for Batched {
    type Input = ();
    type Output = u32;

    const TYPE: &'static str = "batched";

    async fn run(&self, ctx: WorkflowContext, _: ()) -> Result<u32> {
        let a = ctx
            .step_with(StepConfig::new("a").ephemeral(), |_| async { Ok(1u32) })
            .await?;
        let b = ctx
            .step_with(StepConfig::new("b").ephemeral(), |_| async { Ok(2u32) })
            .await?;
        ctx.step("c", move |_| async move { Ok(a + b) }).await
    }
}

#[tokio::test]
async fn ephemeral_steps_commit_with_next_durable_write() -> anyhow::Result<()> {
    let (drivers, storage) = memory_drivers();
    let id = WorkflowId::new("batched-1");
    let runner = WorkflowRunner::new(
        id.clone(),
        Arc::new(Batched),
        drivers,
        &RuntimeConfig::default(),
    );
    runner.start(()).await?;

    let outcome = runner.run_pass(&AbortSignal::new()).await?;

    assert_eq!(outcome.state, WorkflowState::Completed);
    let entry_key = |name: &str| format!("workflow/{id}/entry/{name}");
    let batches = storage.batches();
    let writes_entry = |batch: &[KvWrite], name: &str| {
        batch.iter().any(|write| write.key() == entry_key(name))
    };
    let combined = batches
        .iter()
        .find(|batch| writes_entry(batch, "c"))
        .expect("batch writing step c");
    assert!(writes_entry(combined, "a"));
    assert!(writes_entry(combined, "b"));
    assert!(
        !batches
            .iter()
            .any(|batch| writes_entry(batch, "a") && !writes_entry(batch, "c")),
        "ephemeral step committed on its own"
    );
    Ok(())
}

/// Entry keys with their types and statuses, keyed for comparison.
async fn history_shape(
    mode: ExecutionMode,
) -> anyhow::Result<BTreeMap<String, (EntryType, Option<EntryStatus>)>> {
    let runtime = WorkflowRuntime::new(test_runtime_config(mode));
    let (drivers, storage) = memory_drivers();
    let id = WorkflowId::new("errand-1");

    let handle = runtime.spawn(id.clone(), Errand, 4, drivers).await?;
    handle.message("go", 100u32).await?;
    let output = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, handle.result()).await??;
    assert_eq!(output, 8 + 1 + 8 + 2 + 100);

    runtime.shutdown().await;
    let history = load_history(&storage, &id).await?;
    Ok(history
        .entries()
        .map(|entry| {
            let status = history.metadata(&entry.key).map(|meta| meta.status);
            (entry.key.clone(), (entry.entry_type(), status))
        })
        .collect())
}

#[tokio::test]
async fn yield_and_live_write_the_same_history() -> anyhow::Result<()> {
    init_test_tracing();

    let yielded = history_shape(ExecutionMode::Yield).await?;
    let live = history_shape(ExecutionMode::Live).await?;

    assert_eq!(yielded, live);
    assert_eq!(
        yielded.get("split").map(|(kind, _)| *kind),
        Some(EntryType::Join)
    );
    Ok(())
}

//! Task ownership, shutdown, and resumption across runtimes.

use std::time::Duration;

use actorflow::{Error, ExecutionMode, WorkflowId, WorkflowRuntime, WorkflowState};

use crate::support::helpers::{
    DEFAULT_POLL_INTERVAL, DEFAULT_TEST_TIMEOUT, flaky_drivers, init_test_tracing, load_record,
    memory_drivers, test_runtime_config, wait_until,
};
use crate::support::workflows::counting::{Counter, Napper};
use crate::support::workflows::inbox::Sleeper;

#[tokio::test]
async fn second_spawn_for_running_id_is_rejected() -> anyhow::Result<()> {
    let runtime = WorkflowRuntime::new(test_runtime_config(ExecutionMode::Yield));
    let (drivers, _storage) = memory_drivers();
    let id = WorkflowId::new("sleeper-4");

    let _handle = runtime.spawn(id.clone(), Sleeper, (), drivers.clone()).await?;
    let err = runtime.spawn(id.clone(), Sleeper, (), drivers).await.unwrap_err();

    assert!(matches!(err, Error::AlreadyRunning(ref rejected) if *rejected == id));
    assert!(runtime.is_running(&id).await);
    assert!(runtime.handle::<Sleeper>(&id).await.is_some());

    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_stops_tasks_and_rejects_spawns() -> anyhow::Result<()> {
    init_test_tracing();
    let runtime = WorkflowRuntime::new(test_runtime_config(ExecutionMode::Live));
    let (drivers, _storage) = memory_drivers();
    let id = WorkflowId::new("sleeper-5");

    let handle = runtime.spawn(id.clone(), Sleeper, (), drivers.clone()).await?;
    tokio::time::timeout(Duration::from_secs(2), runtime.shutdown()).await?;

    assert!(!runtime.is_running(&id).await);
    let err = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, handle.result())
        .await?
        .unwrap_err();
    assert!(matches!(err, Error::Stopped(_)), "unexpected error: {err}");
    let err = runtime.spawn(id, Sleeper, (), drivers).await.unwrap_err();
    assert!(matches!(err, Error::Stopped(_)), "unexpected error: {err}");
    Ok(())
}

#[tokio::test]
async fn new_runtime_resumes_with_persisted_input() -> anyhow::Result<()> {
    init_test_tracing();
    let (drivers, storage) = memory_drivers();
    let id = WorkflowId::new("napper-3");
    let nap = Duration::from_millis(200);

    let first = WorkflowRuntime::new(test_runtime_config(ExecutionMode::Yield));
    let first_steps = Counter::new();
    let napper = Napper {
        steps: first_steps.clone(),
        nap,
    };
    let handle = first.spawn(id.clone(), napper, 5, drivers.clone()).await?;
    wait_until(DEFAULT_TEST_TIMEOUT, DEFAULT_POLL_INTERVAL, || async {
        let state = handle.get_state().await?;
        Ok((state == WorkflowState::Sleeping).then_some(()))
    })
    .await?;
    first.shutdown().await;
    assert_eq!(first_steps.get(), 1);

    let second = WorkflowRuntime::new(test_runtime_config(ExecutionMode::Yield));
    let second_steps = Counter::new();
    let napper = Napper {
        steps: second_steps.clone(),
        nap,
    };
    let handle = second.spawn(id.clone(), napper, 100, drivers).await?;
    let output = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, handle.result()).await??;

    assert_eq!(output, 22);
    assert_eq!(second_steps.get(), 2);
    assert_eq!(load_record(&storage, &id).await?.input, serde_json::json!(5));

    second.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn failed_commit_is_retried_after_backoff() -> anyhow::Result<()> {
    init_test_tracing();
    let runtime = WorkflowRuntime::new(test_runtime_config(ExecutionMode::Live));
    let (drivers, storage) = flaky_drivers(1);
    let id = WorkflowId::new("napper-flaky");
    let napper = Napper {
        steps: Counter::new(),
        nap: Duration::from_millis(1),
    };
    let steps = std::sync::Arc::clone(&napper.steps);

    let handle = runtime.spawn(id.clone(), napper, 5, drivers).await?;
    let output = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, handle.result()).await??;

    assert_eq!(output, 22);
    let record = load_record(&storage, &id).await?;
    assert_eq!(record.state, WorkflowState::Completed);
    assert_eq!(record.passes, 2);
    assert_eq!(steps.get(), 4, "only the uncommitted step reruns");

    runtime.shutdown().await;
    Ok(())
}

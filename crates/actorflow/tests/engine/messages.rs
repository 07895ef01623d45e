//! Message delivery to listening workflows.

use std::time::Duration;

use actorflow::{ExecutionMode, WorkflowId, WorkflowRuntime};

use crate::support::helpers::{
    DEFAULT_TEST_TIMEOUT, init_test_tracing, load_history, memory_drivers, test_runtime_config,
};
use crate::support::workflows::inbox::{Inbox, Reminder};

#[tokio::test]
async fn listen_returns_messages_in_arrival_order() -> anyhow::Result<()> {
    init_test_tracing();
    let runtime = WorkflowRuntime::new(test_runtime_config(ExecutionMode::Yield));
    let (drivers, _storage) = memory_drivers();

    let handle = runtime
        .spawn(WorkflowId::new("inbox-1"), Inbox, (), drivers)
        .await?;
    handle.message("note", "a").await?;
    handle.message("unrelated", "x").await?;
    handle.message("note", "b").await?;
    let notes = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, handle.result()).await??;

    assert_eq!(notes, vec!["a".to_owned(), "b".to_owned()]);

    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn live_listen_collects_across_deliveries() -> anyhow::Result<()> {
    let runtime = WorkflowRuntime::new(test_runtime_config(ExecutionMode::Live));
    let (drivers, _storage) = memory_drivers();

    let handle = runtime
        .spawn(WorkflowId::new("inbox-2"), Inbox, (), drivers)
        .await?;
    handle.message("note", "first").await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.message("note", "second").await?;
    let notes = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, handle.result()).await??;

    assert_eq!(notes, vec!["first".to_owned(), "second".to_owned()]);

    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn send_and_wait_resolves_once_consumed() -> anyhow::Result<()> {
    let runtime = WorkflowRuntime::new(test_runtime_config(ExecutionMode::Yield));
    let (drivers, storage) = memory_drivers();
    let id = WorkflowId::new("inbox-3");

    let handle = runtime.spawn(id.clone(), Inbox, (), drivers).await?;
    let response =
        tokio::time::timeout(DEFAULT_TEST_TIMEOUT, handle.send_and_wait("note", "a")).await??;

    assert_eq!(response, None);
    // The message is recorded before its sender is released.
    let history = load_history(&storage, &id).await?;
    assert!(history.get("notes").is_some());

    handle.message("note", "b").await?;
    let notes = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, handle.result()).await??;
    assert_eq!(notes.len(), 2);

    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn listen_times_out_with_none() -> anyhow::Result<()> {
    init_test_tracing();
    let runtime = WorkflowRuntime::new(test_runtime_config(ExecutionMode::Yield));
    let (drivers, _storage) = memory_drivers();
    let reminder = Reminder {
        patience: Duration::from_millis(50),
    };

    let handle = runtime
        .spawn(WorkflowId::new("reminder-1"), reminder, (), drivers)
        .await?;
    let reply = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, handle.result()).await??;

    assert_eq!(reply, None);

    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn reply_before_timeout_is_returned() -> anyhow::Result<()> {
    let runtime = WorkflowRuntime::new(test_runtime_config(ExecutionMode::Live));
    let (drivers, _storage) = memory_drivers();
    let reminder = Reminder {
        patience: Duration::from_secs(30),
    };

    let handle = runtime
        .spawn(WorkflowId::new("reminder-2"), reminder, (), drivers)
        .await?;
    handle.message("reply", "on my way").await?;
    let reply = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, handle.result()).await??;

    assert_eq!(reply.as_deref(), Some("on my way"));

    runtime.shutdown().await;
    Ok(())
}

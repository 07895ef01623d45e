//! Storage and message contracts of `PgDriver`.

use std::time::Duration;

use actorflow::{
    KvWrite, Message, MessageDriver, MessageId, ReceiveRequest, StorageDriver, WorkflowId,
};
use serde_json::json;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::support::db::db_test;
use crate::support::helpers::driver;

fn request(names: &[&str], count: usize, completable: bool) -> ReceiveRequest {
    ReceiveRequest {
        names: Some(names.iter().map(|n| n.to_string()).collect()),
        count,
        completable,
    }
}

db_test!(batch_applies_writes_in_order, |pool| {
    let storage = driver(pool, "ns");
    storage.set("wf/a/1", b"old".to_vec()).await?;

    storage
        .batch(vec![
            KvWrite::DeletePrefix {
                prefix: "wf/a/".into(),
            },
            KvWrite::Set {
                key: "wf/a/2".into(),
                value: b"new".to_vec(),
            },
        ])
        .await?;

    let listed = storage.list("wf/a/").await?;
    assert_eq!(listed, vec![("wf/a/2".to_string(), b"new".to_vec())]);
    Ok(())
});

db_test!(failed_batch_leaves_nothing_behind, |pool| {
    let storage = driver(pool, "ns");
    storage.set("wf/b/kept", b"before".to_vec()).await?;

    // Text columns reject NUL bytes, so the second write fails.
    let result = storage
        .batch(vec![
            KvWrite::Set {
                key: "wf/b/kept".into(),
                value: b"after".to_vec(),
            },
            KvWrite::Set {
                key: "wf/b/\0bad".into(),
                value: vec![1],
            },
        ])
        .await;

    assert!(result.is_err());
    assert_eq!(storage.get("wf/b/kept").await?, Some(b"before".to_vec()));
    assert_eq!(storage.list("wf/b/").await?.len(), 1);
    Ok(())
});

db_test!(prefixes_match_literally, |pool| {
    let storage = driver(pool, "ns");
    for key in ["a_/1", "ab/1", "a%/1", "a_/2"] {
        storage.set(key, key.as_bytes().to_vec()).await?;
    }

    let keys: Vec<_> = storage
        .list("a_/")
        .await?
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(keys, vec!["a_/1", "a_/2"]);

    storage.delete_prefix("a%").await?;
    assert!(storage.get("a%/1").await?.is_none());
    assert!(storage.get("ab/1").await?.is_some());
    assert!(storage.get("a_/1").await?.is_some());
    Ok(())
});

db_test!(namespaces_do_not_share_rows, |pool| {
    let left = driver(pool, "left");
    let right = driver(pool, "right");

    left.set("record", vec![1]).await?;
    left.add_message(Message::new("ping", json!(1)), None).await?;

    assert!(right.get("record").await?.is_none());
    assert!(right.load_messages().await?.is_empty());
    assert_eq!(left.load_messages().await?.len(), 1);
    Ok(())
});

db_test!(receive_is_fifo_per_name, |pool| {
    let messages = driver(pool, "ns");
    for (name, n) in [("tick", 1), ("other", 2), ("tick", 3), ("tick", 4)] {
        messages.add_message(Message::new(name, json!(n)), None).await?;
    }

    let received = messages.receive_messages(request(&["tick"], 2, false)).await?;
    let data: Vec<_> = received.iter().map(|m| m.data.clone()).collect();
    assert_eq!(data, vec![json!(1), json!(3)]);

    let rest: Vec<_> = messages
        .load_messages()
        .await?
        .into_iter()
        .map(|m| m.data)
        .collect();
    assert_eq!(rest, vec![json!(2), json!(4)]);
    Ok(())
});

db_test!(completable_receive_hides_until_reload, |pool| {
    let messages = driver(pool, "ns");
    messages.add_message(Message::new("job", json!("a")), None).await?;

    let first = messages.receive_messages(request(&["job"], 1, true)).await?;
    assert_eq!(first.len(), 1);
    let hidden = messages.receive_messages(request(&["job"], 1, true)).await?;
    assert!(hidden.is_empty());

    assert_eq!(messages.load_messages().await?.len(), 1);
    let again = messages.receive_messages(request(&["job"], 1, true)).await?;
    assert_eq!(again[0].id, first[0].id);
    Ok(())
});

db_test!(concurrent_receives_claim_distinct_messages, |pool| {
    let messages = driver(pool, "ns");
    for n in 0..2 {
        messages.add_message(Message::new("job", json!(n)), None).await?;
    }

    let (a, b) = tokio::join!(
        messages.receive_messages(request(&["job"], 1, true)),
        messages.receive_messages(request(&["job"], 1, true)),
    );
    let (a, b) = (a?, b?);

    assert_eq!(a.len() + b.len(), 2);
    assert_ne!(a[0].id, b[0].id);
    Ok(())
});

db_test!(completion_answers_sender, |pool| {
    let messages = driver(pool, "ns");
    let (tx, rx) = tokio::sync::oneshot::channel();
    let message = Message::new("ask", json!({}));
    let id = message.id;
    messages.add_message(message, Some(tx)).await?;

    let received = messages.receive_messages(request(&["ask"], 1, true)).await?;
    assert_eq!(received[0].id, id);
    messages.complete_message(id, Some(json!("answer"))).await?;

    assert_eq!(rx.await?, Some(json!("answer")));
    assert!(messages.load_messages().await?.is_empty());
    Ok(())
});

db_test!(delete_reports_only_queued_ids, |pool| {
    let messages = driver(pool, "ns");
    let message = Message::new("x", json!(null));
    let id = message.id;
    messages.add_message(message, None).await?;

    assert_eq!(messages.delete_messages(&[id, MessageId::new()]).await?, vec![id]);
    assert!(messages.delete_messages(&[id]).await?.is_empty());
    Ok(())
});

db_test!(wait_wakes_on_matching_arrival, |pool| {
    let messages = driver(pool, "ns");
    let names = vec!["go".to_string()];

    let waiting = messages.wait_for_messages(Some(&names), CancellationToken::new());
    let sending = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        messages.add_message(Message::new("ignored", json!(null)), None).await?;
        tokio::time::sleep(Duration::from_millis(30)).await;
        messages.add_message(Message::new("go", json!(null)), None).await
    };

    let (waited, sent) = tokio::time::timeout(Duration::from_secs(2), async {
        tokio::join!(waiting, sending)
    })
    .await?;
    waited?;
    sent?;
    Ok(())
});

db_test!(wait_returns_on_abort, |pool| {
    let messages = driver(pool, "ns");
    let abort = CancellationToken::new();
    abort.cancel();

    tokio::time::timeout(Duration::from_secs(1), messages.wait_for_messages(None, abort))
        .await??;
    Ok(())
});

db_test!(alarm_is_replaced_and_cleared, |pool| {
    let storage = driver(pool, "ns");
    let id = WorkflowId::new("wf-1");
    let now = OffsetDateTime::now_utc();

    storage.set_alarm(&id, now + Duration::from_secs(3600)).await?;
    assert!(storage.due_alarms(now).await?.is_empty());

    storage.set_alarm(&id, now - Duration::from_secs(1)).await?;
    assert_eq!(storage.due_alarms(now).await?, vec![id.clone()]);

    storage.clear_alarm(&id).await?;
    assert!(storage.due_alarms(now).await?.is_empty());
    Ok(())
});

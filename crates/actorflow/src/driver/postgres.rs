//! PostgreSQL drivers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use sqlx::{PgExecutor, PgPool};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{
    CompletionSender, KvWrite, Message, MessageDriver, MessageId, ReceiveRequest, StorageDriver,
};
use crate::error::{Error, Result};
use crate::workflow::WorkflowId;

/// PostgreSQL implementation of both driver contracts.
///
/// Every row carries a `namespace`, so one database can serve many hosts.
/// The message queue belongs to the namespace: give each workflow its own
/// namespace (the owning actor's key is a natural choice) and share the pool.
///
/// # Database Schema
///
/// Tables in the `actorflow` schema, created by [`PgDriver::migrate`]:
///
/// | Table      | Purpose                                         |
/// |------------|-------------------------------------------------|
/// | `kv`       | Workflow records and history entries            |
/// | `alarms`   | One wake-up time per workflow                   |
/// | `messages` | FIFO message queue with completable receives    |
///
/// Completion callbacks of [`MessageDriver::add_message`] live in process:
/// after a restart, senders waiting on them observe a dropped channel.
///
/// # Example
///
/// ```ignore
/// use actorflow::{Drivers, PgDriver};
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://...").await?;
/// let driver = PgDriver::new(pool, "cart-42");
/// driver.migrate().await?;
/// let drivers = driver.drivers();
/// ```
#[derive(Clone)]
pub struct PgDriver {
    pool: PgPool,
    namespace: String,
    poll_interval: Duration,
    completions: Arc<Mutex<HashMap<MessageId, CompletionSender>>>,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    seq: i64,
    name: String,
    data: Value,
    sent_at: OffsetDateTime,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            id: MessageId::from_uuid(row.id),
            name: row.name,
            data: row.data,
            sent_at: row.sent_at,
        }
    }
}

fn into_messages(mut rows: Vec<MessageRow>) -> Vec<Message> {
    rows.sort_by_key(|row| row.seq);
    rows.into_iter().map(Message::from).collect()
}

impl PgDriver {
    pub fn new(pool: PgPool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
            poll_interval: Duration::from_millis(100),
            completions: Arc::default(),
        }
    }

    /// How often [`MessageDriver::wait_for_messages`] polls the queue.
    /// Default: 100ms.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Apply the bundled migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(Error::storage)
    }

    /// Both contracts backed by this driver.
    pub fn drivers(&self) -> super::Drivers {
        super::Drivers::new(Arc::new(self.clone()), Arc::new(self.clone()))
    }

    /// Workflows whose alarm is due, earliest first.
    pub async fn due_alarms(&self, now: OffsetDateTime) -> Result<Vec<WorkflowId>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"SELECT workflow_id FROM actorflow.alarms
               WHERE namespace = $1 AND wake_at <= $2
               ORDER BY wake_at"#,
        )
        .bind(&self.namespace)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(WorkflowId::from).collect())
    }

    async fn apply<'e>(&self, executor: impl PgExecutor<'e>, write: &KvWrite) -> Result<()> {
        match write {
            KvWrite::Set { key, value } => {
                sqlx::query(
                    r#"INSERT INTO actorflow.kv (namespace, key, value)
                       VALUES ($1, $2, $3)
                       ON CONFLICT (namespace, key) DO UPDATE SET value = EXCLUDED.value"#,
                )
                .bind(&self.namespace)
                .bind(key)
                .bind(value)
                .execute(executor)
                .await?;
            }
            KvWrite::Delete { key } => {
                sqlx::query("DELETE FROM actorflow.kv WHERE namespace = $1 AND key = $2")
                    .bind(&self.namespace)
                    .bind(key)
                    .execute(executor)
                    .await?;
            }
            KvWrite::DeletePrefix { prefix } => {
                sqlx::query(
                    "DELETE FROM actorflow.kv WHERE namespace = $1 AND starts_with(key, $2)",
                )
                .bind(&self.namespace)
                .bind(prefix)
                .execute(executor)
                .await?;
            }
        }
        Ok(())
    }

    async fn has_visible(&self, names: Option<&[String]>) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"SELECT EXISTS (
                   SELECT 1 FROM actorflow.messages
                   WHERE namespace = $1 AND NOT in_flight
                     AND ($2::text[] IS NULL OR name = ANY($2))
               )"#,
        )
        .bind(&self.namespace)
        .bind(names)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

impl std::fmt::Debug for PgDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgDriver")
            .field("namespace", &self.namespace)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StorageDriver for PgDriver {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = sqlx::query_scalar(
            "SELECT value FROM actorflow.kv WHERE namespace = $1 AND key = $2",
        )
        .bind(&self.namespace)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let write = KvWrite::Set {
            key: key.to_owned(),
            value,
        };
        self.apply(&self.pool, &write).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let write = KvWrite::Delete {
            key: key.to_owned(),
        };
        self.apply(&self.pool, &write).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let write = KvWrite::DeletePrefix {
            prefix: prefix.to_owned(),
        };
        self.apply(&self.pool, &write).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let rows = sqlx::query_as::<_, (String, Vec<u8>)>(
            r#"SELECT key, value FROM actorflow.kv
               WHERE namespace = $1 AND starts_with(key, $2)
               ORDER BY key COLLATE "C""#,
        )
        .bind(&self.namespace)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    #[instrument(skip(self, writes), fields(namespace = %self.namespace, writes = writes.len()))]
    async fn batch(&self, writes: Vec<KvWrite>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for write in &writes {
            self.apply(&mut *tx, write).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn set_alarm(&self, workflow_id: &WorkflowId, wake_at: OffsetDateTime) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO actorflow.alarms (namespace, workflow_id, wake_at)
               VALUES ($1, $2, $3)
               ON CONFLICT (namespace, workflow_id) DO UPDATE SET wake_at = EXCLUDED.wake_at"#,
        )
        .bind(&self.namespace)
        .bind(workflow_id.as_str())
        .bind(wake_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_alarm(&self, workflow_id: &WorkflowId) -> Result<()> {
        sqlx::query("DELETE FROM actorflow.alarms WHERE namespace = $1 AND workflow_id = $2")
            .bind(&self.namespace)
            .bind(workflow_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MessageDriver for PgDriver {
    async fn load_messages(&self) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"UPDATE actorflow.messages SET in_flight = FALSE
               WHERE namespace = $1
               RETURNING id, seq, name, data, sent_at"#,
        )
        .bind(&self.namespace)
        .fetch_all(&self.pool)
        .await?;
        Ok(into_messages(rows))
    }

    #[instrument(skip(self, message, on_complete), fields(message_id = %message.id, name = %message.name))]
    async fn add_message(
        &self,
        message: Message,
        on_complete: Option<CompletionSender>,
    ) -> Result<()> {
        if let Some(sender) = on_complete {
            self.completions.lock().insert(message.id, sender);
        }
        let inserted = sqlx::query(
            r#"INSERT INTO actorflow.messages (namespace, id, name, data, sent_at)
               VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(&self.namespace)
        .bind(message.id.as_uuid())
        .bind(&message.name)
        .bind(&message.data)
        .bind(message.sent_at)
        .execute(&self.pool)
        .await;
        if let Err(error) = inserted {
            self.completions.lock().remove(&message.id);
            return Err(error.into());
        }
        Ok(())
    }

    async fn receive_messages(&self, request: ReceiveRequest) -> Result<Vec<Message>> {
        let claim = if request.completable {
            r#"UPDATE actorflow.messages SET in_flight = TRUE
               WHERE namespace = $1 AND id IN (
                   SELECT id FROM actorflow.messages
                   WHERE namespace = $1 AND NOT in_flight
                     AND ($2::text[] IS NULL OR name = ANY($2))
                   ORDER BY seq
                   LIMIT $3
                   FOR UPDATE SKIP LOCKED
               )
               RETURNING id, seq, name, data, sent_at"#
        } else {
            r#"DELETE FROM actorflow.messages
               WHERE namespace = $1 AND id IN (
                   SELECT id FROM actorflow.messages
                   WHERE namespace = $1 AND NOT in_flight
                     AND ($2::text[] IS NULL OR name = ANY($2))
                   ORDER BY seq
                   LIMIT $3
                   FOR UPDATE SKIP LOCKED
               )
               RETURNING id, seq, name, data, sent_at"#
        };
        let rows = sqlx::query_as::<_, MessageRow>(claim)
            .bind(&self.namespace)
            .bind(request.names.as_deref())
            .bind(i64::try_from(request.count).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        debug!(namespace = %self.namespace, received = rows.len(), "messages received");
        Ok(into_messages(rows))
    }

    async fn delete_messages(&self, ids: &[MessageId]) -> Result<Vec<MessageId>> {
        let uuids: Vec<Uuid> = ids.iter().map(MessageId::as_uuid).collect();
        let deleted: Vec<Uuid> = sqlx::query_scalar(
            r#"DELETE FROM actorflow.messages
               WHERE namespace = $1 AND id = ANY($2)
               RETURNING id"#,
        )
        .bind(&self.namespace)
        .bind(&uuids)
        .fetch_all(&self.pool)
        .await?;

        let mut completions = self.completions.lock();
        for id in ids {
            if let Some(sender) = completions.remove(id) {
                let _ = sender.send(None);
            }
        }
        Ok(deleted.into_iter().map(MessageId::from_uuid).collect())
    }

    #[instrument(skip(self, response), fields(namespace = %self.namespace))]
    async fn complete_message(&self, id: MessageId, response: Option<Value>) -> Result<()> {
        sqlx::query("DELETE FROM actorflow.messages WHERE namespace = $1 AND id = $2")
            .bind(&self.namespace)
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        if let Some(sender) = self.completions.lock().remove(&id) {
            let _ = sender.send(response);
        }
        Ok(())
    }

    async fn wait_for_messages(
        &self,
        names: Option<&[String]>,
        abort: CancellationToken,
    ) -> Result<()> {
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if self.has_visible(names).await? {
                        return Ok(());
                    }
                }
                _ = abort.cancelled() => return Ok(()),
            }
        }
    }
}

//! Waiting for queued messages.

use std::time::Duration;

use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use tracing::debug;

use super::{WorkflowContext, recorded_failure};
use crate::driver::{Message, ReceiveRequest};
use crate::error::{Error, Result};
use crate::history::{EntryKind, EntryMetadata, EntryType};

enum Deadline {
    Never,
    At(OffsetDateTime),
    After(Duration),
}

impl Deadline {
    fn resolve(self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        match self {
            Deadline::Never => None,
            Deadline::At(at) => Some(at),
            Deadline::After(timeout) => Some(now + timeout),
        }
    }
}

impl WorkflowContext {
    /// Wait for one `message` and decode its payload.
    pub async fn listen<T: DeserializeOwned>(&self, name: &str, message: &str) -> Result<T> {
        let mut received = self
            .collect(name, vec![message.to_owned()], 1, Deadline::Never)
            .await?;
        let first = received
            .pop()
            .ok_or_else(|| Error::diverged(name, "listen completed without a message"))?;
        Ok(serde_json::from_value(first.data)?)
    }

    /// Wait for `count` `message`s, returned in arrival order.
    pub async fn listen_n<T: DeserializeOwned>(
        &self,
        name: &str,
        message: &str,
        count: usize,
    ) -> Result<Vec<T>> {
        let received = self
            .collect(name, vec![message.to_owned()], count, Deadline::Never)
            .await?;
        decode_all(received)
    }

    /// Wait for one `message` until `deadline`. Returns `None` on timeout.
    pub async fn listen_until<T: DeserializeOwned>(
        &self,
        name: &str,
        message: &str,
        deadline: OffsetDateTime,
    ) -> Result<Option<T>> {
        let received = self
            .collect(name, vec![message.to_owned()], 1, Deadline::At(deadline))
            .await?;
        Ok(decode_all(received)?.pop())
    }

    /// Wait for one `message` for at most `timeout`, measured from the first
    /// time this entry is reached. Returns `None` on timeout.
    pub async fn listen_with_timeout<T: DeserializeOwned>(
        &self,
        name: &str,
        message: &str,
        timeout: Duration,
    ) -> Result<Option<T>> {
        let received = self
            .collect(name, vec![message.to_owned()], 1, Deadline::After(timeout))
            .await?;
        Ok(decode_all(received)?.pop())
    }

    /// Wait for up to `count` `message`s until `deadline`. Returns whatever
    /// arrived, possibly nothing.
    pub async fn listen_n_until<T: DeserializeOwned>(
        &self,
        name: &str,
        message: &str,
        count: usize,
        deadline: OffsetDateTime,
    ) -> Result<Vec<T>> {
        let received = self
            .collect(name, vec![message.to_owned()], count, Deadline::At(deadline))
            .await?;
        decode_all(received)
    }

    /// Wait for up to `count` `message`s for at most `timeout`. Returns
    /// whatever arrived, possibly nothing.
    pub async fn listen_n_with_timeout<T: DeserializeOwned>(
        &self,
        name: &str,
        message: &str,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<T>> {
        let received = self
            .collect(
                name,
                vec![message.to_owned()],
                count,
                Deadline::After(timeout),
            )
            .await?;
        decode_all(received)
    }

    /// Wait for the first message with any of `messages` names.
    pub async fn listen_any(&self, name: &str, messages: &[&str]) -> Result<Message> {
        let names = messages.iter().map(|m| (*m).to_owned()).collect();
        let mut received = self.collect(name, names, 1, Deadline::Never).await?;
        received
            .pop()
            .ok_or_else(|| Error::diverged(name, "listen completed without a message"))
    }

    /// Shared implementation of the listen family.
    ///
    /// Received messages are recorded in the entry and committed before they
    /// are completed in the driver. Replays delete recorded messages that a
    /// crash may have left queued.
    async fn collect(
        &self,
        name: &str,
        names: Vec<String>,
        count: usize,
        deadline: Deadline,
    ) -> Result<Vec<Message>> {
        self.check_evicted()?;
        let claim = self.claim(name, EntryType::Listen)?;
        let key = claim.key.clone();
        let messages = &self.shared.messages;

        let (mut entry, mut meta) = match &claim.existing {
            Some((entry, meta)) => {
                if let Some(error) = recorded_failure(&key, meta) {
                    return Err(error);
                }
                let EntryKind::Listen {
                    names: recorded, ..
                } = &entry.kind
                else {
                    return Err(Error::diverged(&key, "recorded entry is not a listen"));
                };
                if *recorded != names {
                    return Err(Error::diverged(
                        &key,
                        format!("recorded listening for {recorded:?}, replayed for {names:?}"),
                    ));
                }
                (entry.clone(), meta.clone())
            }
            None => {
                let deadline = deadline.resolve(OffsetDateTime::now_utc());
                let entry = self.new_entry(
                    name,
                    &claim,
                    EntryKind::Listen {
                        names: names.clone(),
                        count,
                        deadline,
                        messages: Vec::new(),
                    },
                );
                let meta = EntryMetadata::default();
                self.insert_entry(entry.clone(), meta.clone())?;
                if deadline.is_some() {
                    self.shared.flush().await?;
                }
                (entry, meta)
            }
        };

        let (count, deadline, mut collected) = match &entry.kind {
            EntryKind::Listen {
                count,
                deadline,
                messages,
                ..
            } => (*count, *deadline, messages.clone()),
            _ => return Err(Error::diverged(&key, "recorded entry is not a listen")),
        };

        if !collected.is_empty() {
            let ids: Vec<_> = collected.iter().map(|m| m.id).collect();
            let stale = messages.delete_messages(&ids).await?;
            if !stale.is_empty() {
                debug!(
                    workflow_id = %self.shared.workflow_id,
                    entry = %key,
                    removed = stale.len(),
                    "removed recorded messages left in queue"
                );
            }
        }
        if meta.is_completed() {
            return Ok(collected);
        }

        loop {
            if collected.len() < count {
                let received = messages
                    .receive_messages(ReceiveRequest {
                        names: Some(names.clone()),
                        count: count - collected.len(),
                        completable: true,
                    })
                    .await?;

                if !received.is_empty() {
                    collected.extend(received.iter().cloned());
                    entry.kind = EntryKind::Listen {
                        names: names.clone(),
                        count,
                        deadline,
                        messages: collected.clone(),
                    };
                    let done = collected.len() >= count;
                    if done {
                        meta.complete()?;
                    }
                    self.update_entry(entry.clone(), done.then(|| meta.clone()))?;
                    self.shared.flush().await?;

                    for message in &received {
                        messages.complete_message(message.id, None).await?;
                    }
                    debug!(
                        workflow_id = %self.shared.workflow_id,
                        entry = %key,
                        received = received.len(),
                        collected = collected.len(),
                        count,
                        "messages recorded"
                    );
                    if done {
                        return Ok(collected);
                    }
                }
            }

            if collected.len() >= count {
                meta.complete()?;
                self.update_metadata(&key, meta)?;
                return Ok(collected);
            }

            if deadline.is_some_and(|deadline| OffsetDateTime::now_utc() >= deadline) {
                debug!(
                    workflow_id = %self.shared.workflow_id,
                    entry = %key,
                    collected = collected.len(),
                    "listen deadline passed"
                );
                meta.complete()?;
                self.update_metadata(&key, meta)?;
                return Ok(collected);
            }

            self.shared
                .strategy
                .await_messages(&self.shared.signal, &**messages, &names, deadline)
                .await?;
            self.check_evicted()?;
        }
    }
}

fn decode_all<T: DeserializeOwned>(messages: Vec<Message>) -> Result<Vec<T>> {
    messages
        .into_iter()
        .map(|message| Ok(serde_json::from_value(message.data)?))
        .collect()
}

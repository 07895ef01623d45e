//! In-memory drivers.
//!
//! For tests and hosts that keep workflow state in process. Storage records
//! every committed batch so tests can assert on commit boundaries.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::{
    CompletionSender, KvWrite, Message, MessageDriver, MessageId, ReceiveRequest, StorageDriver,
    matches_names,
};
use crate::error::Result;
use crate::workflow::WorkflowId;

#[derive(Default)]
struct StorageData {
    values: BTreeMap<String, Vec<u8>>,
    alarms: HashMap<WorkflowId, OffsetDateTime>,
    batches: Vec<Vec<KvWrite>>,
}

impl StorageData {
    fn apply(&mut self, write: KvWrite) {
        match write {
            KvWrite::Set { key, value } => {
                self.values.insert(key, value);
            }
            KvWrite::Delete { key } => {
                self.values.remove(&key);
            }
            KvWrite::DeletePrefix { prefix } => {
                self.values.retain(|key, _| !key.starts_with(&prefix));
            }
        }
    }
}

/// In-memory [`StorageDriver`].
///
/// Keys of all workflows share one ordered map; the engine namespaces them
/// per workflow id.
#[derive(Default)]
pub struct MemoryStorage {
    data: RwLock<StorageData>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every batch committed so far, oldest first.
    pub fn batches(&self) -> Vec<Vec<KvWrite>> {
        self.data.read().batches.clone()
    }

    /// Keys currently stored under `prefix`.
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.data
            .read()
            .values
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// The pending alarm for a workflow.
    pub fn alarm(&self, workflow_id: &WorkflowId) -> Option<OffsetDateTime> {
        self.data.read().alarms.get(workflow_id).copied()
    }
}

#[async_trait]
impl StorageDriver for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().values.get(key).cloned())
    }

    #[instrument(skip(self, value), fields(value_len = value.len()))]
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.data.write().values.insert(key.to_owned(), value);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<()> {
        self.data.write().values.remove(key);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.data
            .write()
            .apply(KvWrite::DeletePrefix {
                prefix: prefix.to_owned(),
            });
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let data = self.data.read();
        Ok(data
            .values
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    #[instrument(skip(self, writes), fields(writes = writes.len()))]
    async fn batch(&self, writes: Vec<KvWrite>) -> Result<()> {
        let mut data = self.data.write();
        data.batches.push(writes.clone());
        for write in writes {
            data.apply(write);
        }
        Ok(())
    }

    async fn set_alarm(&self, workflow_id: &WorkflowId, wake_at: OffsetDateTime) -> Result<()> {
        self.data.write().alarms.insert(workflow_id.clone(), wake_at);
        Ok(())
    }

    async fn clear_alarm(&self, workflow_id: &WorkflowId) -> Result<()> {
        self.data.write().alarms.remove(workflow_id);
        Ok(())
    }
}

struct Queued {
    message: Message,
    in_flight: bool,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Queued>,
    completions: HashMap<MessageId, CompletionSender>,
}

impl QueueState {
    fn has_visible(&self, names: Option<&[String]>) -> bool {
        self.queue
            .iter()
            .any(|queued| !queued.in_flight && matches_names(names, &queued.message.name))
    }

    fn remove(&mut self, id: MessageId) -> Option<Message> {
        let index = self.queue.iter().position(|q| q.message.id == id)?;
        self.queue.remove(index).map(|queued| queued.message)
    }
}

/// In-memory [`MessageDriver`] for a single workflow.
#[derive(Default)]
pub struct MemoryMessages {
    state: Mutex<QueueState>,
    arrivals: Notify,
}

impl MemoryMessages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages still queued, including received-but-uncompleted ones.
    pub fn queued(&self) -> Vec<Message> {
        self.state
            .lock()
            .queue
            .iter()
            .map(|queued| queued.message.clone())
            .collect()
    }
}

#[async_trait]
impl MessageDriver for MemoryMessages {
    async fn load_messages(&self) -> Result<Vec<Message>> {
        let mut state = self.state.lock();
        for queued in state.queue.iter_mut() {
            queued.in_flight = false;
        }
        Ok(state.queue.iter().map(|q| q.message.clone()).collect())
    }

    #[instrument(skip(self, message, on_complete), fields(message_id = %message.id, name = %message.name))]
    async fn add_message(
        &self,
        message: Message,
        on_complete: Option<CompletionSender>,
    ) -> Result<()> {
        {
            let mut state = self.state.lock();
            if let Some(sender) = on_complete {
                state.completions.insert(message.id, sender);
            }
            state.queue.push_back(Queued {
                message,
                in_flight: false,
            });
        }
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn receive_messages(&self, request: ReceiveRequest) -> Result<Vec<Message>> {
        let mut state = self.state.lock();
        let names = request.names.as_deref();
        let mut received = Vec::new();

        if request.completable {
            for queued in state.queue.iter_mut() {
                if received.len() == request.count {
                    break;
                }
                if !queued.in_flight && matches_names(names, &queued.message.name) {
                    queued.in_flight = true;
                    received.push(queued.message.clone());
                }
            }
            return Ok(received);
        }

        let mut kept = VecDeque::with_capacity(state.queue.len());
        while let Some(queued) = state.queue.pop_front() {
            if received.len() < request.count
                && !queued.in_flight
                && matches_names(names, &queued.message.name)
            {
                received.push(queued.message);
            } else {
                kept.push_back(queued);
            }
        }
        state.queue = kept;
        Ok(received)
    }

    async fn delete_messages(&self, ids: &[MessageId]) -> Result<Vec<MessageId>> {
        let mut state = self.state.lock();
        let mut deleted = Vec::new();
        for id in ids {
            if state.remove(*id).is_some() {
                deleted.push(*id);
            }
            if let Some(sender) = state.completions.remove(id) {
                let _ = sender.send(None);
            }
        }
        Ok(deleted)
    }

    #[instrument(skip(self, response))]
    async fn complete_message(&self, id: MessageId, response: Option<Value>) -> Result<()> {
        let mut state = self.state.lock();
        state.remove(id);
        if let Some(sender) = state.completions.remove(&id) {
            let _ = sender.send(response);
        }
        Ok(())
    }

    async fn wait_for_messages(
        &self,
        names: Option<&[String]>,
        abort: CancellationToken,
    ) -> Result<()> {
        loop {
            let arrived = self.arrivals.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            if self.state.lock().has_visible(names) {
                return Ok(());
            }

            tokio::select! {
                _ = &mut arrived => {}
                _ = abort.cancelled() => return Ok(()),
            }
        }
    }
}

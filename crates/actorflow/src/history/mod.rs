//! Persisted history of a workflow.
//!
//! A [`History`] is loaded at the start of every pass and consulted by each
//! combinator before it does any work. Mutations are staged in memory and
//! reach the [`StorageDriver`] only through one atomic batch, so a crash
//! never leaves half of a commit behind.
//!
//! # Storage layout
//!
//! | Key                          | Value                                  |
//! |------------------------------|----------------------------------------|
//! | `workflow/{id}/record`       | [`WorkflowRecord`](crate::WorkflowRecord) |
//! | `workflow/{id}/names`        | entry keys in first-use order          |
//! | `workflow/{id}/entry/{key}`  | [`Entry`]                              |
//! | `workflow/{id}/meta/{key}`   | [`EntryMetadata`]                      |

mod entry;
mod location;

use std::collections::{HashMap, HashSet};

use tracing::debug;

pub use entry::{
    BranchRecord, BranchStatus, Entry, EntryKind, EntryMetadata, EntryStatus, EntryType,
};
pub use location::Location;
pub(crate) use location::{iteration_of, iterations_prefix, validate_name};

use crate::driver::{KvWrite, StorageDriver};
use crate::error::{Error, Result};
use crate::workflow::WorkflowId;

pub(crate) fn record_key(workflow_id: &WorkflowId) -> String {
    format!("workflow/{workflow_id}/record")
}

fn names_key(workflow_id: &WorkflowId) -> String {
    format!("workflow/{workflow_id}/names")
}

fn entry_prefix(workflow_id: &WorkflowId) -> String {
    format!("workflow/{workflow_id}/entry/")
}

fn meta_prefix(workflow_id: &WorkflowId) -> String {
    format!("workflow/{workflow_id}/meta/")
}

/// Ordered, named log of entries for one workflow.
#[derive(Debug)]
pub struct History {
    workflow_id: WorkflowId,
    entries: HashMap<String, Entry>,
    metadata: HashMap<String, EntryMetadata>,
    /// Entry keys in first-use order.
    names: Vec<String>,
    slots: HashMap<(Location, u32), String>,
    pending: Vec<KvWrite>,
    names_dirty: bool,
}

impl History {
    pub(crate) fn empty(workflow_id: WorkflowId) -> Self {
        Self {
            workflow_id,
            entries: HashMap::new(),
            metadata: HashMap::new(),
            names: Vec::new(),
            slots: HashMap::new(),
            pending: Vec::new(),
            names_dirty: false,
        }
    }

    /// Load the persisted history of a workflow.
    pub async fn load(storage: &dyn StorageDriver, workflow_id: &WorkflowId) -> Result<Self> {
        let mut history = Self::empty(workflow_id.clone());

        let entry_prefix = entry_prefix(workflow_id);
        for (_, value) in storage.list(&entry_prefix).await? {
            let entry: Entry = serde_json::from_slice(&value)?;
            history
                .slots
                .insert((entry.location.clone(), entry.position), entry.key.clone());
            history.entries.insert(entry.key.clone(), entry);
        }

        let meta_prefix = meta_prefix(workflow_id);
        for (key, value) in storage.list(&meta_prefix).await? {
            let Some(entry_key) = key.strip_prefix(&meta_prefix) else {
                continue;
            };
            let meta: EntryMetadata = serde_json::from_slice(&value)?;
            history.metadata.insert(entry_key.to_owned(), meta);
        }

        if let Some(bytes) = storage.get(&names_key(workflow_id)).await? {
            let names: Vec<String> = serde_json::from_slice(&bytes)?;
            history.names = names
                .into_iter()
                .filter(|key| history.entries.contains_key(key))
                .collect();
        }
        // Entries absent from the registry sort after registered ones.
        let registered: HashSet<&str> = history.names.iter().map(String::as_str).collect();
        let mut unregistered: Vec<_> = history
            .entries
            .keys()
            .filter(|key| !registered.contains(key.as_str()))
            .cloned()
            .collect();
        unregistered.sort();
        history.names.extend(unregistered);

        debug!(
            workflow_id = %workflow_id,
            entries = history.entries.len(),
            "history loaded"
        );
        Ok(history)
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub fn metadata(&self, key: &str) -> Option<&EntryMetadata> {
        self.metadata.get(key)
    }

    /// Entries in first-use order.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.names.iter().filter_map(|key| self.entries.get(key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Key of the entry recorded at `position` within `location`.
    pub(crate) fn slot(&self, location: &Location, position: u32) -> Option<&str> {
        self.slots
            .get(&(location.clone(), position))
            .map(String::as_str)
    }

    /// Keys of every entry nested under `prefix`.
    pub(crate) fn keys_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> {
        self.names
            .iter()
            .filter(move |key| key.starts_with(prefix))
            .map(String::as_str)
    }

    pub(crate) fn insert(&mut self, entry: Entry, meta: EntryMetadata) -> Result<()> {
        let key = entry.key.clone();
        self.stage_entry(&entry)?;
        self.stage_metadata(&key, &meta)?;
        self.slots
            .insert((entry.location.clone(), entry.position), key.clone());
        // `names` always holds exactly the keys of `entries`.
        if !self.entries.contains_key(&key) {
            self.names.push(key.clone());
            self.names_dirty = true;
        }
        self.entries.insert(key.clone(), entry);
        self.metadata.insert(key, meta);
        Ok(())
    }

    pub(crate) fn update_entry(&mut self, entry: Entry) -> Result<()> {
        if !self.entries.contains_key(&entry.key) {
            return Err(Error::critical(format!(
                "cannot update unknown entry `{}`",
                entry.key
            )));
        }
        self.stage_entry(&entry)?;
        self.entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    pub(crate) fn update_metadata(&mut self, key: &str, meta: EntryMetadata) -> Result<()> {
        self.stage_metadata(key, &meta)?;
        self.metadata.insert(key.to_owned(), meta);
        Ok(())
    }

    /// Delete every entry whose key starts with `prefix`.
    pub(crate) fn remove_prefix(&mut self, prefix: &str) {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        if self.entries.len() == before {
            return;
        }
        self.metadata.retain(|key, _| !key.starts_with(prefix));
        self.slots.retain(|_, key| !key.starts_with(prefix));
        self.names.retain(|key| !key.starts_with(prefix));
        self.names_dirty = true;

        self.pending.push(KvWrite::DeletePrefix {
            prefix: format!("{}{prefix}", entry_prefix(&self.workflow_id)),
        });
        self.pending.push(KvWrite::DeletePrefix {
            prefix: format!("{}{prefix}", meta_prefix(&self.workflow_id)),
        });
    }

    /// Clear the exhaustion of `key`, staging the reset metadata.
    pub(crate) fn reset_exhausted(&mut self, key: &str) -> Result<()> {
        let mut meta = self
            .metadata
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NothingToRecover(self.workflow_id.clone()))?;
        meta.reset()?;
        self.update_metadata(key, meta)
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty() || self.names_dirty
    }

    /// Drain staged writes, registry update last.
    pub(crate) fn take_pending(&mut self) -> Result<Vec<KvWrite>> {
        let mut writes = std::mem::take(&mut self.pending);
        if self.names_dirty {
            writes.push(KvWrite::Set {
                key: names_key(&self.workflow_id),
                value: serde_json::to_vec(&self.names)?,
            });
            self.names_dirty = false;
        }
        Ok(writes)
    }

    fn stage_entry(&mut self, entry: &Entry) -> Result<()> {
        self.pending.push(KvWrite::Set {
            key: format!("{}{}", entry_prefix(&self.workflow_id), entry.key),
            value: serde_json::to_vec(entry)?,
        });
        Ok(())
    }

    fn stage_metadata(&mut self, key: &str, meta: &EntryMetadata) -> Result<()> {
        self.pending.push(KvWrite::Set {
            key: format!("{}{key}", meta_prefix(&self.workflow_id)),
            value: serde_json::to_vec(meta)?,
        });
        Ok(())
    }
}

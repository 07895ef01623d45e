//! Workflow context and the combinators built on it.
//!
//! Every combinator follows the same protocol:
//!
//! 1. Check for eviction.
//! 2. Claim its entry key in the current scope. Claiming detects divergence
//!    (same key twice in a pass, kind or position mismatch) and misuse (a
//!    second entry started while the previous one is still running).
//! 3. Return the memoized result if the entry already completed.
//! 4. Otherwise do the work, staging history writes, and commit them in one
//!    batch at the points where durability matters.

mod branch;
mod listen;
mod loops;
mod removed;
mod sleep;
mod step;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

pub use branch::{Branch, RaceWinner};
pub use loops::{LoopConfig, LoopControl};
pub use step::{StepConfig, StepContext};

use crate::abort::AbortSignal;
use crate::driver::{Drivers, MessageDriver, StorageDriver};
use crate::error::{Error, Result, Suspension};
use crate::history::{Entry, EntryMetadata, EntryStatus, EntryType, History, Location};
use crate::runtime::RuntimeConfig;
use crate::strategy::SuspendStrategy;
use crate::workflow::WorkflowId;

/// State shared by every scope of one pass.
pub(crate) struct PassShared {
    workflow_id: WorkflowId,
    storage: Arc<dyn StorageDriver>,
    messages: Arc<dyn MessageDriver>,
    history: Mutex<History>,
    strategy: Arc<dyn SuspendStrategy>,
    signal: AbortSignal,
    config: RuntimeConfig,
    commit: AsyncMutex<()>,
}

impl PassShared {
    pub(crate) fn new(
        drivers: &Drivers,
        history: History,
        strategy: Arc<dyn SuspendStrategy>,
        signal: AbortSignal,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            workflow_id: history.workflow_id().clone(),
            storage: Arc::clone(&drivers.storage),
            messages: Arc::clone(&drivers.messages),
            history: Mutex::new(history),
            strategy,
            signal,
            config,
            commit: AsyncMutex::new(()),
        }
    }

    /// Commit every staged history write in one batch.
    pub(crate) async fn flush(&self) -> Result<()> {
        let _commit = self.commit.lock().await;
        let writes = {
            let mut history = self.history.lock();
            if !history.has_pending() {
                return Ok(());
            }
            history.take_pending()?
        };
        debug!(
            workflow_id = %self.workflow_id,
            writes = writes.len(),
            "committing history"
        );
        self.storage.batch(writes).await
    }
}

/// One scope of entries: the workflow root, a loop iteration, or a branch.
///
/// A key is only ever claimed in the scope owning its location, so keys
/// reached twice are detected per scope and forgotten with it.
struct Scope {
    location: Location,
    cursor: Mutex<u32>,
    active: Mutex<Option<String>>,
    visited: Mutex<HashSet<String>>,
}

impl Scope {
    fn new(location: Location) -> Self {
        Self {
            location,
            cursor: Mutex::new(0),
            active: Mutex::new(None),
            visited: Mutex::new(HashSet::new()),
        }
    }
}

/// Marks an entry as running in its scope until dropped.
struct ActiveGuard {
    scope: Arc<Scope>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        *self.scope.active.lock() = None;
    }
}

/// A claimed entry key. Holding it keeps the scope busy.
pub(crate) struct Claim {
    key: String,
    position: u32,
    existing: Option<(Entry, EntryMetadata)>,
    _active: ActiveGuard,
}

/// Handle passed to workflow code for invoking combinators.
///
/// Cloning is cheap. Clones share the scope they were created in, so the
/// usual pattern is to pass the context into loop bodies and branches
/// through the closures those combinators provide, which receive their own
/// nested scopes.
#[derive(Clone)]
pub struct WorkflowContext {
    shared: Arc<PassShared>,
    scope: Arc<Scope>,
}

impl WorkflowContext {
    pub(crate) fn root(shared: Arc<PassShared>) -> Self {
        Self {
            shared,
            scope: Arc::new(Scope::new(Location::root())),
        }
    }

    fn child(&self, location: Location) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            scope: Arc::new(Scope::new(location)),
        }
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.shared.workflow_id
    }

    /// Location of the scope this context creates entries in.
    pub fn location(&self) -> &Location {
        &self.scope.location
    }

    /// Whether the current pass has been asked to stop.
    ///
    /// Long-running step bodies can poll this to return early; combinators
    /// check it themselves before doing any work.
    pub fn is_evicted(&self) -> bool {
        self.shared.signal.is_evicted()
    }

    fn check_evicted(&self) -> Result<()> {
        if self.is_evicted() {
            return Err(Error::Suspended(Suspension::evicted()));
        }
        Ok(())
    }

    /// Claim the next position of this scope for `name`.
    ///
    /// `kind` must match the recorded entry, except that a removal may claim
    /// an entry of any kind.
    fn claim(&self, name: &str, kind: EntryType) -> Result<Claim> {
        crate::history::validate_name(name)?;
        let key = self.scope.location.key_for(name);

        let mut active = self.scope.active.lock();
        if let Some(active) = active.as_ref() {
            return Err(Error::EntryInProgress {
                active: active.clone(),
                attempted: key,
            });
        }

        if !self.scope.visited.lock().insert(key.clone()) {
            return Err(Error::diverged(key, "entry reached more than once in one pass"));
        }

        let position = {
            let mut cursor = self.scope.cursor.lock();
            let position = *cursor;
            *cursor += 1;
            position
        };

        let existing = {
            let history = self.shared.history.lock();
            match history.get(&key) {
                Some(entry) => {
                    let recorded = entry.entry_type();
                    if recorded != kind && kind != EntryType::Removed {
                        return Err(Error::diverged(
                            key,
                            format!("recorded as {recorded}, replayed as {kind}"),
                        ));
                    }
                    if entry.position != position {
                        return Err(Error::diverged(
                            key,
                            format!(
                                "recorded at position {}, replayed at position {position}",
                                entry.position
                            ),
                        ));
                    }
                    let meta = history.metadata(&key).cloned().unwrap_or_default();
                    Some((entry.clone(), meta))
                }
                None => {
                    if let Some(other) = history.slot(&self.scope.location, position) {
                        return Err(Error::diverged(
                            key,
                            format!("position {position} is recorded as `{other}`"),
                        ));
                    }
                    None
                }
            }
        };

        if existing.is_some() {
            debug!(workflow_id = %self.shared.workflow_id, entry = %key, "replaying entry");
        }

        *active = Some(key.clone());
        drop(active);

        Ok(Claim {
            key,
            position,
            existing,
            _active: ActiveGuard {
                scope: Arc::clone(&self.scope),
            },
        })
    }

    /// Build a new entry for a claim in this scope.
    fn new_entry(&self, name: &str, claim: &Claim, kind: crate::history::EntryKind) -> Entry {
        Entry::new(name, self.scope.location.clone(), claim.position, kind)
    }

    fn insert_entry(&self, entry: Entry, meta: EntryMetadata) -> Result<()> {
        self.shared.history.lock().insert(entry, meta)
    }

    fn update_entry(&self, entry: Entry, meta: Option<EntryMetadata>) -> Result<()> {
        let mut history = self.shared.history.lock();
        if let Some(meta) = meta {
            history.update_metadata(&entry.key, meta)?;
        }
        history.update_entry(entry)
    }

    fn update_metadata(&self, key: &str, meta: EntryMetadata) -> Result<()> {
        self.shared.history.lock().update_metadata(key, meta)
    }
}

/// Error to return when replay reaches an entry that already failed.
fn recorded_failure(key: &str, meta: &EntryMetadata) -> Option<Error> {
    match meta.status {
        EntryStatus::Failed => Some(match &meta.failure {
            Some(failure) => Error::from(failure.clone()),
            None => Error::Critical(
                meta.error
                    .clone()
                    .unwrap_or_else(|| format!("entry `{key}` failed")),
            ),
        }),
        EntryStatus::Exhausted => Some(Error::StepExhausted {
            name: key.to_owned(),
            attempts: meta.attempts,
            last_error: meta.error.clone().unwrap_or_default(),
        }),
        _ => None,
    }
}

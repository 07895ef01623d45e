//! Durable loops with periodic state commits.

use std::future::Future;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::debug;

use super::{WorkflowContext, recorded_failure};
use crate::error::{Error, Result};
use crate::history::{EntryKind, EntryMetadata, EntryType, History, iteration_of, iterations_prefix};
use crate::runtime::LoopDefaults;

/// What a loop body wants to happen next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopControl<S, O> {
    /// Run another iteration with this state.
    Continue(S),
    /// Finish the loop with this output.
    Break(O),
}

/// Per-loop settings. Unset values fall back to
/// [`RuntimeConfig::loops`](crate::RuntimeConfig::loops).
#[derive(Debug, Clone)]
pub struct LoopConfig {
    name: String,
    commit_interval: Option<u64>,
    history_every: Option<u64>,
    history_keep: Option<u64>,
}

impl LoopConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            commit_interval: None,
            history_every: None,
            history_keep: None,
        }
    }

    /// Persist the loop state every `iterations` completed iterations.
    pub fn commit_interval(mut self, iterations: u64) -> Self {
        self.commit_interval = Some(iterations);
        self
    }

    /// Keep the entries of every `every`-th iteration, and of those only the
    /// `keep` most recent. Other iterations are pruned at each commit.
    pub fn history(mut self, every: u64, keep: u64) -> Self {
        self.history_every = Some(every);
        self.history_keep = Some(keep);
        self
    }

    fn resolve(&self, defaults: &LoopDefaults) -> LoopDefaults {
        LoopDefaults {
            commit_interval: self
                .commit_interval
                .unwrap_or(defaults.commit_interval)
                .max(1),
            history_every: self.history_every.unwrap_or(defaults.history_every).max(1),
            history_keep: self.history_keep.unwrap_or(defaults.history_keep),
        }
    }
}

impl WorkflowContext {
    /// Run `body` until it returns [`LoopControl::Break`], using the
    /// configured defaults.
    pub async fn run_loop<S, O, F, Fut>(&self, name: &str, initial: S, body: F) -> Result<O>
    where
        S: Serialize + DeserializeOwned + Send,
        O: Serialize + DeserializeOwned + Send,
        F: FnMut(WorkflowContext, S) -> Fut + Send,
        Fut: Future<Output = Result<LoopControl<S, O>>> + Send,
    {
        self.run_loop_with(LoopConfig::new(name), initial, body)
            .await
    }

    /// Run a durable loop.
    ///
    /// Each iteration gets its own scope, so entry names can repeat across
    /// iterations. The state is persisted every `commit_interval` iterations
    /// and when the loop breaks; a replay resumes from the last persisted
    /// state and re-runs the iterations after it. Errors from `body`
    /// propagate and end the loop.
    pub async fn run_loop_with<S, O, F, Fut>(
        &self,
        config: LoopConfig,
        initial: S,
        mut body: F,
    ) -> Result<O>
    where
        S: Serialize + DeserializeOwned + Send,
        O: Serialize + DeserializeOwned + Send,
        F: FnMut(WorkflowContext, S) -> Fut + Send,
        Fut: Future<Output = Result<LoopControl<S, O>>> + Send,
    {
        self.check_evicted()?;
        let claim = self.claim(&config.name, EntryType::Loop)?;
        let key = claim.key.clone();
        let settings = config.resolve(&self.shared.config.loops);

        let (mut entry, mut meta, mut state, mut iteration) = match &claim.existing {
            Some((entry, meta)) => {
                if let Some(error) = recorded_failure(&key, meta) {
                    return Err(error);
                }
                let EntryKind::Loop {
                    state,
                    iteration,
                    output,
                } = &entry.kind
                else {
                    return Err(Error::diverged(&key, "recorded entry is not a loop"));
                };
                if meta.is_completed() {
                    return Ok(serde_json::from_value(
                        output.clone().unwrap_or(Value::Null),
                    )?);
                }
                debug!(
                    workflow_id = %self.shared.workflow_id,
                    entry = %key,
                    iteration,
                    "resuming loop"
                );
                let state: S = serde_json::from_value(state.clone())?;
                (entry.clone(), meta.clone(), state, *iteration)
            }
            None => {
                let entry = self.new_entry(
                    &config.name,
                    &claim,
                    EntryKind::Loop {
                        state: serde_json::to_value(&initial)?,
                        iteration: 0,
                        output: None,
                    },
                );
                let meta = EntryMetadata::default();
                self.insert_entry(entry.clone(), meta.clone())?;
                (entry, meta, initial, 0)
            }
        };

        loop {
            self.check_evicted()?;
            let scope = self.child(self.location().iteration(&config.name, iteration));
            let control = body(scope, state).await?;
            iteration += 1;

            match control {
                LoopControl::Continue(next) => {
                    state = next;
                    if iteration % settings.commit_interval != 0 {
                        continue;
                    }
                    entry.kind = EntryKind::Loop {
                        state: serde_json::to_value(&state)?,
                        iteration,
                        output: None,
                    };
                    {
                        let mut history = self.shared.history.lock();
                        history.update_entry(entry.clone())?;
                        prune_iterations(&mut history, &key, iteration, &settings);
                    }
                    self.shared.flush().await?;
                    debug!(
                        workflow_id = %self.shared.workflow_id,
                        entry = %key,
                        iteration,
                        "loop state committed"
                    );
                    self.shared.strategy.after_loop_commit().await;
                }
                LoopControl::Break(output) => {
                    let last_state = match &entry.kind {
                        EntryKind::Loop { state, .. } => state.clone(),
                        _ => Value::Null,
                    };
                    entry.kind = EntryKind::Loop {
                        state: last_state,
                        iteration,
                        output: Some(serde_json::to_value(&output)?),
                    };
                    meta.complete()?;
                    {
                        let mut history = self.shared.history.lock();
                        history.update_metadata(&key, meta)?;
                        history.update_entry(entry)?;
                        prune_iterations(&mut history, &key, iteration, &settings);
                    }
                    self.shared.flush().await?;
                    debug!(
                        workflow_id = %self.shared.workflow_id,
                        entry = %key,
                        iterations = iteration,
                        "loop finished"
                    );
                    return Ok(output);
                }
            }
        }
    }
}

/// Delete the entries of completed iterations that fall outside the
/// retention window.
///
/// Iteration `i < completed` is retained when `i % history_every == 0` and
/// it is one of the `history_keep` most recent such iterations.
fn prune_iterations(history: &mut History, loop_key: &str, completed: u64, settings: &LoopDefaults) {
    let prefix = iterations_prefix(loop_key);
    let mut iterations: Vec<u64> = history
        .keys_with_prefix(&prefix)
        .filter_map(|key| iteration_of(loop_key, key))
        .collect();
    iterations.sort_unstable();
    iterations.dedup();

    let every = settings.history_every;
    let oldest_kept = match (completed.checked_sub(1), settings.history_keep) {
        (Some(last), keep) if keep > 0 => {
            let newest = last - last % every;
            Some(newest.saturating_sub((keep - 1).saturating_mul(every)))
        }
        _ => None,
    };

    for iteration in iterations {
        if iteration >= completed {
            continue;
        }
        let retained =
            iteration % every == 0 && oldest_kept.is_some_and(|oldest| iteration >= oldest);
        if !retained {
            history.remove_prefix(&format!("{prefix}{iteration}/"));
        }
    }
}

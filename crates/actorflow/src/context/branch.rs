//! Concurrent branches: join and race.

use std::collections::HashSet;
use std::future::Future;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use nonempty::NonEmpty;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::debug;

use super::{Claim, WorkflowContext, recorded_failure};
use crate::error::{Error, Result, Suspension};
use crate::history::{
    BranchRecord, BranchStatus, Entry, EntryKind, EntryMetadata, EntryType, validate_name,
};

type BranchFn<'a, T> = Box<dyn FnOnce(WorkflowContext) -> BoxFuture<'a, Result<T>> + Send + 'a>;

/// A named unit of concurrent work inside a join or race.
///
/// The branch receives its own context, scoped under the join or race entry,
/// so entry names only need to be unique within the branch.
pub struct Branch<'a, T> {
    name: String,
    run: BranchFn<'a, T>,
}

impl<'a, T> Branch<'a, T> {
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(WorkflowContext) -> Fut + Send + 'a,
        Fut: Future<Output = Result<T>> + Send + 'a,
    {
        Self {
            name: name.into(),
            run: Box::new(move |ctx| Box::pin(run(ctx))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> std::fmt::Debug for Branch<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Branch")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// The branch that won a race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaceWinner<T> {
    pub index: usize,
    pub name: String,
    pub value: T,
}

fn branch_names<T>(branches: &NonEmpty<Branch<'_, T>>) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut names = Vec::with_capacity(branches.len());
    for branch in branches.iter() {
        validate_name(&branch.name)?;
        if !seen.insert(branch.name.as_str()) {
            return Err(Error::InvalidName {
                name: branch.name.clone(),
                reason: "branch name is used twice",
            });
        }
        names.push(branch.name.clone());
    }
    Ok(names)
}

fn recorded_names(records: &[BranchRecord]) -> Vec<&str> {
    records.iter().map(|r| r.name.as_str()).collect()
}

impl WorkflowContext {
    /// Open the join or race entry for `claim`, creating it on first reach.
    fn open_branches(
        &self,
        name: &str,
        claim: &Claim,
        kind: EntryType,
        names: &[String],
    ) -> Result<(Entry, EntryMetadata, Vec<BranchRecord>)> {
        match &claim.existing {
            Some((entry, meta)) => {
                if let Some(error) = recorded_failure(&claim.key, meta) {
                    return Err(error);
                }
                let records = match &entry.kind {
                    EntryKind::Join { branches } | EntryKind::Race { branches, .. } => branches,
                    _ => return Err(Error::diverged(&claim.key, "recorded entry has no branches")),
                };
                if recorded_names(records) != names.iter().map(String::as_str).collect::<Vec<_>>()
                {
                    return Err(Error::diverged(
                        &claim.key,
                        format!(
                            "recorded branches {:?}, replayed with {names:?}",
                            recorded_names(records)
                        ),
                    ));
                }
                Ok((entry.clone(), meta.clone(), records.clone()))
            }
            None => {
                let records: Vec<_> = names.iter().map(BranchRecord::pending).collect();
                let payload = match kind {
                    EntryType::Race => EntryKind::Race {
                        branches: records.clone(),
                        winner: None,
                    },
                    _ => EntryKind::Join {
                        branches: records.clone(),
                    },
                };
                let entry = self.new_entry(name, claim, payload);
                let meta = EntryMetadata::default();
                self.insert_entry(entry.clone(), meta.clone())?;
                Ok((entry, meta, records))
            }
        }
    }

    /// Run every branch concurrently and return their outputs in branch order.
    ///
    /// Branch results are recorded as they settle, so a replay only re-runs
    /// branches that had not finished. The first branch failure fails the
    /// join and drops the branches still running; among failures settled at
    /// the same time the lowest-indexed branch wins.
    pub async fn join<'a, T>(
        &self,
        name: &str,
        branches: impl IntoIterator<Item = Branch<'a, T>>,
    ) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'a,
    {
        let branches =
            NonEmpty::collect(branches).ok_or_else(|| Error::EmptyBranches(name.to_owned()))?;
        let names = branch_names(&branches)?;
        self.check_evicted()?;
        let claim = self.claim(name, EntryType::Join)?;
        let key = claim.key.clone();
        let (mut entry, mut meta, mut records) =
            self.open_branches(name, &claim, EntryType::Join, &names)?;

        if meta.is_completed() {
            return records
                .iter()
                .map(|r| Ok(serde_json::from_value(r.output.clone().unwrap_or(Value::Null))?))
                .collect();
        }

        let stored: Vec<Option<Value>> = records
            .iter()
            .map(|r| {
                (r.status == BranchStatus::Completed)
                    .then(|| r.output.clone().unwrap_or(Value::Null))
            })
            .collect();
        let location = self.location().clone();
        let mut running: FuturesUnordered<_> = branches
            .into_iter()
            .zip(stored)
            .enumerate()
            .map(|(index, (branch, stored))| {
                let ctx = self.child(location.branch(name, &branch.name));
                async move {
                    let result = match stored {
                        Some(value) => serde_json::from_value::<T>(value).map_err(Error::from),
                        None => (branch.run)(ctx).await,
                    };
                    (index, result)
                }
            })
            .collect();

        let mut outputs: Vec<Option<T>> = records.iter().map(|_| None).collect();
        let mut suspension: Option<Suspension> = None;
        let mut failures: Vec<(usize, Error)> = Vec::new();
        loop {
            // After the first failure only branches that are already done count.
            let next = if failures.is_empty() {
                running.next().await
            } else {
                running.next().now_or_never().flatten()
            };
            let Some((index, result)) = next else {
                break;
            };
            match result {
                Ok(value) => {
                    let record = &mut records[index];
                    if record.status != BranchStatus::Completed {
                        record.status = BranchStatus::Completed;
                        record.output = Some(serde_json::to_value(&value)?);
                    }
                    outputs[index] = Some(value);
                }
                Err(Error::Suspended(branch)) => {
                    suspension = Some(match suspension {
                        Some(merged) => merged.merge(branch),
                        None => branch,
                    });
                }
                Err(error) => failures.push((index, error)),
            }
        }
        drop(running);

        let failure = failures.into_iter().min_by_key(|(index, _)| *index);
        if let Some((index, error)) = &failure {
            if !matches!(error, Error::StepExhausted { .. }) {
                records[*index].status = BranchStatus::Failed;
                records[*index].error = Some(error.to_string());
            }
        }

        entry.kind = EntryKind::Join { branches: records };
        if let Some((_, error)) = failure {
            let meta = match error {
                Error::StepExhausted { .. } => None,
                _ => {
                    meta.fail(&error)?;
                    Some(meta)
                }
            };
            self.update_entry(entry, meta)?;
            self.shared.flush().await?;
            return Err(error);
        }
        if let Some(suspension) = suspension {
            self.update_entry(entry, None)?;
            return Err(Error::Suspended(suspension));
        }

        let outputs: Vec<T> = outputs
            .into_iter()
            .collect::<Option<_>>()
            .ok_or_else(|| Error::diverged(&key, "join branch settled without output"))?;
        meta.complete()?;
        self.update_entry(entry, Some(meta))?;
        self.shared.flush().await?;
        debug!(
            workflow_id = %self.shared.workflow_id,
            entry = %key,
            branches = outputs.len(),
            "join completed"
        );
        Ok(outputs)
    }

    /// Run every branch concurrently and return the first to complete.
    ///
    /// The remaining branches are dropped and recorded as cancelled. A branch
    /// failing before any branch wins fails the race. The winner is recorded,
    /// so replays return it without re-running any branch.
    pub async fn race<'a, T>(
        &self,
        name: &str,
        branches: impl IntoIterator<Item = Branch<'a, T>>,
    ) -> Result<RaceWinner<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'a,
    {
        let branches =
            NonEmpty::collect(branches).ok_or_else(|| Error::EmptyBranches(name.to_owned()))?;
        let names = branch_names(&branches)?;
        self.check_evicted()?;
        let claim = self.claim(name, EntryType::Race)?;
        let key = claim.key.clone();
        let (mut entry, mut meta, mut records) =
            self.open_branches(name, &claim, EntryType::Race, &names)?;

        if meta.is_completed() {
            let winner = match &entry.kind {
                EntryKind::Race {
                    winner: Some(index),
                    ..
                } => *index,
                _ => return Err(Error::diverged(&key, "completed race has no winner")),
            };
            let record = records
                .get(winner)
                .ok_or_else(|| Error::diverged(&key, "recorded winner is out of range"))?;
            return Ok(RaceWinner {
                index: winner,
                name: record.name.clone(),
                value: serde_json::from_value(record.output.clone().unwrap_or(Value::Null))?,
            });
        }

        let location = self.location().clone();
        let mut running: FuturesUnordered<_> = branches
            .into_iter()
            .enumerate()
            .map(|(index, branch)| {
                let ctx = self.child(location.branch(name, &branch.name));
                async move { (index, (branch.run)(ctx).await) }
            })
            .collect();

        let mut suspension: Option<Suspension> = None;
        let mut settled: Option<(usize, Result<T>)> = None;
        while let Some((index, result)) = running.next().await {
            match result {
                Err(Error::Suspended(branch)) => {
                    suspension = Some(match suspension {
                        Some(merged) => merged.merge(branch),
                        None => branch,
                    });
                }
                other => {
                    settled = Some((index, other));
                    break;
                }
            }
        }
        drop(running);

        let Some((index, result)) = settled else {
            let suspension = suspension.unwrap_or_default();
            return Err(Error::Suspended(suspension));
        };

        for (other, record) in records.iter_mut().enumerate() {
            if other != index && record.status == BranchStatus::Pending {
                record.status = BranchStatus::Cancelled;
            }
        }

        match result {
            Ok(value) => {
                records[index].status = BranchStatus::Completed;
                records[index].output = Some(serde_json::to_value(&value)?);
                let winner_name = records[index].name.clone();
                entry.kind = EntryKind::Race {
                    branches: records,
                    winner: Some(index),
                };
                meta.complete()?;
                self.update_entry(entry, Some(meta))?;
                self.shared.flush().await?;
                debug!(
                    workflow_id = %self.shared.workflow_id,
                    entry = %key,
                    winner = %winner_name,
                    "race won"
                );
                Ok(RaceWinner {
                    index,
                    name: winner_name,
                    value,
                })
            }
            Err(error) => {
                let exhausted = matches!(error, Error::StepExhausted { .. });
                if !exhausted {
                    records[index].status = BranchStatus::Failed;
                    records[index].error = Some(error.to_string());
                    meta.fail(&error)?;
                } else {
                    for record in records.iter_mut() {
                        if record.status == BranchStatus::Cancelled {
                            record.status = BranchStatus::Pending;
                        }
                    }
                }
                entry.kind = EntryKind::Race {
                    branches: records,
                    winner: None,
                };
                self.update_entry(entry, (!exhausted).then_some(meta))?;
                self.shared.flush().await?;
                Err(error)
            }
        }
    }
}

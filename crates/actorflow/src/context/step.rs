//! Memoized, retried units of side-effecting work.

use std::future::Future;
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{debug, error, warn};

use super::{WorkflowContext, recorded_failure};
use crate::abort::AbortSignal;
use crate::error::{Error, Result};
use crate::history::{EntryKind, EntryMetadata, EntryType};
use crate::retry::RetryPolicy;
use crate::workflow::WorkflowId;

#[derive(Debug, Clone, Copy, Default)]
enum Timeout {
    #[default]
    Inherit,
    Limit(Duration),
    Unlimited,
}

/// Per-step settings. Unset values fall back to
/// [`RuntimeConfig`](crate::RuntimeConfig).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use actorflow::StepConfig;
///
/// let config = StepConfig::new("charge-card")
///     .max_retries(5)
///     .backoff(Duration::from_millis(250), Duration::from_secs(10))
///     .timeout(Duration::from_secs(5));
/// assert_eq!(config.name(), "charge-card");
/// ```
#[derive(Debug, Clone)]
pub struct StepConfig {
    name: String,
    max_retries: Option<u32>,
    backoff_base: Option<Duration>,
    backoff_max: Option<Duration>,
    timeout: Timeout,
    ephemeral: bool,
}

impl StepConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_retries: None,
            backoff_base: None,
            backoff_max: None,
            timeout: Timeout::Inherit,
            ephemeral: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum number of attempts, including the first.
    pub fn max_retries(mut self, attempts: u32) -> Self {
        self.max_retries = Some(attempts);
        self
    }

    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = Some(base);
        self.backoff_max = Some(max);
        self
    }

    /// Fail the attempt critically if the body runs longer than `limit`.
    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Timeout::Limit(limit);
        self
    }

    pub fn without_timeout(mut self) -> Self {
        self.timeout = Timeout::Unlimited;
        self
    }

    /// Stage the result instead of committing it immediately. The result is
    /// committed together with the next durable write of the pass.
    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    fn retry_policy(&self, defaults: &RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries).max(1),
            base_delay: self.backoff_base.unwrap_or(defaults.base_delay),
            max_delay: self.backoff_max.unwrap_or(defaults.max_delay),
        }
    }

    fn time_limit(&self, default: Option<Duration>) -> Option<Duration> {
        match self.timeout {
            Timeout::Inherit => default,
            Timeout::Limit(limit) => Some(limit),
            Timeout::Unlimited => None,
        }
    }
}

/// Information about the attempt a step body is running.
#[derive(Debug, Clone)]
pub struct StepContext {
    workflow_id: WorkflowId,
    key: String,
    attempt: u32,
    signal: AbortSignal,
}

impl StepContext {
    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    /// Entry key of the step.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Attempt number, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_retry(&self) -> bool {
        self.attempt > 1
    }

    /// Stable across attempts and passes. Pass it to external services that
    /// deduplicate requests.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.workflow_id, self.key)
    }

    pub fn is_evicted(&self) -> bool {
        self.signal.is_evicted()
    }
}

impl WorkflowContext {
    /// Run `body` once and memoize its result under `name`.
    ///
    /// On replay the recorded result is returned without running `body`.
    /// Retryable failures are retried with exponential backoff.
    pub async fn step<T, F, Fut>(&self, name: &str, body: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnMut(StepContext) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        self.step_with(StepConfig::new(name), body).await
    }

    /// [`step`](Self::step) with explicit settings.
    pub async fn step_with<T, F, Fut>(&self, config: StepConfig, mut body: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnMut(StepContext) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        self.check_evicted()?;
        let claim = self.claim(&config.name, EntryType::Step)?;
        let key = claim.key.clone();
        let policy = config.retry_policy(&self.shared.config.retry_policy);
        let time_limit = config.time_limit(self.shared.config.step_timeout);

        let mut meta = match &claim.existing {
            Some((entry, meta)) => {
                if meta.is_completed() {
                    return decode_output(&entry.kind);
                }
                meta.clone()
            }
            None => {
                let entry = self.new_entry(
                    &config.name,
                    &claim,
                    EntryKind::Step {
                        output: None,
                        ephemeral: config.ephemeral,
                    },
                );
                let meta = EntryMetadata::default();
                self.insert_entry(entry, meta.clone())?;
                meta
            }
        };

        loop {
            if let Some(error) = recorded_failure(&key, &meta) {
                return Err(error);
            }
            if let Some(retry_at) = meta.retry_at {
                self.shared
                    .strategy
                    .sleep_until(&self.shared.signal, retry_at)
                    .await?;
            }
            self.check_evicted()?;

            meta.start()?;
            let attempt = meta.attempts + 1;
            debug!(
                workflow_id = %self.shared.workflow_id,
                entry = %key,
                attempt,
                "running step"
            );

            let step = StepContext {
                workflow_id: self.shared.workflow_id.clone(),
                key: key.clone(),
                attempt,
                signal: self.shared.signal.clone(),
            };
            let outcome = match time_limit {
                Some(limit) => tokio::time::timeout(limit, body(step))
                    .await
                    .unwrap_or_else(|_| {
                        Err(Error::StepTimeout {
                            name: key.clone(),
                            timeout: limit,
                        })
                    }),
                None => body(step).await,
            };

            match outcome {
                Ok(value) => {
                    let output = serde_json::to_value(&value)?;
                    meta.complete()?;
                    self.record_output(&key, output, meta)?;
                    if !config.ephemeral {
                        self.shared.flush().await?;
                    }
                    return Ok(value);
                }
                Err(error) if error.as_suspension().is_some() => return Err(error),
                Err(error) if !error.is_retryable() => {
                    error!(
                        workflow_id = %self.shared.workflow_id,
                        entry = %key,
                        attempt,
                        error = %error,
                        "step failed without retry"
                    );
                    meta.fail(&error)?;
                    self.update_metadata(&key, meta)?;
                    self.shared.flush().await?;
                    return Err(error);
                }
                Err(error) => {
                    let message = error.to_string();
                    if policy.should_retry(attempt) {
                        let retry_at = policy.next_attempt_at(attempt);
                        warn!(
                            workflow_id = %self.shared.workflow_id,
                            entry = %key,
                            attempt,
                            %retry_at,
                            error = %message,
                            "step failed, retrying"
                        );
                        meta.retry_later(message, retry_at)?;
                        self.update_metadata(&key, meta.clone())?;
                        self.shared.flush().await?;
                        continue;
                    }

                    error!(
                        workflow_id = %self.shared.workflow_id,
                        entry = %key,
                        attempts = attempt,
                        error = %message,
                        "step exhausted"
                    );
                    meta.exhaust(message.clone())?;
                    self.update_metadata(&key, meta)?;
                    self.shared.flush().await?;
                    return Err(Error::StepExhausted {
                        name: key,
                        attempts: attempt,
                        last_error: message,
                    });
                }
            }
        }
    }

    fn record_output(&self, key: &str, output: Value, meta: EntryMetadata) -> Result<()> {
        let mut history = self.shared.history.lock();
        if let Some(mut entry) = history.get(key).cloned() {
            if let EntryKind::Step { output: slot, .. } = &mut entry.kind {
                *slot = Some(output);
            }
            history.update_entry(entry)?;
        }
        history.update_metadata(key, meta)
    }
}

fn decode_output<T: DeserializeOwned>(kind: &EntryKind) -> Result<T> {
    let output = match kind {
        EntryKind::Step { output, .. } => output.clone().unwrap_or(Value::Null),
        _ => Value::Null,
    };
    Ok(serde_json::from_value(output)?)
}

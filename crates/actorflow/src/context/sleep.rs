//! Durable timers.

use std::time::Duration;

use time::OffsetDateTime;
use tracing::debug;

use super::{WorkflowContext, recorded_failure};
use crate::error::{Error, Result};
use crate::history::{EntryKind, EntryMetadata, EntryType};

impl WorkflowContext {
    /// Sleep for `duration`, measured from the first time this entry is reached.
    pub async fn sleep(&self, name: &str, duration: Duration) -> Result<()> {
        self.sleep_inner(name, |now| now + duration).await
    }

    /// Sleep until `wake_at`.
    pub async fn sleep_until(&self, name: &str, wake_at: OffsetDateTime) -> Result<()> {
        self.sleep_inner(name, |_| wake_at).await
    }

    async fn sleep_inner(
        &self,
        name: &str,
        resolve: impl FnOnce(OffsetDateTime) -> OffsetDateTime + Send,
    ) -> Result<()> {
        self.check_evicted()?;
        let claim = self.claim(name, EntryType::Sleep)?;
        let key = claim.key.clone();

        let (wake_at, mut meta) = match &claim.existing {
            Some((entry, meta)) => {
                if let Some(error) = recorded_failure(&key, meta) {
                    return Err(error);
                }
                if meta.is_completed() {
                    return Ok(());
                }
                let EntryKind::Sleep { wake_at } = entry.kind else {
                    return Err(Error::diverged(&key, "recorded entry is not a sleep"));
                };
                (wake_at, meta.clone())
            }
            None => {
                let wake_at = resolve(OffsetDateTime::now_utc());
                let entry = self.new_entry(name, &claim, EntryKind::Sleep { wake_at });
                let meta = EntryMetadata::default();
                self.insert_entry(entry, meta.clone())?;
                self.shared.flush().await?;
                (wake_at, meta)
            }
        };

        debug!(
            workflow_id = %self.shared.workflow_id,
            entry = %key,
            %wake_at,
            "sleeping"
        );
        self.shared
            .strategy
            .sleep_until(&self.shared.signal, wake_at)
            .await?;

        meta.complete()?;
        self.update_metadata(&key, meta)
    }
}

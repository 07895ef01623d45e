//! Tombstones for combinators deleted from workflow code.

use tracing::debug;

use super::WorkflowContext;
use crate::error::{Error, Result};
use crate::history::{EntryKind, EntryMetadata, EntryType, iterations_prefix};

impl WorkflowContext {
    /// Keep the position of a combinator that no longer exists in the code.
    ///
    /// Call it where the deleted combinator used to be, with the kind it had.
    /// A recorded entry of that kind becomes a tombstone and its nested
    /// entries are deleted. When nothing was recorded, a fresh tombstone is
    /// written so the positions of later entries stay aligned.
    pub async fn removed(&self, name: &str, original: EntryType) -> Result<()> {
        self.check_evicted()?;
        let claim = self.claim(name, EntryType::Removed)?;
        let key = claim.key.clone();

        let mut meta = EntryMetadata::default();
        meta.complete()?;

        match &claim.existing {
            Some((entry, _)) => {
                let recorded = match entry.kind {
                    EntryKind::Removed { original } => original,
                    ref kind => kind.entry_type(),
                };
                if recorded != original {
                    return Err(Error::diverged(
                        &key,
                        format!("removed as {original}, recorded as {recorded}"),
                    ));
                }
                if entry.entry_type() == EntryType::Removed {
                    return Ok(());
                }

                let mut tombstone = entry.clone();
                tombstone.kind = EntryKind::Removed { original };
                {
                    let mut history = self.shared.history.lock();
                    history.remove_prefix(&format!("{key}/"));
                    history.remove_prefix(&iterations_prefix(&key));
                    history.update_entry(tombstone)?;
                    history.update_metadata(&key, meta)?;
                }
                debug!(
                    workflow_id = %self.shared.workflow_id,
                    entry = %key,
                    %original,
                    "entry replaced by tombstone"
                );
            }
            None => {
                let entry = self.new_entry(name, &claim, EntryKind::Removed { original });
                self.insert_entry(entry, meta)?;
            }
        }
        self.shared.flush().await
    }
}

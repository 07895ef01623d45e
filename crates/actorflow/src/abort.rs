//! Eviction and cancellation signals.

use tokio_util::sync::CancellationToken;

/// Abort signal observed by one workflow pass.
///
/// Two tokens are involved. The root token lives as long as the workflow and
/// is cancelled only by [`cancel`](Self::cancel); every pass gets a child of
/// it, which [`evict`](Self::evict) cancels on its own. Cancelling the root
/// therefore evicts the running pass as well, while evicting a pass leaves
/// the workflow free to run again.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    root: CancellationToken,
    pass: CancellationToken,
}

impl AbortSignal {
    pub fn new() -> Self {
        let root = CancellationToken::new();
        Self {
            pass: root.child_token(),
            root,
        }
    }

    /// Signal for the next pass of the same workflow.
    pub fn next_pass(&self) -> Self {
        Self {
            root: self.root.clone(),
            pass: self.root.child_token(),
        }
    }

    /// Interrupt the current pass only.
    pub fn evict(&self) {
        self.pass.cancel();
    }

    /// Interrupt the current pass and every future one.
    pub fn cancel(&self) {
        self.root.cancel();
    }

    pub fn is_evicted(&self) -> bool {
        self.pass.is_cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Resolves when the current pass is evicted or the workflow cancelled.
    pub async fn evicted(&self) {
        self.pass.cancelled().await
    }

    /// Resolves when the workflow is cancelled.
    pub async fn cancelled(&self) {
        self.root.cancelled().await
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.pass
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

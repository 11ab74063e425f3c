//! Cooperative cancellation flag shared by the controller and the worker.

use std::sync::Arc;

use tokio::sync::watch;

/// Two-state abort flag (clear / set).
///
/// Setting the flag is advisory: the worker checks it at row boundaries and
/// winds down on its own. Clones observe the same flag. Both sides may set or
/// clear it; the controller clears it at the start of every scan cycle.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortSignal {
    /// Create a flag in the clear state.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request cancellation.
    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    /// Return to the rest state.
    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Watch transitions of the flag.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolve once the flag is set (immediately if it already is).
    pub async fn wait_set(&self) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

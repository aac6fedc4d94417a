//! Global pause gate shared by every job.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Broadcast pause flag.
///
/// Jobs consult the gate before submitting each page fetch and before each
/// converter. Pausing never interrupts work already started; resuming wakes
/// every waiter at once.
#[derive(Debug, Clone)]
pub struct PauseGate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    /// Creates an open gate.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Closes the gate. Returns false if it was already closed.
    pub fn pause(&self) -> bool {
        let changed = self.tx.send_if_modified(|paused| {
            if *paused {
                false
            } else {
                *paused = true;
                true
            }
        });
        if changed {
            debug!("Pause gate closed");
        }
        changed
    }

    /// Opens the gate. Returns false if it was already open.
    pub fn resume(&self) -> bool {
        let changed = self.tx.send_if_modified(|paused| {
            if *paused {
                *paused = false;
                true
            } else {
                false
            }
        });
        if changed {
            debug!("Pause gate opened");
        }
        changed
    }

    /// Returns true while the gate is closed.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits until the gate is open.
    ///
    /// Returns `false` if `cancel` fires first.
    pub async fn wait_open(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            open = rx.wait_for(|paused| !*paused) => open.is_ok(),
        }
    }
}

//! Event-style flags used to coordinate session tasks.

use std::time::Duration;

use tokio::sync::watch;

/// A set/clear flag that any number of tasks can await.
///
/// Waiters observe the current value first: `wait` returns immediately when
/// the flag is already set. Setting an already-set flag is a no-op.
#[derive(Debug)]
pub struct Signal {
    tx: watch::Sender<bool>,
}

impl Signal {
    pub fn new(set: bool) -> Self {
        let (tx, _rx) = watch::channel(set);
        Self { tx }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the flag is set.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives inside `self`, so this cannot fail while we are
        // borrowed from it.
        let _ = rx.wait_for(|set| *set).await;
    }

    /// Wait until the flag is cleared.
    pub async fn wait_cleared(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|set| !*set).await;
    }

    /// Wait for the flag with a deadline. Returns `true` if the flag was set
    /// before the timeout elapsed.
    pub async fn wait_timeout(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.wait()).await.is_ok()
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new(false)
    }
}

//! A one-shot signal that releases all workers of a phase at once.

use std::sync::Arc;

use tokio::sync::watch;

/// Synchronizes the start of all workers.
///
/// Workers [`wait`](Self::wait) on a clone of the gate until it is [opened](Self::open). Opening
/// is a broadcast: every current and future waiter observes it, and the gate can never be closed
/// again.
#[derive(Clone, Debug)]
pub struct StartGate {
    sender: Arc<watch::Sender<bool>>,
}

impl StartGate {
    /// Creates a closed gate.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Creates a gate that is already open.
    pub fn opened() -> Self {
        let gate = Self::new();
        gate.open();
        gate
    }

    /// Releases all waiters.
    pub fn open(&self) {
        self.sender.send_replace(true);
    }

    /// Returns `true` if the gate has been opened.
    pub fn is_open(&self) -> bool {
        *self.sender.borrow()
    }

    /// Waits until the gate is opened.
    pub async fn wait(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = receiver.wait_for(|open| *open).await;
    }
}

impl Default for StartGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn open_releases_all_waiters() {
        let gate = StartGate::new();
        let released = Arc::new(AtomicUsize::new(0));

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                let released = Arc::clone(&released);
                tokio::spawn(async move {
                    gate.wait().await;
                    released.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(released.load(Ordering::SeqCst), 0);
        assert!(!gate.is_open());

        gate.open();
        futures::future::join_all(waiters).await;
        assert_eq!(released.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn waiting_on_open_gate_returns_immediately() {
        let gate = StartGate::opened();
        assert!(gate.is_open());
        tokio::time::timeout(Duration::from_secs(1), gate.wait())
            .await
            .unwrap();
    }
}

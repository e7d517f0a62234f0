//! Shutdown Signal Module
//!
//! Cooperative cancellation shared by the worker loop, the repairer and the
//! usage rollup chore. A signal is a `tokio::sync::watch` flag: once triggered
//! it stays triggered, and every clone observes it.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable, one-way shutdown flag
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been requested
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender is gone without triggering; never resolve
                std::future::pending::<()>().await;
            }
        }
    }

    /// A new signal that fires when this one fires, but can also be
    /// triggered on its own without affecting the parent.
    pub fn child(&self) -> Shutdown {
        let child = Shutdown::new();
        let parent = self.clone();
        let forward = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.triggered() => forward.trigger(),
                _ = forward.triggered() => {}
            }
        });
        child
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_wakes_waiters() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move { waiter.triggered().await });

        assert!(!shutdown.is_triggered());
        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(shutdown.is_triggered());

        // Already triggered resolves immediately
        tokio::time::timeout(Duration::from_millis(50), shutdown.triggered())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_child_follows_parent_but_not_reverse() {
        let parent = Shutdown::new();
        let child = parent.child();
        let other_child = parent.child();

        other_child.trigger();
        tokio::task::yield_now().await;
        assert!(!parent.is_triggered());
        assert!(!child.is_triggered());

        parent.trigger();
        tokio::time::timeout(Duration::from_secs(1), child.triggered())
            .await
            .unwrap();
    }
}

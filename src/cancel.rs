//! Hierarchical cancellation source (spec §5, §9): "a dedicated cancellation
//! source plus a stop signal channel the task selects on." Built on
//! `tokio::sync::Notify` rather than pulling in a dedicated crate, since nothing
//! in the example pack reaches for one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Clone)]
pub struct CancelSource {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelSource {
    pub fn new() -> Self {
        CancelSource {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called, including if it already was.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// A child source that is cancelled whenever this one is, but can also
    /// be cancelled independently (closing a parent cancels children).
    pub fn child(&self) -> CancelSource {
        let child = CancelSource::new();
        let parent = self.clone();
        let child_clone = child.clone();
        tokio::spawn(async move {
            parent.cancelled().await;
            child_clone.cancel();
        });
        child
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancelled_resolves_after_cancel() {
        let source = CancelSource::new();
        source.cancel();
        tokio::time::timeout(Duration::from_millis(50), source.cancelled())
            .await
            .expect("cancelled() should resolve immediately once cancelled");
    }

    #[tokio::test]
    async fn test_child_cancelled_when_parent_cancelled() {
        let parent = CancelSource::new();
        let child = parent.child();
        parent.cancel();
        tokio::time::timeout(Duration::from_millis(100), child.cancelled())
            .await
            .expect("child should observe parent cancellation");
    }

    #[tokio::test]
    async fn test_not_cancelled_by_default() {
        let source = CancelSource::new();
        assert!(!source.is_cancelled());
    }
}

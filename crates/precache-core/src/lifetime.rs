use std::future::Future;
use tokio_util::task::TaskTracker;

/// Keeps the host alive while event work is still in flight.
///
/// Every asynchronous branch that must outlive its event (install, activate,
/// fire-and-forget cache writes) is registered here. The host calls
/// [`Lifetime::settle`] before it tears the worker down.
#[derive(Clone, Default)]
pub struct Lifetime {
    tracker: TaskTracker,
}

impl Lifetime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` to completion even if the caller stops waiting for it.
    pub fn wait_until<F>(&self, work: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(work)
    }

    /// Number of registered tasks still running.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for every registered task. New work may be registered afterwards.
    pub async fn settle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

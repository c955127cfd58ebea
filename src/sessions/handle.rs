//! Handle to the background task that drives a session.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Owned by the registry entry of a session once its manager has spawned
/// the accept loop (port-forward) or tail loop (log stream).
#[derive(Debug)]
pub struct RelayHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { cancel, task }
    }

    /// Liveness probe: `true` once the task has returned or panicked.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the task without waiting for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel the task and wait up to `timeout` for it to exit, aborting it
    /// if it does not. On return every socket and upstream handle owned by
    /// the task has been dropped.
    pub async fn shutdown(self, timeout: Duration) {
        self.cancel.cancel();
        let mut task = self.task;
        if tokio::time::timeout(timeout, &mut task).await.is_err() {
            warn!("Session task ignored cancellation for {timeout:?}, aborting");
            task.abort();
            let _ = task.await;
        }
    }
}

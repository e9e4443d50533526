// Supervised auxiliary tasks (replication forwarder, change listener)
// owned by a connection manager.
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ChildStopError {
    #[error("child did not stop within {0:?}; aborted")]
    GraceExceeded(Duration),
    #[error("child panicked while stopping")]
    Panicked,
}

/// Cancellation handle plus liveness of one child task.
#[derive(Debug)]
pub struct ChildHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ChildHandle {
    pub fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { cancel, task }
    }

    /// Spawns `body` with a fresh cancellation token it is expected to honor.
    pub fn spawn<F, Fut>(body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(body(cancel.clone()));
        Self { cancel, task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Resolves when the child task exits on its own. Must not be polled
    /// again once it has resolved.
    pub(crate) async fn exited(&mut self) {
        let _ = (&mut self.task).await;
    }

    /// Cancels the child and waits up to `grace` for it to finish, aborting
    /// it past that point. Never waits longer than `grace`.
    pub async fn stop(mut self, grace: Duration) -> Result<(), ChildStopError> {
        self.cancel.cancel();
        if self.task.is_finished() {
            return Ok(());
        }
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) if err.is_cancelled() => Ok(()),
            Ok(Err(_)) => Err(ChildStopError::Panicked),
            Err(_) => {
                self.task.abort();
                Err(ChildStopError::GraceExceeded(grace))
            }
        }
    }
}

// A manager that unwinds without running its cleanup still cancels its children.
impl Drop for ChildHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

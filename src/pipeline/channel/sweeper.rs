use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handle for the background token sweeper.
///
/// The sweeper stops on `shutdown()`, when its channel shuts down, or when
/// the handle is dropped.
pub struct SweeperHandle {
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    pub(crate) fn new(stop: CancellationToken, handle: JoinHandle<()>) -> Self {
        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Stop the sweeper and wait for its task to exit.
    pub async fn join(mut self) {
        self.shutdown();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Token sweeper task ended abnormally");
            }
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

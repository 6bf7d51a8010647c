//! Graceful shutdown coordination via `CancellationToken`.

use std::sync::Arc;
use std::time::Duration;

use relay_stream::JobRegistry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default wait for in-flight jobs and tasks before giving up.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Coordinates graceful shutdown: one token shared by the accept loop and
/// every long-lived task, plus a drain path that cancels active jobs so
/// their subscribers get a terminal event before the process exits.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Get a clone of the shutdown token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Drain the server:
    ///
    /// 1. Cancel every registered job (producers see their tokens and
    ///    emit a cancelled terminal within their grace window)
    /// 2. Cancel the shutdown token so the accept loop stops
    /// 3. Wait up to `timeout` for the given handles to finish
    pub async fn graceful_shutdown(
        &self,
        registry: &Arc<JobRegistry>,
        handles: Vec<JoinHandle<()>>,
        timeout: Option<Duration>,
    ) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        registry.cancel_all();
        self.shutdown();
        info!(
            jobs = registry.len(),
            tasks = handles.len(),
            timeout_secs = timeout.as_secs(),
            "draining for shutdown"
        );

        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("shutdown timed out after {timeout:?}, some tasks may still be running");
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

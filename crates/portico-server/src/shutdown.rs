//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::{Result, ServerError};

/// Default timeout for joining tasks before aborting them.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Coordinates shutdown of the server's background tasks.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel, then join every task.
    ///
    /// Each task gets until the shared deadline; stragglers are aborted.
    /// Returns the faults reported by tasks that did finish, including
    /// panics.
    pub async fn graceful_shutdown(
        &self,
        handles: Vec<JoinHandle<Result<()>>>,
        timeout: Option<Duration>,
    ) -> Vec<ServerError> {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        self.shutdown();
        info!(
            task_count = handles.len(),
            timeout_ms = timeout.as_millis() as u64,
            "waiting for tasks to complete"
        );

        let deadline = tokio::time::Instant::now() + timeout;
        let mut faults = Vec::new();
        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => faults.push(err),
                Ok(Err(join_err)) => faults.push(ServerError::Listener(join_err.to_string())),
                Err(_) => {
                    warn!("shutdown timed out after {timeout:?}, aborting task");
                    handle.abort();
                }
            }
        }
        faults
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

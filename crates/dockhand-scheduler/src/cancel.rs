//! Per-job cancellation.

use dockhand_core::failure::JobFailure;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Which source stopped a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    UserRequested,
    DeadlineExceeded,
    Shutdown,
}

struct DeadlineTimer(JoinHandle<()>);

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Cancellation signal for one job run.
///
/// Fires on an explicit cancel, when the job's deadline passes, or when the
/// parent shutdown token is cancelled. The first source to fire is recorded.
#[derive(Clone)]
pub struct CancellationHandle {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
    timeout: Duration,
    _timer: Arc<DeadlineTimer>,
}

impl CancellationHandle {
    /// Start the deadline clock now. Must be called inside a tokio runtime.
    pub fn new(shutdown: &CancellationToken, timeout: Duration) -> Self {
        let token = shutdown.child_token();
        let reason = Arc::new(OnceLock::new());

        let timer = {
            let token = token.clone();
            let reason = reason.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        let _ = reason.set(CancelReason::DeadlineExceeded);
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            })
        };

        Self {
            token,
            reason,
            timeout,
            _timer: Arc::new(DeadlineTimer(timer)),
        }
    }

    pub fn cancel(&self, reason: CancelReason) {
        if !self.token.is_cancelled() {
            let _ = self.reason.set(reason);
        }
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Why the job was stopped, if it was.
    pub fn reason(&self) -> Option<CancelReason> {
        if !self.token.is_cancelled() {
            return None;
        }
        // Nothing recorded means the parent token fired.
        Some(self.reason.get().copied().unwrap_or(CancelReason::Shutdown))
    }

    /// The failure a stopped job ends with.
    pub fn failure(&self) -> Option<JobFailure> {
        self.reason().map(|reason| match reason {
            CancelReason::UserRequested => JobFailure::cancelled(),
            CancelReason::DeadlineExceeded => JobFailure::deadline_exceeded(self.timeout),
            CancelReason::Shutdown => JobFailure::shutdown(),
        })
    }
}

//! Streamed tool output and the per-step execution context.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Receives tool output line by line. Lines are already redacted.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn line(&self, stream: OutputStream, line: &str);
}

/// Sink that discards everything.
pub struct NullSink;

#[async_trait]
impl OutputSink for NullSink {
    async fn line(&self, _stream: OutputStream, _line: &str) {}
}

/// What a collaborator needs to run one step of a job.
#[derive(Clone)]
pub struct StepContext {
    /// Fires on cancel, deadline or shutdown; running tools must stop.
    pub cancel: CancellationToken,
    /// Destination for tool output.
    pub output: Arc<dyn OutputSink>,
}

impl StepContext {
    pub fn new(cancel: CancellationToken, output: Arc<dyn OutputSink>) -> Self {
        Self { cancel, output }
    }

    /// Context with a fresh token and a discarding sink.
    pub fn detached() -> Self {
        Self::new(CancellationToken::new(), Arc::new(NullSink))
    }
}

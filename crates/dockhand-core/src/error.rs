//! Error types for Dockhand.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// An external tool ran but did not succeed. `output` is already redacted.
    #[error("{program} exited with code {exit_code}")]
    CommandFailed {
        program: String,
        exit_code: i32,
        output: String,
    },

    #[error("no project file found under {0}")]
    ProjectNotFound(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("job queue is closed")]
    QueueClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Tool output attached to the error, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            Error::CommandFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

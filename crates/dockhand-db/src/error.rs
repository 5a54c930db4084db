//! Storage error types.

use dockhand_core::{Error, JobId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("duplicate job: {0}")]
    Duplicate(JobId),
}

impl From<DbError> for Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(_) => Error::NotFound(err.to_string()),
            DbError::Duplicate(_) => Error::Conflict(err.to_string()),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;

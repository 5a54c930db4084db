//! Job repository abstraction.

use async_trait::async_trait;

use crate::job::{JobFilter, JobRecord, LogEntry, Page};
use crate::{JobId, Result};

/// A change applied atomically to one record. Returning an error leaves the record untouched.
pub type JobMutation = Box<dyn FnOnce(&mut JobRecord) -> Result<()> + Send>;

/// Storage for job records and their logs.
///
/// Updates to the same id are serialized; different ids never contend.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a new record. Fails with `Conflict` if the id exists.
    async fn create(&self, record: JobRecord) -> Result<()>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>>;

    /// Apply `mutation` and return the updated record. `NotFound` if the id is unknown.
    async fn update(&self, id: JobId, mutation: JobMutation) -> Result<JobRecord>;

    /// Append a log entry and return it as stored. Timestamps are kept non-decreasing per job.
    async fn append_log(&self, id: JobId, entry: LogEntry) -> Result<LogEntry>;

    /// All log entries of a job in insertion order.
    async fn logs(&self, id: JobId) -> Result<Vec<LogEntry>>;

    /// Matching records, newest first, plus the total match count.
    async fn query(&self, filter: &JobFilter, page: Page) -> Result<(Vec<JobRecord>, usize)>;

    /// Evict a record and its logs. Returns whether it existed.
    async fn remove(&self, id: JobId) -> Result<bool>;
}

//! In-memory job repository.

use async_trait::async_trait;
use dockhand_core::job::{JobFilter, JobRecord, LogEntry, Page};
use dockhand_core::store::{JobMutation, JobRepository};
use dockhand_core::{JobId, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::{DbError, DbResult};

struct StoredJob {
    record: JobRecord,
    logs: Vec<LogEntry>,
}

/// Job records and logs kept in process memory.
///
/// The outer map lock is held only to find an entry; each job has its own
/// mutex, so writers to different jobs never wait on each other.
#[derive(Default)]
pub struct MemoryJobRepo {
    jobs: RwLock<HashMap<JobId, Arc<Mutex<StoredJob>>>>,
}

impl MemoryJobRepo {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, id: JobId) -> DbResult<Arc<Mutex<StoredJob>>> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(DbError::NotFound(id))
    }

    async fn insert(&self, record: JobRecord) -> DbResult<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&record.id) {
            return Err(DbError::Duplicate(record.id));
        }
        jobs.insert(
            record.id,
            Arc::new(Mutex::new(StoredJob {
                record,
                logs: Vec::new(),
            })),
        );
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepo {
    async fn create(&self, record: JobRecord) -> Result<()> {
        Ok(self.insert(record).await?)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        match self.entry(id).await {
            Ok(entry) => Ok(Some(entry.lock().await.record.clone())),
            Err(DbError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, id: JobId, mutation: JobMutation) -> Result<JobRecord> {
        let entry = self.entry(id).await?;
        let mut stored = entry.lock().await;
        // Mutate a copy so a rejected change leaves no trace.
        let mut next = stored.record.clone();
        mutation(&mut next)?;
        stored.record = next.clone();
        Ok(next)
    }

    async fn append_log(&self, id: JobId, mut entry: LogEntry) -> Result<LogEntry> {
        let stored = self.entry(id).await?;
        let mut stored = stored.lock().await;
        if let Some(last) = stored.logs.last() {
            if entry.timestamp < last.timestamp {
                entry.timestamp = last.timestamp;
            }
        }
        stored.logs.push(entry.clone());
        Ok(entry)
    }

    async fn logs(&self, id: JobId) -> Result<Vec<LogEntry>> {
        let entry = self.entry(id).await?;
        let stored = entry.lock().await;
        Ok(stored.logs.clone())
    }

    async fn query(&self, filter: &JobFilter, page: Page) -> Result<(Vec<JobRecord>, usize)> {
        let entries: Vec<_> = self.jobs.read().await.values().cloned().collect();

        let mut matched = Vec::new();
        for entry in entries {
            let stored = entry.lock().await;
            if filter.matches(&stored.record) {
                matched.push(stored.record.clone());
            }
        }

        // Newest first; ids are time-ordered so they break ties.
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let total = matched.len();
        let records = matched
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect();
        Ok((records, total))
    }

    async fn remove(&self, id: JobId) -> Result<bool> {
        Ok(self.jobs.write().await.remove(&id).is_some())
    }
}

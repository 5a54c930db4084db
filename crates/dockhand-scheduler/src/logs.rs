//! Per-job log fan-out.
//!
//! Each job gets a bounded channel, created on first publish or subscribe.
//! Every subscriber keeps its own read position, so any number of viewers
//! can follow the same job. Publishing never waits: when a channel is full
//! the oldest entry is dropped, and subscribers that fall behind skip ahead.

use async_trait::async_trait;
use dockhand_core::JobId;
use dockhand_core::job::{LogEntry, LogLevel};
use dockhand_core::output::{OutputSink, OutputStream};
use dockhand_core::store::JobRepository;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Live log entries of one job.
pub type LogStream = BoxStream<'static, LogEntry>;

struct ChannelState {
    entries: VecDeque<LogEntry>,
    /// Sequence number of `entries[0]`.
    first_seq: u64,
    completed: bool,
}

struct Channel {
    state: Mutex<ChannelState>,
    notify: Notify,
}

impl Channel {
    fn new() -> Self {
        Self {
            state: Mutex::new(ChannelState {
                entries: VecDeque::new(),
                first_seq: 0,
                completed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Next {
    Entry(LogEntry),
    Wait,
    Done,
}

/// Publishes job log entries to live subscribers.
pub struct LogBroadcaster {
    capacity: usize,
    channels: Mutex<HashMap<JobId, Arc<Channel>>>,
}

impl LogBroadcaster {
    /// `capacity` is the number of entries retained per job.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channel(&self, job_id: JobId) -> Arc<Channel> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(job_id)
            .or_insert_with(|| Arc::new(Channel::new()))
            .clone()
    }

    /// Append a new entry for `job_id` and return it.
    pub fn publish(&self, job_id: JobId, message: impl Into<String>, level: LogLevel) -> LogEntry {
        let entry = LogEntry::new(job_id, message, level);
        self.publish_entry(entry.clone());
        entry
    }

    /// Append an existing entry to its job's channel.
    pub fn publish_entry(&self, entry: LogEntry) {
        let channel = self.channel(entry.job_id);
        {
            let mut state = channel.state();
            if state.completed {
                return;
            }
            state.entries.push_back(entry);
            if state.entries.len() > self.capacity {
                state.entries.pop_front();
                state.first_seq += 1;
            }
        }
        channel.notify.notify_waiters();
    }

    /// Follow a job's log, starting with the entries still buffered.
    ///
    /// The stream ends once the job's channel is completed and drained.
    pub fn subscribe(&self, job_id: JobId) -> LogStream {
        let channel = self.channel(job_id);
        let start = channel.state().first_seq;

        futures::stream::unfold((channel, start), |(channel, mut next)| async move {
            let entry = loop {
                let notified = channel.notify.notified();
                tokio::pin!(notified);
                // Register before checking state so a publish in between is not missed.
                notified.as_mut().enable();

                let step = {
                    let state = channel.state();
                    if next < state.first_seq {
                        debug!(skipped = state.first_seq - next, "Log subscriber fell behind");
                        next = state.first_seq;
                    }
                    let index = (next - state.first_seq) as usize;
                    match state.entries.get(index) {
                        Some(entry) => Next::Entry(entry.clone()),
                        None if state.completed => Next::Done,
                        None => Next::Wait,
                    }
                };

                match step {
                    Next::Entry(entry) => break Some(entry),
                    Next::Done => break None,
                    Next::Wait => notified.await,
                }
            };
            entry.map(|entry| (entry, (channel, next + 1)))
        })
        .boxed()
    }

    /// No more entries will be published for `job_id`.
    ///
    /// Current subscribers drain what is buffered and then end.
    pub fn complete(&self, job_id: JobId) {
        let removed = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&job_id);
        if let Some(channel) = removed {
            channel.state().completed = true;
            channel.notify.notify_waiters();
        }
    }

    /// Number of jobs with an open channel.
    pub fn open_channels(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Writes a job's log to its record, its live channel and tracing.
#[derive(Clone)]
pub struct JobLogger {
    job_id: JobId,
    repo: Arc<dyn JobRepository>,
    logs: Arc<LogBroadcaster>,
}

impl JobLogger {
    pub fn new(job_id: JobId, repo: Arc<dyn JobRepository>, logs: Arc<LogBroadcaster>) -> Self {
        Self { job_id, repo, logs }
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry::new(self.job_id, message, level);
        match level {
            LogLevel::Debug => debug!(job_id = %self.job_id, "{}", entry.message),
            LogLevel::Info => info!(job_id = %self.job_id, "{}", entry.message),
            LogLevel::Warning => warn!(job_id = %self.job_id, "{}", entry.message),
            LogLevel::Error => error!(job_id = %self.job_id, "{}", entry.message),
        }
        self.store_and_publish(entry, "Failed to store log entry").await;
    }

    /// Live subscribers get the entry as stored, so they see the same timestamps as history.
    async fn store_and_publish(&self, entry: LogEntry, failure: &str) {
        let entry = match self.repo.append_log(self.job_id, entry.clone()).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "{}", failure);
                entry
            }
        };
        self.logs.publish_entry(entry);
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message).await
    }

    pub async fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message).await
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message).await
    }
}

#[async_trait]
impl OutputSink for JobLogger {
    async fn line(&self, _stream: OutputStream, line: &str) {
        let entry = LogEntry::new(self.job_id, line, LogLevel::Info);
        debug!(job_id = %self.job_id, "{}", line);
        self.store_and_publish(entry, "Failed to store tool output").await;
    }
}

//! The build service: entry point for submitting and managing jobs.

use dockhand_config::SystemConfig;
use dockhand_core::failure::JobFailure;
use dockhand_core::job::{JobDescriptor, JobFilter, JobRecord, JobStatus, LogEntry, Page};
use dockhand_core::store::JobRepository;
use dockhand_core::{Error, JobId, Result};
use dockhand_executor::redact::redact_patterns;
use futures::StreamExt;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelReason;
use crate::dispatcher::{ActiveJobs, Dispatcher};
use crate::logs::{LogBroadcaster, LogStream};
use crate::pipeline::{Collaborators, Pipeline};
use crate::queue::JobQueue;

/// Runtime settings of a [`BuildService`].
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub job_timeout: Duration,
    pub log_buffer: usize,
    pub work_dir: PathBuf,
}

impl From<&SystemConfig> for ServiceConfig {
    fn from(config: &SystemConfig) -> Self {
        Self {
            workers: config.workers,
            queue_capacity: config.queue_capacity,
            job_timeout: config.job_timeout,
            log_buffer: config.log_buffer,
            work_dir: config.work_dir.clone(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::from(&SystemConfig::default())
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    /// Jobs waiting in the queue.
    pub queued: usize,
    pub queue_capacity: usize,
    /// Jobs holding a worker.
    pub active_jobs: usize,
    pub workers: usize,
}

pub struct BuildService {
    queue: Arc<JobQueue>,
    pipeline: Arc<Pipeline>,
    repo: Arc<dyn JobRepository>,
    logs: Arc<LogBroadcaster>,
    active: Arc<ActiveJobs>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    workers: usize,
}

impl BuildService {
    /// Build the service and start its dispatcher. Must be called inside a tokio runtime.
    pub fn start(config: ServiceConfig, collaborators: Collaborators) -> Arc<Self> {
        let repo = collaborators.repo.clone();
        let logs = Arc::new(LogBroadcaster::new(config.log_buffer));
        let pipeline = Arc::new(Pipeline::new(collaborators, logs.clone(), config.work_dir));
        let queue = Arc::new(JobQueue::new(config.queue_capacity));
        let active = Arc::new(ActiveJobs::new());
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let workers = config.workers.max(1);

        let dispatcher = Dispatcher::new(
            queue.clone(),
            pipeline.clone(),
            active.clone(),
            workers,
            config.job_timeout,
            shutdown.clone(),
            tracker.clone(),
        );
        let handle = tokio::spawn(dispatcher.run());

        Arc::new(Self {
            queue,
            pipeline,
            repo,
            logs,
            active,
            shutdown,
            tracker,
            dispatcher: Mutex::new(Some(handle)),
            workers,
        })
    }

    /// Validate and queue a job. Waits while the queue is full.
    pub async fn submit(&self, descriptor: JobDescriptor) -> Result<JobId> {
        if self.shutdown.is_cancelled() || self.queue.is_closed() {
            return Err(Error::QueueClosed);
        }
        descriptor.validate()?;

        let job_id = descriptor.id;
        self.repo.create(JobRecord::new(descriptor.clone())).await?;
        self.pipeline
            .logger(job_id)
            .info(format!(
                "Job queued: {} from {} (branch {})",
                descriptor.image_ref(),
                redact_patterns(&descriptor.source.location),
                descriptor.source.branch
            ))
            .await;

        if let Err(e) = self.queue.enqueue(descriptor).await {
            self.abandon(job_id, JobFailure::shutdown()).await;
            return Err(e);
        }
        Ok(job_id)
    }

    pub async fn status(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        self.repo.get(job_id).await
    }

    /// Request cancellation. Returns false if the job already finished.
    pub async fn cancel(&self, job_id: JobId) -> Result<bool> {
        let record = self.require(job_id).await?;
        if record.status.is_terminal() {
            return Ok(false);
        }

        // A queued job may still have the handle of its previous run registered.
        if record.status == JobStatus::Queued && self.abandon(job_id, JobFailure::cancelled()).await {
            return Ok(true);
        }
        // A run leaves Queued only after its handle is registered.
        let cancelled = self.active.cancel(job_id, CancelReason::UserRequested);
        if cancelled {
            info!(job_id = %job_id, "Cancellation requested");
        }
        Ok(cancelled)
    }

    /// Requeue a failed job under the same id and return its descriptor.
    pub async fn retry(&self, job_id: JobId) -> Result<JobDescriptor> {
        if self.shutdown.is_cancelled() {
            return Err(Error::QueueClosed);
        }
        let record = self
            .repo
            .update(job_id, Box::new(|r: &mut JobRecord| r.reset_for_retry()))
            .await?;
        let descriptor = record.descriptor;

        self.pipeline
            .logger(job_id)
            .info(format!("Retrying job (attempt {})", record.attempt + 1))
            .await;
        if let Err(e) = self.queue.enqueue(descriptor.clone()).await {
            self.abandon(job_id, JobFailure::shutdown()).await;
            return Err(e);
        }
        Ok(descriptor)
    }

    /// Follow a job's log. For a finished job the stored history is replayed.
    pub async fn subscribe_logs(&self, job_id: JobId) -> Result<LogStream> {
        // Subscribe before reading the record so nothing published in between is lost.
        let live = self.logs.subscribe(job_id);
        let record = match self.repo.get(job_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.logs.complete(job_id);
                return Err(not_found(job_id));
            }
            Err(e) => {
                self.logs.complete(job_id);
                return Err(e);
            }
        };

        if record.status.is_terminal() {
            drop(live);
            self.logs.complete(job_id);
            let history = self.repo.logs(job_id).await?;
            return Ok(futures::stream::iter(history).boxed());
        }
        Ok(live)
    }

    /// Every stored log entry of a job.
    pub async fn logs(&self, job_id: JobId) -> Result<Vec<LogEntry>> {
        self.require(job_id).await?;
        self.repo.logs(job_id).await
    }

    /// Jobs matching `filter`, newest first, with the total match count.
    pub async fn list(&self, filter: &JobFilter, page: Page) -> Result<(Vec<JobRecord>, usize)> {
        self.repo.query(filter, page).await
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            queued: self.queue.len(),
            queue_capacity: self.queue.capacity(),
            active_jobs: self.active.len(),
            workers: self.workers,
        }
    }

    /// Drop a finished job and its log. Returns false if the id is unknown.
    pub async fn evict(&self, job_id: JobId) -> Result<bool> {
        let Some(record) = self.repo.get(job_id).await? else {
            return Ok(false);
        };
        if !record.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "job {} is {}; only finished jobs can be evicted",
                job_id, record.status
            )));
        }
        let removed = self.repo.remove(job_id).await?;
        self.logs.complete(job_id);
        debug!(job_id = %job_id, "Evicted job");
        Ok(removed)
    }

    /// Stop accepting jobs, cancel everything and wait for running pipelines to clean up.
    pub async fn shutdown(&self) {
        info!("Shutting down build service");
        self.queue.close();
        self.shutdown.cancel();

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                error!(error = %e, "Dispatcher task failed");
            }
        }

        let drained = self.queue.drain().await.len();
        let filter = JobFilter {
            status: Some(JobStatus::Queued),
            ..Default::default()
        };
        let page = Page {
            offset: 0,
            limit: usize::MAX,
        };
        match self.repo.query(&filter, page).await {
            Ok((waiting, _)) => {
                for record in waiting {
                    self.abandon(record.id, JobFailure::shutdown()).await;
                }
            }
            Err(e) => warn!(error = %e, "Failed to list queued jobs"),
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!(drained, "Build service stopped");
    }

    /// End a job that never started. Returns false if it is no longer Queued.
    async fn abandon(&self, job_id: JobId, failure: JobFailure) -> bool {
        let message = failure.message.clone();
        let result = self
            .repo
            .update(
                job_id,
                Box::new(move |r: &mut JobRecord| {
                    if r.status != JobStatus::Queued {
                        return Err(Error::Conflict(format!("job is {}", r.status)));
                    }
                    r.finish_with(&failure)
                }),
            )
            .await;

        match result {
            Ok(_) => {
                self.pipeline.logger(job_id).warn(message).await;
                self.logs.complete(job_id);
                true
            }
            Err(e) => {
                debug!(job_id = %job_id, error = %e, "Job not abandoned");
                false
            }
        }
    }

    async fn require(&self, job_id: JobId) -> Result<JobRecord> {
        self.repo.get(job_id).await?.ok_or_else(|| not_found(job_id))
    }
}

fn not_found(job_id: JobId) -> Error {
    Error::NotFound(format!("job {}", job_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationHandle;
    use crate::test_support::{Gate, Harness, MockImages, MockSource, descriptor};
    use dockhand_core::failure::FailureKind;
    use dockhand_core::job::ImageTarget;
    use std::sync::atomic::Ordering;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn gated() -> MockImages {
        MockImages {
            build_gate: Some(Gate::closed()),
            ..Default::default()
        }
    }

    fn release(harness: &Harness, passes: usize) {
        if let Some(gate) = &harness.images.build_gate {
            gate.release(passes);
        }
    }

    #[tokio::test]
    async fn test_submit_runs_to_completion() {
        let harness = Harness::start(2, TIMEOUT, MockSource::default(), MockImages::default());
        let id = harness.service.submit(descriptor("shop-api")).await.unwrap();

        let record = harness.wait_terminal(id).await;
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.image_ref.as_deref(), Some("shop-api:latest"));
        assert_eq!(record.attempt, 0);
        assert!(record.error.is_none());

        let logs = harness.service.logs(id).await.unwrap();
        assert!(logs[0].message.starts_with("Job queued"));
        assert!(logs.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_invalid_descriptor_is_rejected() {
        let harness = Harness::start(1, TIMEOUT, MockSource::default(), MockImages::default());
        let mut job = descriptor("shop-api");
        job.image = ImageTarget::new("Shop Api", "latest");
        let id = job.id;

        let err = harness.service.submit(job).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(harness.service.status(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_while_queued_never_clones() {
        let harness = Harness::start(1, TIMEOUT, MockSource::default(), gated());
        let first = harness.service.submit(descriptor("first")).await.unwrap();
        harness.wait_for(first, |r| r.status == JobStatus::Building).await;

        let second = harness.service.submit(descriptor("second")).await.unwrap();
        assert!(harness.service.cancel(second).await.unwrap());
        let record = harness.record(second).await;
        assert_eq!(record.status, JobStatus::Cancelled);
        assert_eq!(record.failure, Some(FailureKind::Cancelled));

        release(&harness, 1);
        assert_eq!(harness.wait_terminal(first).await.status, JobStatus::Completed);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(harness.source.clones.load(Ordering::SeqCst), 1);
        let record = harness.record(second).await;
        assert_eq!(record.status, JobStatus::Cancelled);
        assert!(record.started_at.is_none());
        assert!(!harness.service.cancel(second).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_mid_pipeline_cleans_up_once() {
        let harness = Harness::start(1, TIMEOUT, MockSource::default(), gated());
        let id = harness.service.submit(descriptor("shop-api")).await.unwrap();
        harness.wait_for(id, |r| r.status == JobStatus::Building).await;
        let workspace = harness.work_dir.path().join(id.to_string());
        assert!(workspace.exists());

        assert!(harness.service.cancel(id).await.unwrap());
        let record = harness.wait_terminal(id).await;
        assert_eq!(record.status, JobStatus::Cancelled);
        assert_eq!(record.failure, Some(FailureKind::Cancelled));
        assert!(!workspace.exists());
        assert_eq!(harness.images.publishes.load(Ordering::SeqCst), 0);

        let logs = harness.service.logs(id).await.unwrap();
        let cleanups = logs.iter().filter(|l| l.message == "Cleaning up").count();
        assert_eq!(cleanups, 1);
    }

    #[tokio::test]
    async fn test_build_failure_marks_failed() {
        let images = MockImages {
            build_error: Some("error: no space left on device".to_string()),
            ..Default::default()
        };
        let harness = Harness::start(1, TIMEOUT, MockSource::default(), images);
        let id = harness.service.submit(descriptor("shop-api")).await.unwrap();

        let record = harness.wait_terminal(id).await;
        assert_eq!(record.status, JobStatus::Failed);
        assert!(matches!(record.failure, Some(FailureKind::Build(_))));
        assert!(!record.error.unwrap().is_empty());
        assert_eq!(harness.images.publishes.load(Ordering::SeqCst), 0);
        assert!(!harness.work_dir.path().join(id.to_string()).exists());
    }

    #[tokio::test]
    async fn test_timeout_fails_with_deadline_exceeded() {
        let images = MockImages {
            build_delay: Some(Duration::from_secs(10)),
            ..Default::default()
        };
        let harness = Harness::start(1, Duration::from_millis(300), MockSource::default(), images);

        let started = std::time::Instant::now();
        let id = harness.service.submit(descriptor("shop-api")).await.unwrap();
        let record = harness.wait_terminal(id).await;

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.failure, Some(FailureKind::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_retry_reruns_failed_job() {
        let images = MockImages {
            flaky_builds: 1.into(),
            ..Default::default()
        };
        let harness = Harness::start(1, TIMEOUT, MockSource::default(), images);
        let id = harness.service.submit(descriptor("shop-api")).await.unwrap();
        let failed = harness.wait_terminal(id).await;
        assert_eq!(failed.status, JobStatus::Failed);

        let descriptor = harness.service.retry(id).await.unwrap();
        assert_eq!(descriptor.id, id);

        let record = harness
            .wait_for(id, |r| r.status == JobStatus::Completed)
            .await;
        assert_eq!(record.attempt, 1);
        assert!(record.error.is_none());
        assert!(record.failure.is_none());
        assert_eq!(harness.source.clones.load(Ordering::SeqCst), 2);

        let err = harness.service.retry(id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_cancel_requeued_job_ignores_previous_run() {
        let images = MockImages {
            flaky_builds: 1.into(),
            ..gated()
        };
        let harness = Harness::start(1, TIMEOUT, MockSource::default(), images);
        let id = harness.service.submit(descriptor("shop-api")).await.unwrap();
        release(&harness, 1);
        assert_eq!(harness.wait_terminal(id).await.status, JobStatus::Failed);

        let blocker = harness.service.submit(descriptor("blocker")).await.unwrap();
        harness.wait_for(blocker, |r| r.status == JobStatus::Building).await;
        harness.service.retry(id).await.unwrap();

        // The first run's handle is still registered.
        let stale = CancellationHandle::new(&CancellationToken::new(), TIMEOUT);
        harness.service.active.register(id, stale.clone());

        assert!(harness.service.cancel(id).await.unwrap());
        assert!(!stale.is_cancelled());
        let record = harness.record(id).await;
        assert_eq!(record.status, JobStatus::Cancelled);
        assert_eq!(record.failure, Some(FailureKind::Cancelled));

        release(&harness, 1);
        assert_eq!(harness.wait_terminal(blocker).await.status, JobStatus::Completed);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(harness.record(id).await.status, JobStatus::Cancelled);
        assert_eq!(harness.source.clones.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_rejects_running_job() {
        let harness = Harness::start(1, TIMEOUT, MockSource::default(), gated());
        let id = harness.service.submit(descriptor("shop-api")).await.unwrap();
        harness.wait_for(id, |r| r.status == JobStatus::Building).await;

        assert!(matches!(harness.service.retry(id).await, Err(Error::Conflict(_))));
        assert!(matches!(harness.service.retry(JobId::new()).await, Err(Error::NotFound(_))));
        release(&harness, 1);
        harness.wait_terminal(id).await;
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure() {
        let harness = Harness::with_queue(1, 1, TIMEOUT, MockSource::default(), gated());
        let service = harness.service.clone();

        let first = service.submit(descriptor("first")).await.unwrap();
        harness.wait_for(first, |r| r.status == JobStatus::Building).await;
        // The dispatcher takes this one off the queue and waits for a worker.
        let second = service.submit(descriptor("second")).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while service.stats().queued > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let third = service.submit(descriptor("third")).await.unwrap();
        assert_eq!(service.stats().queued, 1);

        let fourth = {
            let service = service.clone();
            tokio::spawn(async move { service.submit(descriptor("fourth")).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!fourth.is_finished());

        release(&harness, 4);
        let fourth = fourth.await.unwrap().unwrap();
        for id in [first, second, third, fourth] {
            assert_eq!(harness.wait_terminal(id).await.status, JobStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_log_subscription() {
        let harness = Harness::start(1, TIMEOUT, MockSource::default(), gated());
        let id = harness.service.submit(descriptor("shop-api")).await.unwrap();
        let live = harness.service.subscribe_logs(id).await.unwrap();
        let second_viewer = harness.service.subscribe_logs(id).await.unwrap();

        release(&harness, 1);
        let entries: Vec<LogEntry> = tokio::time::timeout(Duration::from_secs(5), live.collect())
            .await
            .unwrap();
        let messages: Vec<&str> = entries.iter().map(|e| e.message.as_str()).collect();
        assert!(messages.iter().any(|m| m.starts_with("Cloning")));
        assert!(messages.iter().any(|m| m.starts_with("Build succeeded")));
        assert_eq!(messages.last(), Some(&"Cleaning up"));

        let other: Vec<LogEntry> = second_viewer.collect().await;
        assert_eq!(other.len(), entries.len());

        // A finished job replays its stored history.
        harness.wait_terminal(id).await;
        let replay: Vec<LogEntry> = harness.service.subscribe_logs(id).await.unwrap().collect().await;
        assert_eq!(replay.len(), harness.service.logs(id).await.unwrap().len());
        assert!(matches!(
            harness.service.subscribe_logs(JobId::new()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_and_stats() {
        let harness = Harness::start(1, TIMEOUT, MockSource::default(), gated());
        let a = harness.service.submit(descriptor("orders-api")).await.unwrap();
        harness.wait_for(a, |r| r.status == JobStatus::Building).await;
        harness.service.submit(descriptor("orders-worker")).await.unwrap();
        harness.service.submit(descriptor("billing-api")).await.unwrap();

        let filter = JobFilter {
            image: Some("orders".to_string()),
            ..Default::default()
        };
        let (records, total) = harness.service.list(&filter, Page::default()).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(records[0].descriptor.image.name, "orders-worker");

        let page = Page { offset: 0, limit: 1 };
        let (records, total) = harness.service.list(&JobFilter::default(), page).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(records.len(), 1);

        let stats = harness.service.stats();
        assert_eq!(stats.workers, 1);
        assert_eq!(stats.active_jobs, 1);
        assert_eq!(stats.queue_capacity, 100);

        release(&harness, 3);
    }

    #[tokio::test]
    async fn test_evict_only_finished_jobs() {
        let harness = Harness::start(1, TIMEOUT, MockSource::default(), gated());
        let id = harness.service.submit(descriptor("shop-api")).await.unwrap();
        harness.wait_for(id, |r| r.status == JobStatus::Building).await;
        assert!(matches!(harness.service.evict(id).await, Err(Error::Conflict(_))));

        release(&harness, 1);
        harness.wait_terminal(id).await;
        assert!(harness.service.evict(id).await.unwrap());
        assert!(harness.service.status(id).await.unwrap().is_none());
        assert!(!harness.service.evict(id).await.unwrap());
        assert!(matches!(harness.service.cancel(id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_and_queued() {
        let harness = Harness::start(1, TIMEOUT, MockSource::default(), gated());
        let running = harness.service.submit(descriptor("running")).await.unwrap();
        harness.wait_for(running, |r| r.status == JobStatus::Building).await;
        let waiting = harness.service.submit(descriptor("waiting")).await.unwrap();
        let behind = harness.service.submit(descriptor("behind")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(10), harness.service.shutdown())
            .await
            .unwrap();

        for id in [running, waiting, behind] {
            let record = harness.record(id).await;
            assert_eq!(record.status, JobStatus::Cancelled);
            assert!(record.error.unwrap().contains("shutting down"));
        }
        assert!(!harness.work_dir.path().join(running.to_string()).exists());
        assert_eq!(harness.source.clones.load(Ordering::SeqCst), 1);
        assert_eq!(harness.service.stats().active_jobs, 0);

        let err = harness.service.submit(descriptor("late")).await.unwrap_err();
        assert!(matches!(err, Error::QueueClosed));
    }

    #[test]
    fn test_config_from_system_config() {
        let system = SystemConfig {
            workers: 6,
            ..Default::default()
        };
        let config = ServiceConfig::from(&system);
        assert_eq!(config.workers, 6);
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.job_timeout, Duration::from_secs(1800));
    }
}

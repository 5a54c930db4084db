//! Hands queued jobs to pipeline tasks under a concurrency limit.

use dockhand_core::JobId;
use dockhand_core::job::{JobDescriptor, JobStatus};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::cancel::{CancelReason, CancellationHandle};
use crate::pipeline::Pipeline;
use crate::queue::JobQueue;

/// Cancellation handles of the jobs currently running.
#[derive(Default)]
pub struct ActiveJobs {
    handles: Mutex<HashMap<JobId, (u64, CancellationHandle)>>,
    generation: AtomicU64,
}

impl ActiveJobs {
    pub fn new() -> Self {
        Self::default()
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<JobId, (u64, CancellationHandle)>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a run of `job_id`. The returned generation identifies this run.
    pub(crate) fn register(&self, job_id: JobId, handle: CancellationHandle) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        self.handles().insert(job_id, (generation, handle));
        generation
    }

    /// Forget a run, unless a newer run of the same job replaced it.
    fn unregister(&self, job_id: JobId, generation: u64) {
        let mut handles = self.handles();
        if handles.get(&job_id).is_some_and(|(g, _)| *g == generation) {
            handles.remove(&job_id);
        }
    }

    pub fn get(&self, job_id: JobId) -> Option<CancellationHandle> {
        self.handles().get(&job_id).map(|(_, h)| h.clone())
    }

    /// Fire the cancellation of a running job. Returns false if it is not running.
    pub fn cancel(&self, job_id: JobId, reason: CancelReason) -> bool {
        match self.get(job_id) {
            Some(handle) => {
                handle.cancel(reason);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.handles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holds a worker permit for one job run; releases it and unregisters the run on drop.
struct ActiveGuard {
    jobs: Arc<ActiveJobs>,
    job_id: JobId,
    generation: u64,
    _permit: OwnedSemaphorePermit,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.jobs.unregister(self.job_id, self.generation);
    }
}

/// Pulls jobs off the queue and runs each one as its own task.
pub struct Dispatcher {
    queue: Arc<JobQueue>,
    pipeline: Arc<Pipeline>,
    active: Arc<ActiveJobs>,
    permits: Arc<Semaphore>,
    workers: usize,
    job_timeout: Duration,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<JobQueue>,
        pipeline: Arc<Pipeline>,
        active: Arc<ActiveJobs>,
        workers: usize,
        job_timeout: Duration,
        shutdown: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        let workers = workers.max(1);
        Self {
            queue,
            pipeline,
            active,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            job_timeout,
            shutdown,
            tracker,
        }
    }

    /// Dispatch until shutdown or until the queue is closed and empty.
    pub async fn run(self) {
        info!(workers = self.workers, timeout = ?self.job_timeout, "Dispatcher started");

        loop {
            let descriptor = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = self.queue.dequeue() => match next {
                    Some(descriptor) => descriptor,
                    None => break,
                },
            };

            if !self.still_queued(descriptor.id).await {
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!(job_id = %descriptor.id, "Shutdown while waiting for a worker");
                    break;
                }
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            self.spawn_job(descriptor, permit);
        }

        info!("Dispatcher stopped");
    }

    async fn still_queued(&self, job_id: JobId) -> bool {
        match self.pipeline.repo().get(job_id).await {
            Ok(Some(record)) if record.status == JobStatus::Queued => true,
            Ok(Some(record)) => {
                debug!(job_id = %job_id, status = %record.status, "Skipping job that is no longer queued");
                false
            }
            Ok(None) => {
                debug!(job_id = %job_id, "Skipping evicted job");
                false
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to load queued job");
                false
            }
        }
    }

    fn spawn_job(&self, descriptor: JobDescriptor, permit: OwnedSemaphorePermit) {
        let job_id = descriptor.id;
        // The deadline runs from dispatch, not from submission.
        let handle = CancellationHandle::new(&self.shutdown, self.job_timeout);
        let guard = ActiveGuard {
            jobs: self.active.clone(),
            job_id,
            generation: self.active.register(job_id, handle.clone()),
            _permit: permit,
        };
        let pipeline = self.pipeline.clone();

        debug!(job_id = %job_id, "Dispatching job");
        self.tracker.spawn(async move {
            let _guard = guard;
            let run = {
                let pipeline = pipeline.clone();
                tokio::spawn(async move { pipeline.run(descriptor, handle).await })
            };
            match run.await {
                Ok(status) => debug!(job_id = %job_id, status = ?status, "Job task finished"),
                Err(e) => {
                    let message = if e.is_panic() {
                        panic_message(e.into_panic())
                    } else {
                        "job task was aborted".to_string()
                    };
                    error!(job_id = %job_id, error = %message, "Job task died");
                    pipeline.fail_internal(job_id, &message).await;
                }
            }
        });
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return s.to_string();
    }
    match payload.downcast::<String>() {
        Ok(s) => *s,
        Err(_) => "job task panicked".to_string(),
    }
}

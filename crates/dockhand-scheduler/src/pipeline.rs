//! The build pipeline for a single job.
//!
//! Steps run in order: clone, detect, render, build, authenticate, publish.
//! Cancellation is checked before every step. Whatever happens, cleanup
//! removes the workspace and the local image, then the job gets its
//! terminal status and its log channel is completed.

use dockhand_core::failure::{FailureKind, JobFailure};
use dockhand_core::image::ImageBuilder;
use dockhand_core::job::{JobDescriptor, JobRecord, JobStatus};
use dockhand_core::output::StepContext;
use dockhand_core::source::{SourceControlClient, component_name_fallback};
use dockhand_core::store::{JobMutation, JobRepository};
use dockhand_core::template::{Placeholders, TemplateRenderer};
use dockhand_core::{Error, JobId, Result};
use dockhand_executor::redact::redact_patterns;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationHandle;
use crate::logs::{JobLogger, LogBroadcaster};

/// How long a step may keep running after its job was cancelled.
const STEP_GRACE: Duration = Duration::from_secs(5);

/// External services a pipeline delegates to.
#[derive(Clone)]
pub struct Collaborators {
    pub repo: Arc<dyn JobRepository>,
    pub source: Arc<dyn SourceControlClient>,
    pub images: Arc<dyn ImageBuilder>,
    pub templates: Arc<dyn TemplateRenderer>,
}

/// Runs jobs end to end.
#[derive(Clone)]
pub struct Pipeline {
    repo: Arc<dyn JobRepository>,
    source: Arc<dyn SourceControlClient>,
    images: Arc<dyn ImageBuilder>,
    templates: Arc<dyn TemplateRenderer>,
    logs: Arc<LogBroadcaster>,
    work_dir: PathBuf,
}

impl Pipeline {
    pub fn new(collaborators: Collaborators, logs: Arc<LogBroadcaster>, work_dir: PathBuf) -> Self {
        Self {
            repo: collaborators.repo,
            source: collaborators.source,
            images: collaborators.images,
            templates: collaborators.templates,
            logs,
            work_dir,
        }
    }

    pub fn repo(&self) -> &Arc<dyn JobRepository> {
        &self.repo
    }

    pub fn logger(&self, job_id: JobId) -> JobLogger {
        JobLogger::new(job_id, self.repo.clone(), self.logs.clone())
    }

    /// Directory holding everything a job writes to disk.
    pub fn workspace(&self, job_id: JobId) -> PathBuf {
        self.work_dir.join(job_id.to_string())
    }

    /// Run one attempt of a job and return its final status.
    ///
    /// A job that is no longer Queued (cancelled while waiting, or evicted)
    /// is left untouched.
    pub async fn run(&self, descriptor: JobDescriptor, handle: CancellationHandle) -> Option<JobStatus> {
        let job_id = descriptor.id;
        let logger = self.logger(job_id);

        // Stopped before it got a chance to start.
        if let Some(failure) = handle.failure() {
            return self.finish_unstarted(job_id, failure, &logger).await;
        }

        if let Err(e) = self.update(job_id, |r| r.transition(JobStatus::Cloning)).await {
            debug!(job_id = %job_id, error = %e, "Job not started");
            return None;
        }

        let workspace = self.workspace(job_id);
        let image_ref = descriptor.image_ref();
        let mut built = false;

        info!(job_id = %job_id, image = %image_ref, "Starting build pipeline");
        let outcome = self
            .execute(&descriptor, &handle, &logger, &workspace, &mut built)
            .await;

        match &outcome {
            Ok(()) => logger.info(format!("Build succeeded: {}", image_ref)).await,
            Err(failure) if failure.kind.is_cancellation() => logger.warn(&failure.message).await,
            Err(failure) => logger.error(&failure.message).await,
        }

        self.cleanup(&workspace, built.then_some(image_ref.as_str()), &logger)
            .await;

        let status = self.finish(job_id, outcome.err(), image_ref).await;
        self.logs.complete(job_id);
        status
    }

    async fn execute(
        &self,
        descriptor: &JobDescriptor,
        handle: &CancellationHandle,
        logger: &JobLogger,
        workspace: &Path,
        built: &mut bool,
    ) -> std::result::Result<(), JobFailure> {
        let job_id = descriptor.id;
        let ctx = StepContext::new(handle.token().clone(), Arc::new(logger.clone()));
        let checkout = workspace.join("src");
        let image_ref = descriptor.image_ref();
        let branch = descriptor.source.branch.clone();

        // Clone
        checkpoint(handle)?;
        tokio::fs::create_dir_all(workspace)
            .await
            .map_err(|e| JobFailure::internal(&Error::Io(e)))?;
        logger
            .info(format!(
                "Cloning {} (branch {})",
                redact_patterns(&descriptor.source.location),
                branch
            ))
            .await;
        let revision = self
            .guarded(
                handle,
                self.source
                    .clone_repository(&descriptor.source, &checkout, &ctx),
            )
            .await
            .map_err(|e| step_failure(handle, &e, |e| JobFailure::source_fetch(e, &branch)))?;
        logger.info(format!("Checked out revision {}", revision)).await;
        self.record(job_id, move |r| r.artifacts.revision = Some(revision))
            .await?;

        // Detect
        checkpoint(handle)?;
        self.transition(job_id, JobStatus::Building).await?;
        let detected = self
            .source
            .detect_project_file(&checkout)
            .await
            .map_err(|e| match e {
                Error::ProjectNotFound(_) => JobFailure::project_not_found(),
                other => step_failure(handle, &other, JobFailure::internal),
            })?;
        if detected.fell_back {
            logger
                .warn(format!(
                    "Found {} project files and none is an executable or API project; using {}",
                    detected.candidates, detected.relative_path
                ))
                .await;
        }
        let project_path = detected.relative_path;
        let component_name = self
            .source
            .extract_component_name(&checkout.join(&project_path))
            .await
            .map_err(|e| step_failure(handle, &e, JobFailure::internal))?
            .unwrap_or_else(|| component_name_fallback(&project_path));
        logger
            .info(format!(
                "Using project {} (component {})",
                project_path, component_name
            ))
            .await;

        // Render
        checkpoint(handle)?;
        let placeholders = Placeholders::for_project(&project_path, &component_name);
        let content = self
            .templates
            .render(descriptor.variant, &placeholders)
            .map_err(|e| JobFailure::internal(&e))?;
        let build_file = workspace.join("Dockerfile");
        tokio::fs::write(&build_file, &content)
            .await
            .map_err(|e| JobFailure::internal(&Error::Io(e)))?;
        logger
            .info(format!("Rendered {} build file", descriptor.variant))
            .await;
        self.record(job_id, move |r| {
            r.artifacts.project_path = Some(project_path);
            r.artifacts.component_name = Some(component_name);
            r.artifacts.build_file = Some(content);
        })
        .await?;

        // Build
        checkpoint(handle)?;
        logger.info(format!("Building image {}", image_ref)).await;
        self.guarded(
            handle,
            self.images
                .build(&checkout, &build_file, &image_ref, &descriptor.options, &ctx),
        )
        .await
        .map_err(|e| step_failure(handle, &e, JobFailure::build))?;
        *built = true;

        // Authenticate
        checkpoint(handle)?;
        self.transition(job_id, JobStatus::Pushing).await?;
        if descriptor.registry.credential.is_some() {
            logger
                .info(format!(
                    "Authenticating with registry {}",
                    descriptor.registry.host
                ))
                .await;
            self.guarded(handle, self.images.authenticate(&descriptor.registry, &ctx))
                .await
                .map_err(|e| step_failure(handle, &e, JobFailure::publish))?;
        } else {
            logger
                .info("No registry credential provided, skipping authentication")
                .await;
        }

        // Publish
        checkpoint(handle)?;
        logger.info(format!("Pushing image {}", image_ref)).await;
        self.guarded(handle, self.images.publish(&image_ref, &ctx))
            .await
            .map_err(|e| step_failure(handle, &e, JobFailure::publish))?;

        Ok(())
    }

    /// Await a step, giving it a grace period to stop on its own once the job is cancelled.
    async fn guarded<T>(
        &self,
        handle: &CancellationHandle,
        step: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::pin!(step);
        tokio::select! {
            biased;
            result = &mut step => result,
            _ = handle.cancelled() => {
                match tokio::time::timeout(STEP_GRACE, &mut step).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Step did not stop after cancellation, abandoning it");
                        Err(Error::Cancelled)
                    }
                }
            }
        }
    }

    async fn cleanup(&self, workspace: &Path, image_ref: Option<&str>, logger: &JobLogger) {
        logger.info("Cleaning up").await;

        match tokio::fs::remove_dir_all(workspace).await {
            Ok(()) => debug!(path = %workspace.display(), "Removed workspace"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                logger
                    .warn(format!("Could not remove workspace: {}", e))
                    .await
            }
        }

        if let Some(image_ref) = image_ref {
            if let Err(e) = self.images.remove_local_image(image_ref).await {
                logger
                    .warn(format!("Could not remove local image {}: {}", image_ref, e))
                    .await;
            }
        }
    }

    async fn finish(
        &self,
        job_id: JobId,
        failure: Option<JobFailure>,
        image_ref: String,
    ) -> Option<JobStatus> {
        let mutation: JobMutation = match failure {
            None => Box::new(move |r: &mut JobRecord| {
                r.transition(JobStatus::Completed)?;
                r.image_ref = Some(image_ref);
                Ok(())
            }),
            Some(failure) => Box::new(move |r: &mut JobRecord| r.finish_with(&failure)),
        };

        match self.repo.update(job_id, mutation).await {
            Ok(record) => {
                info!(job_id = %job_id, status = %record.status, "Job finished");
                Some(record.status)
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to record job outcome");
                None
            }
        }
    }

    async fn finish_unstarted(
        &self,
        job_id: JobId,
        failure: JobFailure,
        logger: &JobLogger,
    ) -> Option<JobStatus> {
        let message = failure.message.clone();
        let result = self
            .update(job_id, move |r| {
                if r.status != JobStatus::Queued {
                    return Err(Error::Conflict(format!("job is {}", r.status)));
                }
                r.finish_with(&failure)
            })
            .await;
        match result {
            Ok(record) => {
                logger.warn(message).await;
                self.logs.complete(job_id);
                Some(record.status)
            }
            Err(e) => {
                debug!(job_id = %job_id, error = %e, "Job not started");
                None
            }
        }
    }

    /// Mark a job Failed after its task died without finishing it.
    pub async fn fail_internal(&self, job_id: JobId, message: &str) {
        let failure = JobFailure::new(FailureKind::InternalFault, format!("Internal error: {}", message));
        let logger = self.logger(job_id);
        logger.error(&failure.message).await;

        // A rendered build file means the build step may have produced an image.
        let image_ref = match self.repo.get(job_id).await {
            Ok(Some(record)) if record.artifacts.build_file.is_some() => {
                Some(record.descriptor.image_ref())
            }
            Ok(_) => None,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Could not read job record");
                None
            }
        };
        self.cleanup(&self.workspace(job_id), image_ref.as_deref(), &logger)
            .await;

        let result = self
            .repo
            .update(
                job_id,
                Box::new(move |r: &mut JobRecord| {
                    if r.status.is_terminal() {
                        return Ok(());
                    }
                    r.finish_with(&failure)
                }),
            )
            .await;
        if let Err(e) = result {
            error!(job_id = %job_id, error = %e, "Failed to record job failure");
        }
        self.logs.complete(job_id);
    }

    async fn update<F>(&self, job_id: JobId, f: F) -> Result<JobRecord>
    where
        F: FnOnce(&mut JobRecord) -> Result<()> + Send + 'static,
    {
        self.repo.update(job_id, Box::new(f)).await
    }

    async fn transition(&self, job_id: JobId, next: JobStatus) -> std::result::Result<(), JobFailure> {
        self.update(job_id, move |r| r.transition(next))
            .await
            .map(|_| ())
            .map_err(|e| JobFailure::internal(&e))
    }

    async fn record<F>(&self, job_id: JobId, f: F) -> std::result::Result<(), JobFailure>
    where
        F: FnOnce(&mut JobRecord) + Send + 'static,
    {
        self.update(job_id, move |r| {
            f(r);
            Ok(())
        })
        .await
        .map(|_| ())
        .map_err(|e| JobFailure::internal(&e))
    }
}

fn checkpoint(handle: &CancellationHandle) -> std::result::Result<(), JobFailure> {
    match handle.failure() {
        Some(failure) => Err(failure),
        None => Ok(()),
    }
}

/// Classify a step error. A fired cancellation source always wins.
fn step_failure(
    handle: &CancellationHandle,
    err: &Error,
    classify: impl FnOnce(&Error) -> JobFailure,
) -> JobFailure {
    if let Some(failure) = handle.failure() {
        return failure;
    }
    match err {
        Error::Cancelled => JobFailure::cancelled(),
        other => classify(other),
    }
}

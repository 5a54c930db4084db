//! Test doubles for the pipeline's collaborators.

use async_trait::async_trait;
use dockhand_config::DockerfileTemplates;
use dockhand_core::image::ImageBuilder;
use dockhand_core::job::{BuildOptions, ImageTarget, JobDescriptor, JobRecord, RegistryTarget, SourceSpec};
use dockhand_core::output::{OutputStream, StepContext};
use dockhand_core::source::{DetectedProject, SourceControlClient};
use dockhand_core::{Error, JobId, Result};
use dockhand_db::MemoryJobRepo;
use dockhand_executor::GitClient;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use crate::logs::LogBroadcaster;
use crate::pipeline::{Collaborators, Pipeline};
use crate::service::{BuildService, ServiceConfig};

const API_PROJECT: &str = r#"<Project Sdk="Microsoft.NET.Sdk.Web">
  <PropertyGroup>
    <TargetFramework>net8.0</TargetFramework>
  </PropertyGroup>
</Project>"#;

const DOMAIN_PROJECT: &str = r#"<Project Sdk="Microsoft.NET.Sdk">
  <PropertyGroup>
    <AssemblyName>Acme.Domain</AssemblyName>
  </PropertyGroup>
</Project>"#;

pub fn descriptor(name: &str) -> JobDescriptor {
    JobDescriptor::new(
        SourceSpec {
            location: "https://git.example.com/acme/shop.git".to_string(),
            branch: "main".to_string(),
            credential: None,
        },
        ImageTarget::new(name, "latest"),
    )
}

/// Blocks callers until released, one pass per permit.
pub struct Gate(Semaphore);

impl Gate {
    pub fn closed() -> Self {
        Self(Semaphore::new(0))
    }

    pub fn release(&self, passes: usize) {
        self.0.add_permits(passes);
    }

    async fn pass(&self, ctx: &StepContext) -> Result<()> {
        tokio::select! {
            permit = self.0.acquire() => {
                permit.map_err(|e| Error::Internal(e.to_string()))?.forget();
                Ok(())
            }
            _ = ctx.cancel.cancelled() => Err(Error::Cancelled),
        }
    }
}

/// Sleep that stops early when the step is cancelled.
async fn pause(ctx: &StepContext, duration: Duration) -> Result<()> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = ctx.cancel.cancelled() => Err(Error::Cancelled),
    }
}

fn failed(program: &str, output: &str) -> Error {
    Error::CommandFailed {
        program: program.to_string(),
        exit_code: 1,
        output: output.to_string(),
    }
}

/// Writes a small solution into the destination instead of cloning.
#[derive(Default)]
pub struct MockSource {
    pub clones: AtomicUsize,
    pub clone_error: Option<String>,
    pub clone_delay: Option<Duration>,
    /// Produce a checkout without any project file.
    pub empty_checkout: bool,
}

#[async_trait]
impl SourceControlClient for MockSource {
    async fn clone_repository(
        &self,
        _source: &SourceSpec,
        destination: &Path,
        ctx: &StepContext,
    ) -> Result<String> {
        self.clones.fetch_add(1, Ordering::SeqCst);
        ctx.output.line(OutputStream::Stderr, "Cloning into 'src'...").await;
        if let Some(delay) = self.clone_delay {
            pause(ctx, delay).await?;
        }
        if let Some(output) = &self.clone_error {
            return Err(failed("git clone", output));
        }

        tokio::fs::create_dir_all(destination).await?;
        tokio::fs::write(destination.join("README.md"), "# shop").await?;
        if !self.empty_checkout {
            let api = destination.join("src/Acme.Api");
            let domain = destination.join("src/Acme.Domain");
            tokio::fs::create_dir_all(&api).await?;
            tokio::fs::create_dir_all(&domain).await?;
            tokio::fs::write(api.join("Acme.Api.csproj"), API_PROJECT).await?;
            tokio::fs::write(domain.join("Acme.Domain.csproj"), DOMAIN_PROJECT).await?;
        }
        Ok("3f2a9c1d5e7b".to_string())
    }

    async fn detect_project_file(&self, root: &Path) -> Result<DetectedProject> {
        GitClient::default().detect_project_file(root).await
    }

    async fn extract_component_name(&self, project_file: &Path) -> Result<Option<String>> {
        GitClient::default().extract_component_name(project_file).await
    }
}

/// Records calls and tracks how many builds run at once.
#[derive(Default)]
pub struct MockImages {
    pub builds: AtomicUsize,
    pub auths: AtomicUsize,
    pub publishes: AtomicUsize,
    pub removals: AtomicUsize,
    pub running: AtomicUsize,
    pub max_running: AtomicUsize,
    pub build_gate: Option<Gate>,
    pub build_delay: Option<Duration>,
    pub publish_delay: Option<Duration>,
    pub build_error: Option<String>,
    /// Number of builds that fail before builds start succeeding.
    pub flaky_builds: AtomicUsize,
    pub remove_error: bool,
    pub panic_on_build: bool,
}

impl MockImages {
    async fn run_build(&self, build_file: &Path, ctx: &StepContext) -> Result<()> {
        tokio::fs::metadata(build_file).await?;
        ctx.output.line(OutputStream::Stdout, "Step 1/9 : FROM sdk").await;
        if self.panic_on_build {
            panic!("builder crashed");
        }
        if let Some(gate) = &self.build_gate {
            gate.pass(ctx).await?;
        }
        if let Some(delay) = self.build_delay {
            pause(ctx, delay).await?;
        }
        if let Some(output) = &self.build_error {
            return Err(failed("docker build", output));
        }
        if self
            .flaky_builds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(failed("docker build", "error: failed to compute cache key"));
        }
        Ok(())
    }
}

#[async_trait]
impl ImageBuilder for MockImages {
    async fn build(
        &self,
        _context_dir: &Path,
        build_file: &Path,
        _image_ref: &str,
        _options: &BuildOptions,
        ctx: &StepContext,
    ) -> Result<()> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let result = self.run_build(build_file, ctx).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn authenticate(&self, _registry: &RegistryTarget, _ctx: &StepContext) -> Result<()> {
        self.auths.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, _image_ref: &str, ctx: &StepContext) -> Result<()> {
        if let Some(delay) = self.publish_delay {
            pause(ctx, delay).await?;
        }
        self.publishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_local_image(&self, image_ref: &str) -> Result<()> {
        self.removals.fetch_add(1, Ordering::SeqCst);
        if self.remove_error {
            return Err(failed("docker rmi", &format!("No such image: {}", image_ref)));
        }
        Ok(())
    }
}

/// A pipeline over an in-memory repository and a temporary work dir.
pub fn pipeline_for(
    source: MockSource,
    images: MockImages,
) -> (Pipeline, Arc<MockSource>, Arc<MockImages>, TempDir) {
    let work_dir = tempfile::tempdir().unwrap();
    let source = Arc::new(source);
    let images = Arc::new(images);
    let pipeline = Pipeline::new(
        collaborators(source.clone(), images.clone()),
        Arc::new(LogBroadcaster::new(1000)),
        work_dir.path().to_path_buf(),
    );
    (pipeline, source, images, work_dir)
}

fn collaborators(source: Arc<MockSource>, images: Arc<MockImages>) -> Collaborators {
    Collaborators {
        repo: Arc::new(MemoryJobRepo::new()),
        source,
        images,
        templates: Arc::new(DockerfileTemplates::builtin()),
    }
}

pub struct Harness {
    pub service: Arc<BuildService>,
    pub source: Arc<MockSource>,
    pub images: Arc<MockImages>,
    pub work_dir: TempDir,
}

impl Harness {
    pub fn start(workers: usize, job_timeout: Duration, source: MockSource, images: MockImages) -> Self {
        Self::with_queue(workers, 100, job_timeout, source, images)
    }

    pub fn with_queue(
        workers: usize,
        queue_capacity: usize,
        job_timeout: Duration,
        source: MockSource,
        images: MockImages,
    ) -> Self {
        let work_dir = tempfile::tempdir().unwrap();
        let source = Arc::new(source);
        let images = Arc::new(images);
        let config = ServiceConfig {
            workers,
            queue_capacity,
            job_timeout,
            log_buffer: 1000,
            work_dir: work_dir.path().to_path_buf(),
        };
        let service = BuildService::start(config, collaborators(source.clone(), images.clone()));
        Self {
            service,
            source,
            images,
            work_dir,
        }
    }

    pub async fn record(&self, id: JobId) -> JobRecord {
        self.service.status(id).await.unwrap().unwrap()
    }

    /// Poll until `done` holds for the job, panicking after five seconds.
    pub async fn wait_for(&self, id: JobId, done: impl Fn(&JobRecord) -> bool) -> JobRecord {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let record = self.record(id).await;
            if done(&record) {
                return record;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("job {} stuck in {}", id, record.status);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_terminal(&self, id: JobId) -> JobRecord {
        self.wait_for(id, |r| r.status.is_terminal()).await
    }
}

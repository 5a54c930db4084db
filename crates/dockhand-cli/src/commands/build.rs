//! Run a single build through the job service.

use anyhow::{Context, Result};
use clap::Args;
use dockhand_config::{DockerfileTemplates, SystemConfig};
use dockhand_core::job::{
    BuildOptions, ImageTarget, JobDescriptor, JobRecord, JobStatus, LogEntry, LogLevel,
    RegistryTarget, SourceSpec,
};
use dockhand_core::secret::Credential;
use dockhand_core::template::TemplateVariant;
use dockhand_db::MemoryJobRepo;
use dockhand_executor::{DockerImageBuilder, GitClient};
use dockhand_scheduler::{BuildService, Collaborators, ServiceConfig};
use futures::StreamExt;
use std::sync::Arc;

use super::Overrides;

#[derive(Args)]
pub struct BuildArgs {
    /// Git repository URL
    #[arg(long)]
    pub repo: String,

    /// Branch to build
    #[arg(long, default_value = "main")]
    pub branch: String,

    /// Access token for private repositories
    #[arg(long, env = "DOCKHAND_GIT_TOKEN", hide_env_values = true)]
    pub git_token: Option<String>,

    /// Username sent with the git token
    #[arg(long, requires = "git_token")]
    pub git_user: Option<String>,

    /// Image name
    #[arg(long)]
    pub image: String,

    /// Image tag
    #[arg(long, default_value = "latest")]
    pub tag: String,

    /// Registry host to publish to (e.g. ghcr.io/acme)
    #[arg(long, default_value = "")]
    pub registry: String,

    #[arg(long, env = "DOCKHAND_REGISTRY_USER")]
    pub registry_user: Option<String>,

    #[arg(long, env = "DOCKHAND_REGISTRY_PASSWORD", hide_env_values = true)]
    pub registry_password: Option<String>,

    /// Build-file template
    #[arg(long, default_value = "standard")]
    pub variant: TemplateVariant,

    #[arg(long)]
    pub no_cache: bool,

    /// Always pull base images
    #[arg(long)]
    pub pull: bool,

    #[arg(long)]
    pub quiet: bool,

    /// Network used during the build
    #[arg(long)]
    pub network: Option<String>,

    /// Build argument as KEY=VALUE (repeatable)
    #[arg(long = "build-arg", value_parser = parse_key_value)]
    pub build_args: Vec<(String, String)>,

    /// Image label as KEY=VALUE (repeatable)
    #[arg(long = "label", value_parser = parse_key_value)]
    pub labels: Vec<(String, String)>,

    /// Print the final job summary as JSON
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub overrides: Overrides,
}

impl BuildArgs {
    pub fn descriptor(&self) -> JobDescriptor {
        let credential = self.git_token.as_deref().map(|token| match &self.git_user {
            Some(user) => Credential::new(user, token),
            None => Credential::token(token),
        });
        let registry_credential = self
            .registry_password
            .as_deref()
            .map(|password| match &self.registry_user {
                Some(user) => Credential::new(user, password),
                None => Credential::token(password),
            });

        JobDescriptor::new(
            SourceSpec {
                location: self.repo.clone(),
                branch: self.branch.clone(),
                credential,
            },
            ImageTarget::new(&self.image, &self.tag),
        )
        .with_registry(RegistryTarget {
            host: self.registry.clone(),
            credential: registry_credential,
        })
        .with_options(BuildOptions {
            no_cache: self.no_cache,
            pull: self.pull,
            quiet: self.quiet,
            network: self.network.clone(),
            build_args: self.build_args.iter().cloned().collect(),
            labels: self.labels.iter().cloned().collect(),
        })
        .with_variant(self.variant)
    }
}

fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

/// Submit the build, stream its log until it finishes and report whether it succeeded.
pub async fn run(config: SystemConfig, args: BuildArgs) -> Result<bool> {
    let templates = DockerfileTemplates::from_config(&config.templates)
        .context("Failed to load build-file templates")?;
    let collaborators = Collaborators {
        repo: Arc::new(MemoryJobRepo::new()),
        source: Arc::new(GitClient::new(&config.git.bin, config.git.depth)),
        images: Arc::new(DockerImageBuilder::new(&config.docker.bin)),
        templates: Arc::new(templates),
    };
    let service = BuildService::start(ServiceConfig::from(&config), collaborators);

    let job_id = service
        .submit(args.descriptor())
        .await
        .context("Failed to submit build")?;
    println!("Job {} queued", job_id);

    let mut logs = service.subscribe_logs(job_id).await?;
    let mut cancelling = false;
    loop {
        tokio::select! {
            entry = logs.next() => match entry {
                Some(entry) => print_entry(&entry),
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancelling => {
                eprintln!("Cancelling job {}", job_id);
                service.cancel(job_id).await?;
                cancelling = true;
            }
        }
    }

    let record = service
        .status(job_id)
        .await?
        .context("Job record disappeared")?;
    service.shutdown().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary(&record))?);
    } else {
        print_summary(&record);
    }
    Ok(record.status == JobStatus::Completed)
}

fn print_entry(entry: &LogEntry) {
    let marker = match entry.level {
        LogLevel::Error => "✗",
        LogLevel::Warning => "!",
        LogLevel::Info | LogLevel::Debug => " ",
    };
    println!("{} {} {}", entry.timestamp.format("%H:%M:%S%.3f"), marker, entry.message);
}

/// Job outcome without the full descriptor.
fn summary(record: &JobRecord) -> serde_json::Value {
    serde_json::json!({
        "id": record.id,
        "status": record.status,
        "attempt": record.attempt,
        "image_ref": record.image_ref,
        "error": record.error,
        "failure": record.failure,
        "artifacts": {
            "revision": record.artifacts.revision,
            "project_path": record.artifacts.project_path,
            "component_name": record.artifacts.component_name,
        },
        "started_at": record.started_at,
        "completed_at": record.completed_at,
    })
}

fn print_summary(record: &JobRecord) {
    println!();
    match record.status {
        JobStatus::Completed => {
            println!("✓ Build succeeded");
            if let Some(image_ref) = &record.image_ref {
                println!("  image: {}", image_ref);
            }
        }
        status => {
            println!("✗ Build {}", status);
            if let Some(error) = &record.error {
                println!("  {}", error);
            }
        }
    }
    if let (Some(started), Some(completed)) = (record.started_at, record.completed_at) {
        let elapsed = completed - started;
        println!("  took {:.1}s", elapsed.num_milliseconds() as f64 / 1000.0);
    }
}

//! Build job definitions: descriptors, records, status and log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::failure::{FailureKind, JobFailure};
use crate::secret::Credential;
use crate::template::TemplateVariant;
use crate::{Error, JobId, Result};

/// Where the source code comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Repository URL.
    pub location: String,
    /// Branch to build.
    pub branch: String,
    /// Credential for private repositories.
    pub credential: Option<Credential>,
}

/// Name and tag of the image to produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageTarget {
    pub name: String,
    pub tag: String,
}

impl ImageTarget {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
        }
    }
}

/// Registry the image is published to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryTarget {
    /// Registry host (e.g. "ghcr.io/acme"). Empty means the builder's default registry.
    pub host: String,
    /// Registry login. `None` skips authentication.
    pub credential: Option<Credential>,
}

/// Abstract build options; the image builder maps them to tool flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOptions {
    pub no_cache: bool,
    pub pull: bool,
    pub quiet: bool,
    pub network: Option<String>,
    pub build_args: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

/// Immutable snapshot of everything a queued job needs to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: JobId,
    pub source: SourceSpec,
    pub image: ImageTarget,
    pub registry: RegistryTarget,
    pub options: BuildOptions,
    pub variant: TemplateVariant,
}

impl JobDescriptor {
    /// Create a descriptor with a fresh job id.
    pub fn new(source: SourceSpec, image: ImageTarget) -> Self {
        Self {
            id: JobId::new(),
            source,
            image,
            registry: RegistryTarget::default(),
            options: BuildOptions::default(),
            variant: TemplateVariant::default(),
        }
    }

    pub fn with_registry(mut self, registry: RegistryTarget) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_variant(mut self, variant: TemplateVariant) -> Self {
        self.variant = variant;
        self
    }

    /// Fully qualified image reference, `<registry>/<name>:<tag>`.
    pub fn image_ref(&self) -> String {
        let tag = if self.image.tag.is_empty() {
            "latest"
        } else {
            self.image.tag.as_str()
        };
        let host = self.registry.host.trim_end_matches('/');
        if host.is_empty() {
            format!("{}:{}", self.image.name, tag)
        } else {
            format!("{}/{}:{}", host, self.image.name, tag)
        }
    }

    /// Reject descriptors that can never run.
    pub fn validate(&self) -> Result<()> {
        if self.source.location.trim().is_empty() {
            return Err(Error::InvalidInput("source location is required".to_string()));
        }
        if self.source.branch.trim().is_empty() {
            return Err(Error::InvalidInput("branch is required".to_string()));
        }
        let name = &self.image.name;
        if name.is_empty() {
            return Err(Error::InvalidInput("image name is required".to_string()));
        }
        if name.chars().any(|c| c.is_ascii_uppercase() || c.is_whitespace()) {
            return Err(Error::InvalidInput(format!(
                "image name '{}' must be lowercase without whitespace",
                name
            )));
        }
        if self.image.tag.chars().any(|c| c.is_whitespace() || c == ':') {
            return Err(Error::InvalidInput(format!(
                "invalid image tag '{}'",
                self.image.tag
            )));
        }
        Ok(())
    }
}

/// Status of a build job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Cloning,
    Building,
    Pushing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Occupies a worker slot.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Cloning | JobStatus::Building | JobStatus::Pushing
        )
    }

    /// Forward-only along the pipeline; Failed and Cancelled from any non-terminal state.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (current, Failed | Cancelled) => !current.is_terminal(),
            (Queued, Cloning) | (Cloning, Building) | (Building, Pushing) | (Pushing, Completed) => {
                true
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Cloning => "cloning",
            JobStatus::Building => "building",
            JobStatus::Pushing => "pushing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "cloning" => Ok(JobStatus::Cloning),
            "building" => Ok(JobStatus::Building),
            "pushing" => Ok(JobStatus::Pushing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// Files and names produced while running a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobArtifacts {
    /// Commit the build was made from.
    pub revision: Option<String>,
    /// Project file path relative to the repository root.
    pub project_path: Option<String>,
    /// Component (assembly) name.
    pub component_name: Option<String>,
    /// Rendered build file content.
    pub build_file: Option<String>,
}

/// Mutable state of a job, owned by the job repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    /// What was requested. Retries re-enqueue this descriptor.
    pub descriptor: JobDescriptor,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Human-readable error, set only when Failed or Cancelled.
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    pub artifacts: JobArtifacts,
    /// Number of retries performed on this id.
    pub attempt: u32,
    /// Published image reference, set on completion.
    pub image_ref: Option<String>,
}

impl JobRecord {
    pub fn new(descriptor: JobDescriptor) -> Self {
        Self {
            id: descriptor.id,
            status: JobStatus::Queued,
            descriptor,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            failure: None,
            artifacts: JobArtifacts::default(),
            attempt: 0,
            image_ref: None,
        }
    }

    /// Move to `next`, stamping start/completion times.
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::Conflict(format!(
                "job {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        if next == JobStatus::Cloning {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }

    /// Terminate the job with a classified failure. Cancellation kinds end as Cancelled.
    pub fn finish_with(&mut self, failure: &JobFailure) -> Result<()> {
        let next = if failure.kind.is_cancellation() {
            JobStatus::Cancelled
        } else {
            JobStatus::Failed
        };
        self.transition(next)?;
        self.error = Some(failure.message.clone());
        self.failure = Some(failure.kind);
        Ok(())
    }

    /// Re-initialize a failed job for another attempt under the same id.
    pub fn reset_for_retry(&mut self) -> Result<()> {
        if self.status != JobStatus::Failed {
            return Err(Error::Conflict(format!(
                "job {} is {}; only failed jobs can be retried",
                self.id, self.status
            )));
        }
        self.status = JobStatus::Queued;
        self.attempt += 1;
        self.started_at = None;
        self.completed_at = None;
        self.error = None;
        self.failure = None;
        self.artifacts = JobArtifacts::default();
        self.image_ref = None;
        Ok(())
    }
}

/// Severity of a job log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

/// A single line of job progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub job_id: JobId,
    pub message: String,
    pub level: LogLevel,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(job_id: JobId, message: impl Into<String>, level: LogLevel) -> Self {
        Self {
            job_id,
            message: message.into(),
            level,
            timestamp: Utc::now(),
        }
    }
}

/// Filter for listing jobs. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    /// Substring of the image name.
    pub image: Option<String>,
    pub branch: Option<String>,
}

impl JobFilter {
    pub fn matches(&self, record: &JobRecord) -> bool {
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(image) = &self.image {
            if !record.descriptor.image.name.contains(image.as_str()) {
                return false;
            }
        }
        if let Some(branch) = &self.branch {
            if &record.descriptor.source.branch != branch {
                return false;
            }
        }
        true
    }
}

/// Offset pagination.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

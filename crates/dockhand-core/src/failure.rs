//! Failure taxonomy and classification of raw tool failures.
//!
//! Every failed or cancelled job carries a [`FailureKind`] and a short,
//! user-facing message. Raw tool output stays in the job log.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Why fetching the source failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFetchFailure {
    Authentication,
    NotFound,
    BranchMissing,
    NetworkUnreachable,
    DiskFull,
    Other,
}

/// Why the image build failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildFailure {
    BaseImageUnavailable,
    DiskSpace,
    Generic,
}

/// Why authenticating or pushing failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishFailure {
    AuthenticationDenied,
    PermissionDenied,
    Timeout,
    Other,
}

/// Classified failure category recorded on a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    SourceFetch(SourceFetchFailure),
    ProjectDetection,
    Build(BuildFailure),
    Publish(PublishFailure),
    DeadlineExceeded,
    Cancelled,
    InternalFault,
}

impl FailureKind {
    /// Ends the job as Cancelled rather than Failed.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, FailureKind::Cancelled)
    }
}

/// A classified failure plus its user-facing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn deadline_exceeded(timeout: std::time::Duration) -> Self {
        Self::new(
            FailureKind::DeadlineExceeded,
            format!(
                "Deadline exceeded: the build did not finish within {}s",
                timeout.as_secs_f64()
            ),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "Build was cancelled")
    }

    pub fn shutdown() -> Self {
        Self::new(
            FailureKind::Cancelled,
            "Build was cancelled because the service is shutting down",
        )
    }

    pub fn project_not_found() -> Self {
        Self::new(
            FailureKind::ProjectDetection,
            "No project file (*.csproj) was found in the repository",
        )
    }

    pub fn internal(err: &Error) -> Self {
        Self::new(
            FailureKind::InternalFault,
            format!("Internal error: {}", err),
        )
    }

    /// Classify a failed clone.
    pub fn source_fetch(err: &Error, branch: &str) -> Self {
        let reason = classify_source_fetch(&failure_text(err));
        let message = match reason {
            SourceFetchFailure::Authentication => {
                "Authentication failed while cloning the repository; check that the credential is valid and has read access".to_string()
            }
            SourceFetchFailure::NotFound => {
                "Repository not found; check the source location and the credential's access".to_string()
            }
            SourceFetchFailure::BranchMissing => {
                format!("Branch '{}' does not exist in the repository", branch)
            }
            SourceFetchFailure::NetworkUnreachable => {
                "Could not reach the source host; check the location and network connectivity".to_string()
            }
            SourceFetchFailure::DiskFull => {
                "Not enough disk space to clone the repository".to_string()
            }
            SourceFetchFailure::Other => {
                with_detail("Failed to fetch the source repository", err)
            }
        };
        Self::new(FailureKind::SourceFetch(reason), message)
    }

    /// Classify a failed image build.
    pub fn build(err: &Error) -> Self {
        let reason = classify_build(&failure_text(err));
        let message = match reason {
            BuildFailure::BaseImageUnavailable => {
                "Image build failed: a base image could not be pulled".to_string()
            }
            BuildFailure::DiskSpace => {
                "Image build failed: the build host ran out of disk space".to_string()
            }
            BuildFailure::Generic => with_detail("Image build failed", err),
        };
        Self::new(FailureKind::Build(reason), message)
    }

    /// Classify a failed registry login or push.
    pub fn publish(err: &Error) -> Self {
        let reason = match err {
            Error::Timeout(_) => PublishFailure::Timeout,
            _ => classify_publish(&failure_text(err)),
        };
        let message = match reason {
            PublishFailure::AuthenticationDenied => {
                "Registry authentication failed; check the registry credential".to_string()
            }
            PublishFailure::PermissionDenied => {
                "The registry denied permission to push this image".to_string()
            }
            PublishFailure::Timeout => {
                "Timed out while talking to the registry".to_string()
            }
            PublishFailure::Other => with_detail("Publishing the image failed", err),
        };
        Self::new(FailureKind::Publish(reason), message)
    }
}

fn failure_text(err: &Error) -> String {
    match err.output() {
        Some(output) => format!("{}\n{}", err, output).to_lowercase(),
        None => err.to_string().to_lowercase(),
    }
}

/// Append the last meaningful output line, if any, to a generic message.
fn with_detail(prefix: &str, err: &Error) -> String {
    let detail = err
        .output()
        .and_then(|o| o.lines().rev().map(str::trim).find(|l| !l.is_empty()))
        .map(|l| l.chars().take(200).collect::<String>())
        .unwrap_or_else(|| err.to_string());
    format!("{}: {}", prefix, detail)
}

fn contains_any(text: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| text.contains(n))
}

/// Progress lines echo the destination path, which must not be classified.
fn without_progress(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("cloning into"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn classify_source_fetch(text: &str) -> SourceFetchFailure {
    let text = without_progress(text);
    let text = text.as_str();
    if contains_any(text, &["no space left on device", "disk quota exceeded"]) {
        SourceFetchFailure::DiskFull
    } else if contains_any(
        text,
        &[
            "authentication failed",
            "could not read username",
            "could not read password",
            "invalid username or password",
            "permission denied (publickey)",
            "http basic: access denied",
            "returned error: 403",
            "error: 403",
        ],
    ) {
        SourceFetchFailure::Authentication
    } else if contains_any(
        text,
        &[
            "remote branch",
            "couldn't find remote ref",
            "did not match any file(s) known to git",
        ],
    ) {
        SourceFetchFailure::BranchMissing
    } else if contains_any(
        text,
        &[
            "repository not found",
            "does not appear to be a git repository",
            "does not exist",
            "returned error: 404",
            "error: 404",
        ],
    ) {
        SourceFetchFailure::NotFound
    } else if contains_any(
        text,
        &[
            "could not resolve host",
            "network is unreachable",
            "connection timed out",
            "connection refused",
            "failed to connect",
            "unable to access",
        ],
    ) {
        SourceFetchFailure::NetworkUnreachable
    } else {
        SourceFetchFailure::Other
    }
}

pub fn classify_build(text: &str) -> BuildFailure {
    if contains_any(text, &["no space left on device", "disk quota exceeded"]) {
        BuildFailure::DiskSpace
    } else if contains_any(
        text,
        &[
            "pull access denied",
            "manifest unknown",
            "manifest for",
            "failed to resolve source metadata",
            "error pulling image",
            "failed to fetch anonymous token",
        ],
    ) {
        BuildFailure::BaseImageUnavailable
    } else {
        BuildFailure::Generic
    }
}

pub fn classify_publish(text: &str) -> PublishFailure {
    if contains_any(
        text,
        &[
            "unauthorized",
            "authentication required",
            "incorrect username or password",
            "login attempt",
        ],
    ) {
        PublishFailure::AuthenticationDenied
    } else if contains_any(
        text,
        &["denied", "forbidden", "insufficient_scope", "permission"],
    ) {
        PublishFailure::PermissionDenied
    } else if contains_any(
        text,
        &["timeout", "timed out", "deadline exceeded"],
    ) {
        PublishFailure::Timeout
    } else {
        PublishFailure::Other
    }
}

//! External tool execution for Dockhand.
//!
//! - [`ProcessExecutor`] runs a program with streamed, redacted output,
//!   a timeout and cooperative cancellation.
//! - [`GitClient`] implements source fetching and project detection.
//! - [`DockerImageBuilder`] builds, authenticates and publishes images.

pub mod docker;
pub mod git;
pub mod process;
pub mod redact;

pub use docker::DockerImageBuilder;
pub use git::GitClient;
pub use process::{CommandSpec, ExitReason, ProcessExecutor, ProcessOutput};
pub use redact::Redactor;

//! Image builder collaborator.

use async_trait::async_trait;
use std::path::Path;

use crate::Result;
use crate::job::{BuildOptions, RegistryTarget};
use crate::output::StepContext;

/// Builds, authenticates and publishes container images.
///
/// Implementations own the mapping from [`BuildOptions`] to tool flags.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build `image_ref` from `context_dir` using `build_file`.
    async fn build(
        &self,
        context_dir: &Path,
        build_file: &Path,
        image_ref: &str,
        options: &BuildOptions,
        ctx: &StepContext,
    ) -> Result<()>;

    /// Log in to the registry. Only called when the registry has a credential.
    async fn authenticate(&self, registry: &RegistryTarget, ctx: &StepContext) -> Result<()>;

    /// Push a built image.
    async fn publish(&self, image_ref: &str, ctx: &StepContext) -> Result<()>;

    /// Remove the local copy of an image. Callers treat failure as non-fatal.
    async fn remove_local_image(&self, image_ref: &str) -> Result<()>;
}

//! Docker image builder.

use async_trait::async_trait;
use bollard::Docker;
use bollard::image::RemoveImageOptions;
use dockhand_core::image::ImageBuilder;
use dockhand_core::job::{BuildOptions, RegistryTarget};
use dockhand_core::output::StepContext;
use dockhand_core::{Error, Result};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::process::{CommandSpec, ProcessExecutor};

const LOGIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Builds and pushes images with the docker CLI.
///
/// Local image removal goes through the Docker API when a client is
/// available, falling back to `docker rmi`.
pub struct DockerImageBuilder {
    exec: ProcessExecutor,
    docker_bin: String,
    client: Option<Docker>,
}

impl Default for DockerImageBuilder {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerImageBuilder {
    pub fn new(docker_bin: impl Into<String>) -> Self {
        let client = match Docker::connect_with_local_defaults() {
            Ok(docker) => Some(docker),
            Err(e) => {
                debug!(error = %e, "Docker API unavailable, using the CLI for image removal");
                None
            }
        };
        Self {
            exec: ProcessExecutor::new(),
            docker_bin: docker_bin.into(),
            client,
        }
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker_bin: impl Into<String>, client: Option<Docker>) -> Self {
        Self {
            exec: ProcessExecutor::new(),
            docker_bin: docker_bin.into(),
            client,
        }
    }

    /// `docker build` arguments for the given options.
    pub fn build_args(
        context_dir: &Path,
        build_file: &Path,
        image_ref: &str,
        options: &BuildOptions,
    ) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            "-f".to_string(),
            build_file.to_string_lossy().to_string(),
            "-t".to_string(),
            image_ref.to_string(),
        ];
        if options.no_cache {
            args.push("--no-cache".to_string());
        }
        if options.pull {
            args.push("--pull".to_string());
        }
        if options.quiet {
            args.push("--quiet".to_string());
        }
        if let Some(network) = &options.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        for (key, value) in &options.build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &options.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(context_dir.to_string_lossy().to_string());
        args
    }

    async fn remove_with_cli(&self, image_ref: &str) -> Result<()> {
        let rmi = CommandSpec::new(&self.docker_bin)
            .args(["rmi", "-f", image_ref])
            .timeout(Duration::from_secs(60));
        self.exec
            .run(&rmi, &StepContext::detached())
            .await
            .into_result("docker rmi")?;
        Ok(())
    }
}

#[async_trait]
impl ImageBuilder for DockerImageBuilder {
    async fn build(
        &self,
        context_dir: &Path,
        build_file: &Path,
        image_ref: &str,
        options: &BuildOptions,
        ctx: &StepContext,
    ) -> Result<()> {
        info!(image = %image_ref, "Building image");
        let spec = CommandSpec::new(&self.docker_bin)
            .args(Self::build_args(context_dir, build_file, image_ref, options))
            .current_dir(context_dir);
        self.exec.run(&spec, ctx).await.into_result("docker build")?;
        Ok(())
    }

    async fn authenticate(&self, registry: &RegistryTarget, ctx: &StepContext) -> Result<()> {
        let Some(credential) = &registry.credential else {
            debug!(registry = %registry.host, "No registry credential, skipping login");
            return Ok(());
        };
        if registry.host.is_empty() {
            return Err(Error::InvalidInput(
                "registry credential given without a registry host".to_string(),
            ));
        }

        info!(registry = %registry.host, username = %credential.username, "Logging in to registry");
        let login = CommandSpec::new(&self.docker_bin)
            .args(["login", registry.host.as_str(), "-u", credential.username.as_str()])
            .arg("--password")
            .arg(credential.secret.expose())
            .secret(credential.secret.clone())
            .timeout(LOGIN_TIMEOUT);
        self.exec.run(&login, ctx).await.into_result("docker login")?;
        Ok(())
    }

    async fn publish(&self, image_ref: &str, ctx: &StepContext) -> Result<()> {
        info!(image = %image_ref, "Pushing image");
        let push = CommandSpec::new(&self.docker_bin).args(["push", image_ref]);
        self.exec.run(&push, ctx).await.into_result("docker push")?;
        Ok(())
    }

    async fn remove_local_image(&self, image_ref: &str) -> Result<()> {
        let Some(client) = &self.client else {
            return self.remove_with_cli(image_ref).await;
        };

        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        client
            .remove_image(image_ref, Some(options), None)
            .await
            .map_err(|e| Error::Internal(format!("failed to remove image {}: {}", image_ref, e)))?;
        debug!(image = %image_ref, "Removed local image");
        Ok(())
    }
}

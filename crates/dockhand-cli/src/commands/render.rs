//! Render the build file for a local checkout.

use anyhow::{Context, Result};
use clap::Args;
use dockhand_config::{DockerfileTemplates, SystemConfig};
use dockhand_core::source::{SourceControlClient, component_name_fallback};
use dockhand_core::template::{Placeholders, TemplateRenderer, TemplateVariant};
use dockhand_executor::GitClient;
use std::path::PathBuf;

#[derive(Args)]
pub struct RenderArgs {
    /// Root of the checkout to scan for a project file
    #[arg(default_value = ".")]
    pub checkout: PathBuf,

    /// Build-file template
    #[arg(long, default_value = "standard")]
    pub variant: TemplateVariant,

    /// Write the build file here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

pub async fn run(config: &SystemConfig, args: RenderArgs) -> Result<()> {
    let templates = DockerfileTemplates::from_config(&config.templates)
        .context("Failed to load build-file templates")?;
    let content = render(&args, &templates).await?;

    match &args.output {
        Some(path) => {
            tokio::fs::write(path, &content)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Wrote {}", path.display());
        }
        None => print!("{}", content),
    }
    Ok(())
}

async fn render(args: &RenderArgs, templates: &DockerfileTemplates) -> Result<String> {
    let client = GitClient::default();
    let detected = client
        .detect_project_file(&args.checkout)
        .await
        .with_context(|| format!("No project found in {}", args.checkout.display()))?;
    if detected.fell_back {
        eprintln!(
            "warning: {} project files found and none is an executable or API project; using {}",
            detected.candidates, detected.relative_path
        );
    }

    let component_name = client
        .extract_component_name(&args.checkout.join(&detected.relative_path))
        .await?
        .unwrap_or_else(|| component_name_fallback(&detected.relative_path));
    eprintln!(
        "Project {} (component {})",
        detected.relative_path, component_name
    );

    let placeholders = Placeholders::for_project(&detected.relative_path, &component_name);
    Ok(templates.render(args.variant, &placeholders)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_renders_detected_project() {
        let checkout = tempfile::tempdir().unwrap();
        let project = checkout.path().join("src/Shop.Api");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(
            project.join("Shop.Api.csproj"),
            "<Project><PropertyGroup><AssemblyName>ShopService</AssemblyName></PropertyGroup></Project>",
        )
        .unwrap();

        let args = RenderArgs {
            checkout: checkout.path().to_path_buf(),
            variant: TemplateVariant::Standard,
            output: None,
        };
        let content = render(&args, &DockerfileTemplates::builtin()).await.unwrap();
        assert!(content.contains("src/Shop.Api/Shop.Api.csproj"));
        assert!(content.contains("ShopService.dll"));
        assert!(!content.contains("${"));
    }

    #[tokio::test]
    async fn test_empty_checkout_fails() {
        let checkout = tempfile::tempdir().unwrap();
        let args = RenderArgs {
            checkout: checkout.path().to_path_buf(),
            variant: TemplateVariant::Extended,
            output: None,
        };
        assert!(render(&args, &DockerfileTemplates::builtin()).await.is_err());
    }
}

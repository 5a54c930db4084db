//! CLI command implementations.

pub mod build;
pub mod render;

use anyhow::{Context, Result};
use clap::Args;
use dockhand_config::{DockerfileTemplates, SystemConfig, load_system_config};
use std::path::{Path, PathBuf};

/// Config file looked up in the current directory when none is given.
const DEFAULT_CONFIG: &str = "dockhand.kdl";

/// Settings that take precedence over the config file.
#[derive(Args, Default, Clone)]
pub struct Overrides {
    /// Base directory for job workspaces
    #[arg(long, env = "DOCKHAND_WORK_DIR")]
    pub work_dir: Option<PathBuf>,

    /// Maximum number of concurrent builds
    #[arg(long, env = "DOCKHAND_WORKERS")]
    pub workers: Option<usize>,
}

/// Load the configuration, falling back to defaults when no file exists.
pub fn load_config(path: Option<&Path>, overrides: &Overrides) -> Result<SystemConfig> {
    let mut config = match path {
        Some(path) => load_system_config(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG).exists() => load_system_config(Path::new(DEFAULT_CONFIG))
            .with_context(|| format!("Failed to load config: {}", DEFAULT_CONFIG))?,
        None => SystemConfig::default(),
    };

    if let Some(work_dir) = &overrides.work_dir {
        config.work_dir = work_dir.clone();
    }
    if let Some(workers) = overrides.workers {
        config.workers = workers;
    }
    config.validate()?;
    Ok(config)
}

pub fn validate(path: &Path) -> Result<()> {
    let result = load_system_config(path).and_then(|config| {
        config.validate()?;
        DockerfileTemplates::from_config(&config.templates)?;
        Ok(config)
    });

    match result {
        Ok(config) => {
            println!("Configuration is valid");
            println!("  workers:        {}", config.workers);
            println!("  queue capacity: {}", config.queue_capacity);
            println!("  job timeout:    {}s", config.job_timeout.as_secs());
            println!("  work dir:       {}", config.work_dir.display());
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply_on_top_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dockhand.kdl");
        std::fs::write(&path, "workers 4\nwork-dir \"/srv/builds\"\n").unwrap();

        let overrides = Overrides {
            work_dir: None,
            workers: Some(8),
        };
        let config = load_config(Some(&path), &overrides).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.work_dir, PathBuf::from("/srv/builds"));
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dockhand.kdl");
        std::fs::write(&path, "workers 2\n").unwrap();

        let overrides = Overrides {
            work_dir: None,
            workers: Some(0),
        };
        assert!(load_config(Some(&path), &overrides).is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.kdl");
        assert!(load_config(Some(&missing), &Overrides::default()).is_err());
    }
}

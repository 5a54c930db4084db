//! System configuration parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode, KdlValue};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Service-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Maximum number of pipelines running at once.
    pub workers: usize,
    /// Job queue capacity; producers wait when it is full.
    pub queue_capacity: usize,
    /// Per-job deadline, measured from the start of the pipeline.
    pub job_timeout: Duration,
    /// Log entries retained per job for live subscribers.
    pub log_buffer: usize,
    /// Base directory for per-job workspaces.
    pub work_dir: PathBuf,
    pub git: GitConfig,
    pub docker: DockerConfig,
    pub templates: TemplateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    pub bin: String,
    /// Shallow clone depth; `None` for a full clone.
    pub depth: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    pub bin: String,
}

/// Optional template overrides. Built-in templates are used when unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub standard: Option<PathBuf>,
    pub extended: Option<PathBuf>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 100,
            job_timeout: Duration::from_secs(30 * 60),
            log_buffer: 1000,
            work_dir: std::env::temp_dir().join("dockhand-builds"),
            git: GitConfig {
                bin: "git".to_string(),
                depth: Some(1),
            },
            docker: DockerConfig {
                bin: "docker".to_string(),
            },
            templates: TemplateConfig::default(),
        }
    }
}

impl SystemConfig {
    /// Check values that would make the service unusable.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.workers == 0 {
            return Err(invalid("workers", "must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue-capacity", "must be at least 1"));
        }
        if self.log_buffer == 0 {
            return Err(invalid("log-buffer", "must be at least 1"));
        }
        if self.job_timeout.is_zero() {
            return Err(invalid("job-timeout", "must be greater than zero"));
        }
        Ok(())
    }
}

/// Read and parse a configuration file.
pub fn load_system_config(path: &Path) -> ConfigResult<SystemConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_system_config(&content)
}

/// Parse system configuration from KDL text. Missing keys keep their defaults.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "workers" => config.workers = get_usize_arg(node, "workers")?,
            "queue-capacity" => config.queue_capacity = get_usize_arg(node, "queue-capacity")?,
            "log-buffer" => config.log_buffer = get_usize_arg(node, "log-buffer")?,
            "job-timeout" => config.job_timeout = get_duration_arg(node, "job-timeout")?,
            "work-dir" => {
                config.work_dir = get_first_string_arg(node)
                    .map(PathBuf::from)
                    .ok_or_else(|| ConfigError::MissingField("work-dir path".to_string()))?;
            }
            "git" => {
                for child in children(node) {
                    match child.name().value() {
                        "bin" => {
                            config.git.bin = get_first_string_arg(child)
                                .ok_or_else(|| ConfigError::MissingField("git bin".to_string()))?;
                        }
                        "depth" => {
                            let depth = get_usize_arg(child, "git depth")?;
                            config.git.depth = if depth == 0 {
                                None
                            } else {
                                Some(u32::try_from(depth).map_err(|_| {
                                    invalid("git depth", "out of range")
                                })?)
                            };
                        }
                        _ => {}
                    }
                }
            }
            "docker" => {
                for child in children(node) {
                    if child.name().value() == "bin" {
                        config.docker.bin = get_first_string_arg(child)
                            .ok_or_else(|| ConfigError::MissingField("docker bin".to_string()))?;
                    }
                }
            }
            "templates" => {
                for child in children(node) {
                    let path = get_first_string_arg(child).map(PathBuf::from);
                    match child.name().value() {
                        "standard" => config.templates.standard = path,
                        "extended" => config.templates.extended = path,
                        _ => {}
                    }
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    config.validate()?;
    Ok(config)
}

/// Parse `"90"`, `"250ms"`, `"30s"`, `"15m"` or `"2h"`.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: u64 = number.parse().ok()?;
    match unit.trim() {
        "" | "s" => Some(Duration::from_secs(value)),
        "ms" => Some(Duration::from_millis(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

// Helper functions for extracting values from KDL nodes

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|c| c.nodes().iter())
}

fn first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    first_arg(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_usize_arg(node: &KdlNode, field: &str) -> ConfigResult<usize> {
    let value = first_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    value
        .as_integer()
        .and_then(|i| usize::try_from(i).ok())
        .ok_or_else(|| invalid(field, "expected a non-negative integer"))
}

fn get_duration_arg(node: &KdlNode, field: &str) -> ConfigResult<Duration> {
    let value = first_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    if let Some(secs) = value.as_integer() {
        return u64::try_from(secs)
            .map(Duration::from_secs)
            .map_err(|_| invalid(field, "expected a non-negative number of seconds"));
    }
    value
        .as_string()
        .and_then(parse_duration)
        .ok_or_else(|| invalid(field, "expected a duration such as \"30s\" or \"15m\""))
}

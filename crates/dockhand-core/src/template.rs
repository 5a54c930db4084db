//! Build-file template rendering.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::Result;

/// Which build-file template a job uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateVariant {
    /// Runtime image only.
    #[default]
    Standard,
    /// Runtime image plus the extended native dependency set.
    Extended,
}

impl std::fmt::Display for TemplateVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateVariant::Standard => write!(f, "standard"),
            TemplateVariant::Extended => write!(f, "extended"),
        }
    }
}

impl std::str::FromStr for TemplateVariant {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "standard" => Ok(TemplateVariant::Standard),
            "extended" => Ok(TemplateVariant::Extended),
            _ => Err(format!("Unknown template variant: {}", s)),
        }
    }
}

/// Values substituted into a template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placeholders {
    values: BTreeMap<String, String>,
}

impl Placeholders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Standard placeholders for a detected project.
    ///
    /// `project_path` is relative to the repository root, e.g. `src/Shop.Api/Shop.Api.csproj`.
    pub fn for_project(project_path: &str, component_name: &str) -> Self {
        let normalized = project_path.replace('\\', "/");
        let (dir, file) = match normalized.rsplit_once('/') {
            Some((dir, file)) => (dir.to_string(), file.to_string()),
            None => (".".to_string(), normalized.clone()),
        };
        Self::new()
            .with("project_path", normalized)
            .with("project_dir", dir)
            .with("project_file", file)
            .with("component_name", component_name)
    }
}

/// Produces build-file content for a variant.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, variant: TemplateVariant, placeholders: &Placeholders) -> Result<String>;
}

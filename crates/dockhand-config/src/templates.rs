//! Build-file templates.
//!
//! Templates use `${name}` placeholders, e.g. `${project_path}` or
//! `${component_name}`. Placeholders without a value are left untouched so
//! build-time variables of the same shape survive rendering.

use crate::{ConfigResult, TemplateConfig};
use dockhand_core::Result;
use dockhand_core::template::{Placeholders, TemplateRenderer, TemplateVariant};
use regex::Regex;
use std::sync::LazyLock;

const STANDARD: &str = include_str!("../templates/standard.Dockerfile");
const EXTENDED: &str = include_str!("../templates/extended.Dockerfile");

static PLACEHOLDER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)\}").unwrap()
});

/// The template text for each variant.
#[derive(Debug, Clone)]
pub struct DockerfileTemplates {
    standard: String,
    extended: String,
}

impl Default for DockerfileTemplates {
    fn default() -> Self {
        Self::builtin()
    }
}

impl DockerfileTemplates {
    /// Templates compiled into the binary.
    pub fn builtin() -> Self {
        Self {
            standard: STANDARD.to_string(),
            extended: EXTENDED.to_string(),
        }
    }

    pub fn new(standard: impl Into<String>, extended: impl Into<String>) -> Self {
        Self {
            standard: standard.into(),
            extended: extended.into(),
        }
    }

    /// Built-in templates with any configured overrides read from disk.
    pub fn from_config(config: &TemplateConfig) -> ConfigResult<Self> {
        let mut templates = Self::builtin();
        if let Some(path) = &config.standard {
            templates.standard = std::fs::read_to_string(path)?;
        }
        if let Some(path) = &config.extended {
            templates.extended = std::fs::read_to_string(path)?;
        }
        Ok(templates)
    }

    pub fn template(&self, variant: TemplateVariant) -> &str {
        match variant {
            TemplateVariant::Standard => &self.standard,
            TemplateVariant::Extended => &self.extended,
        }
    }
}

/// Substitute `${name}` placeholders, keeping unknown ones verbatim.
pub fn interpolate(input: &str, placeholders: &Placeholders) -> String {
    PLACEHOLDER_REGEX
        .replace_all(input, |caps: &regex::Captures| {
            let name = &caps[1];
            placeholders
                .get(name)
                .map(str::to_string)
                .unwrap_or_else(|| format!("${{{}}}", name))
        })
        .to_string()
}

impl TemplateRenderer for DockerfileTemplates {
    fn render(&self, variant: TemplateVariant, placeholders: &Placeholders) -> Result<String> {
        Ok(interpolate(self.template(variant), placeholders))
    }
}

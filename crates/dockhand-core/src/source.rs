//! Source control collaborator and project-file selection.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;

use crate::Result;
use crate::job::SourceSpec;
use crate::output::StepContext;

/// A candidate project file found in a checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectCandidate {
    /// Path relative to the repository root, `/`-separated.
    pub path: String,
    /// Declares an executable entry point.
    pub executable: bool,
}

/// Outcome of project detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedProject {
    /// Path relative to the repository root.
    pub relative_path: String,
    /// How many candidates were found.
    pub candidates: usize,
    /// Several candidates and no rule matched; the first was used.
    pub fell_back: bool,
}

/// Path segments that mark a presentation/API project.
const API_MARKERS: &[&str] = &[".api", "webapi", ".web", "-api", "_api"];

/// Pick the project to build.
///
/// One candidate is used as-is. With several, prefer an executable project,
/// then one whose path looks like an API project, else the first found.
pub fn choose_project(candidates: &[ProjectCandidate]) -> Option<DetectedProject> {
    let first = candidates.first()?;
    let pick = |path: &str, fell_back: bool| DetectedProject {
        relative_path: path.to_string(),
        candidates: candidates.len(),
        fell_back,
    };

    if candidates.len() == 1 {
        return Some(pick(&first.path, false));
    }
    if let Some(c) = candidates.iter().find(|c| c.executable) {
        return Some(pick(&c.path, false));
    }
    if let Some(c) = candidates.iter().find(|c| {
        let lower = c.path.to_lowercase();
        API_MARKERS.iter().any(|m| lower.contains(m))
    }) {
        return Some(pick(&c.path, false));
    }
    Some(pick(&first.path, true))
}

static ASSEMBLY_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<AssemblyName>\s*([^<]+?)\s*</AssemblyName>").unwrap()
});

static OUTPUT_TYPE_EXE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<OutputType>\s*(Exe|WinExe)\s*</OutputType>").unwrap()
});

/// `<AssemblyName>` from project file content.
pub fn assembly_name(content: &str) -> Option<String> {
    ASSEMBLY_NAME
        .captures(content)
        .map(|c| c[1].to_string())
        .filter(|s| !s.is_empty())
}

/// Whether the project declares an executable output, or is a web SDK project.
pub fn is_executable_project(content: &str) -> bool {
    OUTPUT_TYPE_EXE.is_match(content) || content.contains("Sdk=\"Microsoft.NET.Sdk.Web\"")
}

/// File stem of a project path, used when no assembly name is declared.
pub fn component_name_fallback(project_path: &str) -> String {
    Path::new(project_path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| project_path.to_string())
}

/// Fetches sources and inspects checkouts.
#[async_trait]
pub trait SourceControlClient: Send + Sync {
    /// Clone `source.branch` into `destination`; returns the checked-out revision.
    async fn clone_repository(
        &self,
        source: &SourceSpec,
        destination: &Path,
        ctx: &StepContext,
    ) -> Result<String>;

    /// Locate the project file under `root`.
    async fn detect_project_file(&self, root: &Path) -> Result<DetectedProject>;

    /// Component name declared by a project file, if any.
    async fn extract_component_name(&self, project_file: &Path) -> Result<Option<String>>;
}

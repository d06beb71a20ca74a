// Interpreter resolution for script jobs.
//
// Candidates are tried in the configured order and the first one that
// exists wins. The outcome, found or not, is computed once per process.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::errors::SupervisorError;
use crate::models::SupervisorConfig;

pub struct InterpreterResolver {
    project_dir: PathBuf,
    candidates: Vec<String>,
    resolved: OnceLock<Result<PathBuf, String>>,
}

impl InterpreterResolver {
    pub fn new(project_dir: PathBuf, candidates: Vec<String>) -> Self {
        Self {
            project_dir,
            candidates,
            resolved: OnceLock::new(),
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(config.project_dir(), config.interpreter_candidates.clone())
    }

    /// Return the interpreter path, probing the candidates on first use.
    pub fn resolve(&self) -> Result<PathBuf, SupervisorError> {
        self.resolved
            .get_or_init(|| self.probe())
            .clone()
            .map_err(SupervisorError::Configuration)
    }

    /// Probe every candidate without caching, for diagnostics.
    pub fn probe_all(&self) -> Vec<(String, Option<PathBuf>)> {
        self.candidates
            .iter()
            .map(|c| (c.clone(), locate(c, &self.project_dir)))
            .collect()
    }

    fn probe(&self) -> Result<PathBuf, String> {
        for candidate in &self.candidates {
            if let Some(path) = locate(candidate, &self.project_dir) {
                tracing::debug!("Interpreter candidate '{}' resolved to {}", candidate, path.display());
                return Ok(path);
            }
            tracing::debug!("Interpreter candidate '{}' not found", candidate);
        }

        if self.candidates.is_empty() {
            return Err("No interpreter candidates configured".to_string());
        }
        Err(format!(
            "No interpreter found (tried: {}) relative to {}",
            self.candidates.join(", "),
            self.project_dir.display()
        ))
    }
}

/// Locate a single candidate: absolute paths must exist, paths with a
/// separator are taken relative to `base`, bare names are looked up on PATH.
pub fn locate(candidate: &str, base: &Path) -> Option<PathBuf> {
    let path = Path::new(candidate);
    if path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }
    if path.components().count() > 1 {
        let joined = base.join(path);
        return joined.is_file().then_some(joined);
    }
    which::which(candidate).ok()
}

use crate::approval::Approval;
use crate::config::{Module, Step, StepKey};
use crate::error::Result;
use crate::paths;
use crate::resolver::ModuleVersion;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// A module after version resolution and input substitution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedModule {
    /// Declared module with resolved inputs and its target version.
    pub module: Module,
    pub version: ModuleVersion,
    /// Checksum of the inputs after the immediate pass.
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncludedFile {
    /// Relative to the step directory.
    pub path: String,
    pub content: String,
}

/// Everything the executor needs for one step in one release.
#[derive(Debug, Clone)]
pub struct ResolvedStep {
    pub key: StepKey,
    /// New step value; the configured step is never modified.
    pub step: Step,
    pub modules: Vec<ResolvedModule>,
    pub files: Vec<IncludedFile>,
    pub approval: Approval,
    pub first_apply: bool,
    pub release_index: usize,
    /// Directory the artifacts are written to.
    pub dir: PathBuf,
}

impl ResolvedStep {
    pub fn module(&self, name: &str) -> Option<&ResolvedModule> {
        self.modules.iter().find(|m| m.module.name == name)
    }
}

/// Persists a resolved step's artifacts.
pub trait StepWriter: Send + Sync {
    fn write(&self, step: &ResolvedStep) -> Result<()>;
}

/// Writes `step.yaml` plus the included files into `ResolvedStep::dir`.
#[derive(Debug, Clone, Default)]
pub struct FileStepWriter;

impl StepWriter for FileStepWriter {
    fn write(&self, resolved: &ResolvedStep) -> Result<()> {
        crate::io::ensure_dir(&resolved.dir)?;
        let data = serde_yaml::to_string(&resolved.step)?;
        crate::io::atomic_write(&resolved.dir.join(paths::STEP_FILE), data.as_bytes())?;
        for file in &resolved.files {
            let target = safe_join(&resolved.dir, &file.path);
            crate::io::atomic_write(&target, file.content.as_bytes())?;
        }
        Ok(())
    }
}

/// Join a relative file path, dropping `..` and root components.
fn safe_join(dir: &Path, rel: &str) -> PathBuf {
    let mut out = dir.to_path_buf();
    for part in rel.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            continue;
        }
        out.push(part);
    }
    out
}

use crate::config::StepKey;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// File and directory constants
// ---------------------------------------------------------------------------

pub const CONFIG_FILE: &str = "stagewalk.yaml";
pub const STATE_FILE: &str = "stagewalk-state.yaml";
pub const PARAMETERS_FILE: &str = "parameters.yaml";

pub const SOURCES_DIR: &str = "sources";
pub const CONFIG_DIR: &str = "config";
pub const STEPS_DIR: &str = "steps";

pub const MANIFEST_FILE: &str = "checksums.sha256";
pub const STEP_FILE: &str = "step.yaml";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn state_path(root: &Path) -> PathBuf {
    root.join(STATE_FILE)
}

pub fn parameters_path(root: &Path) -> PathBuf {
    root.join(PARAMETERS_FILE)
}

pub fn sources_dir(root: &Path) -> PathBuf {
    root.join(SOURCES_DIR)
}

pub fn config_dir(root: &Path) -> PathBuf {
    root.join(CONFIG_DIR)
}

pub fn steps_dir(root: &Path) -> PathBuf {
    root.join(STEPS_DIR)
}

/// Directory name of a step's written artifacts: `<prefix>-<step>[-<workspace>]`.
pub fn step_dir_name(prefix: &str, key: &StepKey) -> String {
    let mut name = if prefix.is_empty() {
        key.name.clone()
    } else {
        format!("{prefix}-{}", key.name)
    };
    if !key.workspace.is_empty() {
        name.push('-');
        name.push_str(&key.workspace);
    }
    name
}

/// Local mirror directory name for a source URL: its last path segment
/// without a `.git` suffix.
pub fn source_dir_name(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed.rsplit('/').next().unwrap_or(trimmed);
    last.trim_end_matches(".git").to_string()
}

// ---------------------------------------------------------------------------
// Name validation
// ---------------------------------------------------------------------------

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$|^[a-z0-9]$").unwrap())
}

/// Step, workspace and module names end up in parameter paths and
/// directory names, so they are restricted to lowercase slugs.
pub fn is_valid_name(name: &str) -> bool {
    name_re().is_match(name)
}

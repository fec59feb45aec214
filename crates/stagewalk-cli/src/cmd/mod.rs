pub mod checksums;
pub mod config;
pub mod run;
pub mod state;
pub mod walk;

use anyhow::Context;
use stagewalk_core::config::{Config, WarnLevel};
use stagewalk_core::merge::merge_config;
use stagewalk_core::release;
use stagewalk_core::source::{LocalSourceBackend, SourceRegistry};
use std::path::{Path, PathBuf};

/// Load `stagewalk.yaml`, merged over its base profile when one is set.
pub fn load_project(root: &Path) -> anyhow::Result<Config> {
    let config = Config::load(root).context("failed to load config")?;
    let Some(profile) = config.base_profile.clone() else {
        return Ok(config);
    };
    let path = base_profile_path(root, &profile.path, &profile.version);
    let base = Config::load_from(&path)
        .with_context(|| format!("failed to load base profile {}", path.display()))?;
    Ok(merge_config(base, config))
}

/// A directory profile holds one document per version: `<dir>/<version>.yaml`.
fn base_profile_path(root: &Path, path: &str, version: &str) -> PathBuf {
    let p = root.join(path);
    if !p.is_dir() {
        return p;
    }
    let version = if release::is_stable(version) {
        release::STABLE
    } else {
        version
    };
    p.join(format!("{version}.yaml"))
}

/// Fail on any error-level validation finding; log the rest.
pub fn ensure_valid(config: &Config) -> anyhow::Result<()> {
    let mut errors = Vec::new();
    for w in config.validate() {
        match w.level {
            WarnLevel::Warning => tracing::warn!("{}", w.message),
            WarnLevel::Error => errors.push(w.message),
        }
    }
    if !errors.is_empty() {
        anyhow::bail!("invalid config:\n  {}", errors.join("\n  "));
    }
    Ok(())
}

pub fn load_registry(root: &Path, config: &Config) -> anyhow::Result<SourceRegistry> {
    let backend = LocalSourceBackend::new(root);
    SourceRegistry::load(config, &backend).context("failed to load sources")
}

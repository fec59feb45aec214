//! Skip-if-unchanged detection for steps that were applied before.

use crate::artifact::ResolvedModule;
use crate::config::Step;
use crate::source::{Source, SourceRegistry, MODULES_PREFIX, PROVIDERS_PREFIX};
use crate::state::StateStep;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Provider tree differs between the previous and current release.
    Provider(String),
    /// Module tree differs between the applied and target version, or the
    /// applied version has no recorded checksum.
    ModuleContent(String),
    /// Resolved inputs differ from the last applied inputs.
    Inputs(String),
    ClientVersion(String),
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Provider(p) => write!(f, "provider {p} changed"),
            Change::ModuleContent(m) => write!(f, "module {m} content changed"),
            Change::Inputs(m) => write!(f, "module {m} inputs changed"),
            Change::ClientVersion(m) => write!(f, "client module {m} version changed"),
        }
    }
}

/// Everything about `step` that changed for this release. Empty means the
/// step can be skipped.
pub fn detect(
    step: &Step,
    modules: &[ResolvedModule],
    recorded: Option<&StateStep>,
    registry: &SourceRegistry,
) -> Vec<Change> {
    let mut changes = Vec::new();

    let sources: Vec<&Source> = {
        let mut urls: Vec<&str> = modules
            .iter()
            .filter_map(|m| m.version.source_url.as_deref())
            .collect();
        urls.sort();
        urls.dedup();
        if urls.is_empty() {
            registry.iter().collect()
        } else {
            urls.iter().filter_map(|u| registry.by_url(u)).collect()
        }
    };

    for provider in step.providers() {
        let path = format!("{PROVIDERS_PREFIX}{provider}");
        let differs = sources.iter().any(|s| match s.current_checksum(&path) {
            Some(current) => s.previous_checksum(&path) != Some(current),
            None => false,
        });
        if differs {
            changes.push(Change::Provider(provider));
        }
    }

    for resolved in modules {
        let name = &resolved.module.name;
        let state_module = recorded.and_then(|s| s.module(name));

        if resolved.module.is_client() {
            if resolved.version.changed {
                changes.push(Change::ClientVersion(name.clone()));
            }
        } else if resolved.version.changed {
            let applied = state_module.and_then(|m| m.applied_version.as_deref());
            if module_content_changed(resolved, applied, registry) {
                changes.push(Change::ModuleContent(name.clone()));
            }
        }

        if state_module.and_then(|m| m.checksum.as_deref()) != Some(resolved.checksum.as_str()) {
            changes.push(Change::Inputs(name.clone()));
        }
    }

    changes
}

fn module_content_changed(
    resolved: &ResolvedModule,
    applied: Option<&str>,
    registry: &SourceRegistry,
) -> bool {
    let Some(source) = resolved
        .version
        .source_url
        .as_deref()
        .and_then(|u| registry.by_url(u))
    else {
        return true;
    };
    let path = format!("{MODULES_PREFIX}{}", resolved.module.source);
    let checksum_at = |version: &str| {
        source
            .resolve_tag(version)
            .ok()
            .and_then(|r| source.checksum(&r.tag, &path))
    };
    match (
        applied.and_then(|a| checksum_at(a)),
        checksum_at(&resolved.version.version),
    ) {
        (Some(before), Some(after)) => before != after,
        _ => true,
    }
}

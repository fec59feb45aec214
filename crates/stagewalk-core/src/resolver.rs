//! Version resolution: the walk bounds and the per-module, per-release
//! target version decision.

use crate::approval;
use crate::config::{ApprovalPolicy, Config, Module};
use crate::error::{Result, RolloutError};
use crate::release::{self, STABLE};
use crate::source::{Source, SourceRegistry};
use crate::state::{State, StateModule};
use serde::Serialize;
use std::cmp::Ordering;
use tracing::debug;

// ---------------------------------------------------------------------------
// Walk bounds
// ---------------------------------------------------------------------------

/// Oldest version any tracked module requires, folding declared versions
/// and recorded state versions into `config.version`.
pub fn oldest_version(config: &Config, state: &State) -> Result<String> {
    let mut oldest = release::older(&config.version, STABLE)?;
    for step in &config.steps {
        let key = step.key();
        for module in step.modules.iter().filter(|m| !m.is_client()) {
            oldest = release::older(&oldest, &module.version)?;
            if let Some(recorded) = state
                .module(&key, &module.name)
                .and_then(StateModule::effective_version)
            {
                oldest = release::older(&oldest, recorded)?;
            }
        }
    }
    Ok(oldest)
}

/// Newest version any module demands. One unbounded module makes the whole
/// walk unbounded.
pub fn newest_version(config: &Config) -> Result<String> {
    let mut newest: Option<String> = None;
    for module in config
        .steps
        .iter()
        .flat_map(|s| s.modules.iter())
        .filter(|m| !m.is_client())
    {
        if release::is_stable(&module.version) {
            return Ok(STABLE.to_string());
        }
        newest = Some(match newest {
            Some(n) => release::newer(&n, &module.version)?,
            None => release::older(&module.version, STABLE)?,
        });
    }
    Ok(newest.unwrap_or_else(|| STABLE.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Walk {
    pub oldest: String,
    pub newest: String,
    /// Number of release iterations.
    pub len: usize,
}

/// Compute the bounds and set every source's walk. Returns the shared
/// iteration count: the longest per-source walk.
pub fn plan_walk(config: &Config, state: &State, registry: &mut SourceRegistry) -> Result<Walk> {
    let oldest = oldest_version(config, state)?;
    let newest = newest_version(config)?;
    for source in registry.iter_mut() {
        source.set_walk(&oldest, &newest)?;
        debug!(
            source = %source.url,
            releases = ?source.walk().iter().map(|r| r.tag.as_str()).collect::<Vec<_>>(),
            "walk planned"
        );
    }
    Ok(Walk {
        oldest,
        newest,
        len: registry.walk_len(),
    })
}

// ---------------------------------------------------------------------------
// Per-module decision
// ---------------------------------------------------------------------------

/// A module's resolved target for one release iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleVersion {
    pub version: String,
    pub changed: bool,
    pub auto_approve: bool,
    /// Source the version came from; `None` for client modules.
    pub source_url: Option<String>,
}

/// Decide `module`'s target version at release `index` of the walk.
///
/// The target never drops below the applied version and never exceeds a
/// concrete declared version.
pub fn module_version(
    step: &str,
    module: &Module,
    recorded: Option<&StateModule>,
    index: usize,
    policy: ApprovalPolicy,
    registry: &SourceRegistry,
) -> Result<ModuleVersion> {
    let applied = recorded.and_then(|s| s.applied_version.as_deref());

    if module.is_client() {
        return Ok(ModuleVersion {
            version: module.version.clone(),
            changed: recorded.map_or(true, |s| s.version != module.version),
            auto_approve: applied.is_none()
                || matches!(policy, ApprovalPolicy::Never | ApprovalPolicy::Force),
            source_url: None,
        });
    }

    let source = registry
        .source_for(module)
        .ok_or_else(|| RolloutError::ModuleSourceNotFound {
            step: step.to_string(),
            module: module.name.clone(),
            module_source: module.source.clone(),
        })?;
    let module_semver = declared_version(module, source)?;
    let source_url = Some(source.url.clone());

    let migrated = recorded.is_some_and(|s| !s.source.is_empty() && s.source != source.url);
    let applied = if migrated { None } else { applied };

    let Some(release) = source.walk_release(index) else {
        // past this source's walk: settle on the declared version
        return Ok(match applied {
            None => ModuleVersion {
                version: module_semver,
                changed: true,
                auto_approve: true,
                source_url,
            },
            Some(applied) => {
                let target = release::newer(applied, &module_semver)?;
                let changed = release::compare(&target, applied)? != Ordering::Equal;
                let auto_approve = !changed || gate(policy, applied, &target)?;
                ModuleVersion {
                    version: target,
                    changed,
                    auto_approve,
                    source_url,
                }
            }
        });
    };

    let Some(applied) = applied else {
        // first application of the module, or a source migration
        return Ok(ModuleVersion {
            version: release::older(&module_semver, &release.tag)?,
            changed: true,
            auto_approve: true,
            source_url,
        });
    };

    let applied_v = release::parse_version(applied)?;
    let module_v = release::parse_version(&module_semver)?;

    let unchanged = ModuleVersion {
        version: applied.to_string(),
        changed: false,
        auto_approve: true,
        source_url: source_url.clone(),
    };
    if module_v == applied_v && applied_v < release.version {
        // pinned below the current release
        return Ok(unchanged);
    }
    if applied_v > release.version {
        // never downgrade
        return Ok(unchanged);
    }

    let capped = if module_v < release.version {
        module_semver.as_str()
    } else {
        release.tag.as_str()
    };
    let target = release::newer(applied, capped)?;
    let changed = release::compare(&target, applied)? != Ordering::Equal;
    let auto_approve = !changed || gate(policy, applied, &target)?;

    Ok(ModuleVersion {
        version: target,
        changed,
        auto_approve,
        source_url,
    })
}

/// Declared version resolved against the source: empty tracks the source
/// version, `stable` is the source's newest release.
fn declared_version(module: &Module, source: &Source) -> Result<String> {
    let declared = if module.version.trim().is_empty() {
        source.version.as_str()
    } else {
        module.version.as_str()
    };
    if release::is_stable(declared) {
        return Ok(source.stable().tag.clone());
    }
    release::parse_version(declared)?;
    Ok(declared.trim().to_string())
}

fn gate(policy: ApprovalPolicy, applied: &str, target: &str) -> Result<bool> {
    Ok(approval::auto_approve(
        policy,
        &release::parse_version(applied)?,
        &release::parse_version(target)?,
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

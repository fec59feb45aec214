use crate::config::{Config, StepKey};
use crate::error::Result;
use crate::paths;
use crate::release;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::Path;

// ---------------------------------------------------------------------------
// StateModule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateModule {
    pub name: String,
    /// Target version currently being applied.
    #[serde(default)]
    pub version: String,
    /// Last version confirmed applied. `None` until the first success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_version: Option<String>,
    /// Source URL the applied version came from.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub module_type: String,
    /// Checksum of the module's resolved inputs at the last apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip)]
    pub auto_approve: bool,
}

impl StateModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// The version resolution folds in: applied if known, else the target.
    pub fn effective_version(&self) -> Option<&str> {
        self.applied_version
            .as_deref()
            .or(Some(self.version.as_str()))
            .filter(|v| !v.is_empty())
    }
}

// ---------------------------------------------------------------------------
// StateStep
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateStep {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workspace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modules: Vec<StateModule>,
}

impl StateStep {
    pub fn key(&self) -> StepKey {
        StepKey::new(&self.name, &self.workspace)
    }

    /// A step that has never completed a pipeline execution.
    pub fn is_first_application(&self) -> bool {
        self.applied_at.is_none()
    }

    pub fn module(&self, name: &str) -> Option<&StateModule> {
        self.modules.iter().find(|m| m.name == name)
    }

    pub fn module_mut(&mut self, name: &str) -> Option<&mut StateModule> {
        self.modules.iter_mut().find(|m| m.name == name)
    }

    pub fn get_or_create_module(&mut self, name: &str) -> &mut StateModule {
        if let Some(idx) = self.modules.iter().position(|m| m.name == name) {
            return &mut self.modules[idx];
        }
        self.modules.push(StateModule::new(name));
        let last = self.modules.len() - 1;
        &mut self.modules[last]
    }

    /// Drop modules that are no longer declared on the step.
    pub fn retain_modules<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) {
        let keep: Vec<&str> = names.into_iter().collect();
        self.modules.retain(|m| keep.contains(&m.name.as_str()));
    }

    /// Confirm a successful pipeline execution: every module's target
    /// becomes its applied version. An applied version never moves to an
    /// older release.
    pub fn mark_applied(&mut self, now: DateTime<Utc>) {
        for module in &mut self.modules {
            if module.version.is_empty() {
                continue;
            }
            let regresses = match module.applied_version.as_deref() {
                Some(prev) => matches!(
                    release::compare(&module.version, prev),
                    Ok(Ordering::Less)
                ),
                None => false,
            };
            if !regresses {
                module.applied_version = Some(module.version.clone());
            }
        }
        self.applied_at = Some(now);
    }

    /// Advance the timestamp of a step that was skipped as unchanged.
    pub fn mark_skipped(&mut self, now: DateTime<Utc>) {
        self.applied_at = Some(now);
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_config_version: Option<String>,
    #[serde(default)]
    pub steps: Vec<StateStep>,
}

impl State {
    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Load state from the project root. A missing file is an empty state.
    pub fn load(root: &Path) -> Result<Self> {
        Self::load_from(&paths::state_path(root))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        match crate::io::read_optional(path)? {
            Some(data) if !data.trim().is_empty() => Ok(serde_yaml::from_str(&data)?),
            _ => Ok(Self::default()),
        }
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        self.save_to(&paths::state_path(root))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Queries / mutations
    // -----------------------------------------------------------------------

    pub fn step(&self, key: &StepKey) -> Option<&StateStep> {
        self.steps.iter().find(|s| s.key() == *key)
    }

    pub fn step_mut(&mut self, key: &StepKey) -> Option<&mut StateStep> {
        self.steps.iter_mut().find(|s| s.key() == *key)
    }

    pub fn module(&self, key: &StepKey, module: &str) -> Option<&StateModule> {
        self.step(key).and_then(|s| s.module(module))
    }

    pub fn get_or_create_step(&mut self, key: &StepKey) -> &mut StateStep {
        if let Some(idx) = self.steps.iter().position(|s| s.key() == *key) {
            return &mut self.steps[idx];
        }
        self.steps.push(StateStep {
            name: key.name.clone(),
            workspace: key.workspace.clone(),
            ..Default::default()
        });
        let last = self.steps.len() - 1;
        &mut self.steps[last]
    }

    /// Remove steps whose (name, workspace) no longer exists in `config`.
    /// Returns the removed keys.
    pub fn remove_stale(&mut self, config: &Config) -> Vec<StepKey> {
        let mut removed = Vec::new();
        self.steps.retain(|s| {
            let keep = config.step(&s.key()).is_some();
            if !keep {
                removed.push(s.key());
            }
            keep
        });
        removed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

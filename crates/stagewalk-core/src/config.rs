use crate::error::{Result, RolloutError};
use crate::paths;
use crate::release::{self, STABLE};
use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;
use std::collections::HashSet;
use std::path::Path;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// ApprovalPolicy / StepType
// ---------------------------------------------------------------------------

/// When a step's plan may be applied without a human gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalPolicy {
    Never,
    Always,
    Major,
    Minor,
    Force,
    Reject,
}

impl ApprovalPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalPolicy::Never => "never",
            ApprovalPolicy::Always => "always",
            ApprovalPolicy::Major => "major",
            ApprovalPolicy::Minor => "minor",
            ApprovalPolicy::Force => "force",
            ApprovalPolicy::Reject => "reject",
        }
    }
}

impl std::fmt::Display for ApprovalPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepType {
    #[default]
    Terraform,
    TerraformCustom,
    ArgocdApps,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Terraform => "terraform",
            StepType::TerraformCustom => "terraform-custom",
            StepType::ArgocdApps => "argocd-apps",
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StepKey
// ---------------------------------------------------------------------------

/// Identity of a step: (name, workspace).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepKey {
    pub name: String,
    pub workspace: String,
}

impl StepKey {
    pub fn new(name: impl Into<String>, workspace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workspace: workspace.into(),
        }
    }
}

impl std::fmt::Display for StepKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.workspace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.name, self.workspace)
        }
    }
}

// ---------------------------------------------------------------------------
// Module
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub source: String,
    /// Concrete tag, `stable`, or empty (track the source's version).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Mapping::is_empty")]
    pub inputs: Mapping,
    /// Sourced from an external git location rather than a managed source.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub client: bool,
}

impl Module {
    pub fn is_client(&self) -> bool {
        self.client
            || ["git::", "git@", "http://", "https://"]
                .iter()
                .any(|p| self.source.starts_with(p))
    }

    /// Type tag of the module: the source path after its leading group
    /// (`aws/vpc` → `vpc`). Client modules use their last path segment.
    pub fn module_type(&self) -> String {
        if self.is_client() {
            let path = self.source.split('?').next().unwrap_or(&self.source);
            let path = path.trim_end_matches('/');
            return path
                .rsplit('/')
                .next()
                .unwrap_or(path)
                .trim_end_matches(".git")
                .to_string();
        }
        match self.source.split_once('/') {
            Some((_, rest)) if !rest.is_empty() => rest.to_string(),
            _ => self.source.clone(),
        }
    }

    /// Leading source group (`aws/vpc` → `aws`); also the provider the
    /// module depends on.
    pub fn source_group(&self) -> Option<&str> {
        if self.is_client() {
            return None;
        }
        self.source.split('/').next().filter(|g| !g.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VpcPlacement {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnet_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_group_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KubernetesPlacement {
    pub cluster_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub argocd_namespace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workspace: String,
    #[serde(rename = "type", default)]
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approve: Option<ApprovalPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc: Option<VpcPlacement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubernetesPlacement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<Module>,
    /// Included files, relative to `config/<step>/`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Mapping::is_empty")]
    pub provider: Mapping,
}

impl Step {
    pub fn key(&self) -> StepKey {
        StepKey::new(&self.name, &self.workspace)
    }

    /// Unset means `always`.
    pub fn approval(&self) -> ApprovalPolicy {
        self.approve.unwrap_or(ApprovalPolicy::Always)
    }

    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Providers the step resolves: keys of its provider block plus the
    /// source group of every managed module.
    pub fn providers(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .provider
            .keys()
            .filter_map(|k| k.as_str().map(str::to_string))
            .collect();
        for group in self.modules.iter().filter_map(|m| m.source_group()) {
            out.push(group.to_string());
        }
        out.sort();
        out.dedup();
        out
    }
}

// ---------------------------------------------------------------------------
// SourceConfig / BaseProfile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub url: String,
    /// Version ceiling: releases newer than this are never considered.
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseProfile {
    /// Path of the base profile document, relative to the project root.
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

// ---------------------------------------------------------------------------
// PipelineConfig
// ---------------------------------------------------------------------------

/// Shell commands run in a step's artifact directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSet {
    pub plan: String,
    pub apply: String,
    /// Prints the step's outputs as JSON. Empty disables output capture.
    #[serde(default)]
    pub output: String,
}

fn default_terraform_commands() -> CommandSet {
    CommandSet {
        plan: "terraform init -input=false -no-color && terraform plan -input=false -no-color -out=tf.plan"
            .to_string(),
        apply: "terraform apply -input=false -no-color tf.plan".to_string(),
        output: "terraform output -json".to_string(),
    }
}

fn default_argocd_commands() -> CommandSet {
    CommandSet {
        plan: "kubectl diff -R -f . || true".to_string(),
        apply: "kubectl apply -R -f .".to_string(),
        output: String::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_parallel")]
    pub parallel: bool,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_terraform_commands")]
    pub terraform: CommandSet,
    #[serde(default = "default_argocd_commands")]
    pub argocd: CommandSet,
}

fn default_parallel() -> bool {
    true
}

fn default_max_parallel() -> usize {
    4
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            parallel: default_parallel(),
            max_parallel: default_max_parallel(),
            terraform: default_terraform_commands(),
            argocd: default_argocd_commands(),
        }
    }
}

impl PipelineConfig {
    pub fn commands_for(&self, step_type: StepType) -> &CommandSet {
        match step_type {
            StepType::Terraform | StepType::TerraformCustom => &self.terraform,
            StepType::ArgocdApps => &self.argocd,
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub prefix: String,
    /// Base config version; the oldest-version fold starts here.
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_image_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_profile: Option<BaseProfile>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

fn default_version() -> String {
    STABLE.to_string()
}

impl Config {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            version: default_version(),
            agent_version: String::new(),
            base_image_version: String::new(),
            base_profile: None,
            sources: Vec::new(),
            steps: Vec::new(),
            pipeline: PipelineConfig::default(),
        }
    }

    pub fn load(root: &Path) -> Result<Self> {
        Self::load_from(&paths::config_path(root))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(RolloutError::ConfigNotFound(path.to_path_buf()));
        }
        let data = std::fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn step(&self, key: &StepKey) -> Option<&Step> {
        self.steps.iter().find(|s| s.key() == *key)
    }

    /// First step with the given name, regardless of workspace.
    pub fn step_named(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Every (step, module) pair whose module type equals `module_type`.
    pub fn modules_of_type(&self, module_type: &str) -> Vec<(&Step, &Module)> {
        self.steps
            .iter()
            .flat_map(|s| s.modules.iter().map(move |m| (s, m)))
            .filter(|(_, m)| m.module_type() == module_type)
            .collect()
    }

    /// Resolve a dotted field path (`config.<path>` tags).
    ///
    /// Steps can be addressed by position (`steps.0.name`) or by name
    /// (`steps.net.approve`). Returns `None` for unknown paths.
    pub fn field(&self, path: &str) -> Option<String> {
        let parts: Vec<&str> = path.split('.').collect();
        match parts.as_slice() {
            ["prefix"] => Some(self.prefix.clone()),
            ["version"] => Some(self.version.clone()),
            ["agent_version"] | ["agentVersion"] => Some(self.agent_version.clone()),
            ["base_image_version"] | ["baseImageVersion"] => Some(self.base_image_version.clone()),
            ["sources", idx, field] => {
                let source = self.sources.get(idx.parse::<usize>().ok()?)?;
                match *field {
                    "url" => Some(source.url.clone()),
                    "version" => Some(source.version.clone()),
                    _ => None,
                }
            }
            ["steps", selector, rest @ ..] => {
                let step = match selector.parse::<usize>() {
                    Ok(idx) => self.steps.get(idx)?,
                    Err(_) => self.step_named(selector)?,
                };
                step_field(step, rest)
            }
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut error = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };

        if !release::is_stable(&self.version) && release::parse_version(&self.version).is_err() {
            error(format!("config version '{}' is not a valid version", self.version));
        }

        for source in &self.sources {
            if source.url.trim().is_empty() {
                error("source with an empty url".to_string());
            }
            if !release::is_stable(&source.version)
                && release::parse_version(&source.version).is_err()
            {
                error(format!(
                    "source '{}' has invalid version '{}'",
                    source.url, source.version
                ));
            }
        }

        let mut keys = HashSet::new();
        for step in &self.steps {
            if !paths::is_valid_name(&step.name) {
                error(format!("step name '{}' must be a lowercase slug", step.name));
            }
            if !step.workspace.is_empty() && !paths::is_valid_name(&step.workspace) {
                error(format!(
                    "step '{}' workspace '{}' must be a lowercase slug",
                    step.name, step.workspace
                ));
            }
            if !keys.insert(step.key()) {
                error(format!("duplicate step '{}'", step.key()));
            }

            let mut names = HashSet::new();
            for module in &step.modules {
                if !names.insert(module.name.as_str()) {
                    error(format!(
                        "duplicate module '{}' in step '{}'",
                        module.name,
                        step.key()
                    ));
                }
                if module.is_client() {
                    if module.version.trim().is_empty() {
                        error(format!(
                            "client module '{}' in step '{}' needs a version",
                            module.name,
                            step.key()
                        ));
                    }
                } else if !release::is_stable(&module.version)
                    && release::parse_version(&module.version).is_err()
                {
                    error(format!(
                        "module '{}' in step '{}' has invalid version '{}'",
                        module.name,
                        step.key(),
                        module.version
                    ));
                }
            }
        }

        let managed = self
            .steps
            .iter()
            .flat_map(|s| s.modules.iter())
            .any(|m| !m.is_client());
        if managed && self.sources.is_empty() {
            error("managed modules are configured but no sources are defined".to_string());
        }

        for step in &self.steps {
            if step.modules.is_empty() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("step '{}' has no modules", step.key()),
                });
            }
        }

        if self.pipeline.max_parallel == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "pipeline.max_parallel is 0; steps will run one at a time".to_string(),
            });
        }

        warnings
    }
}

fn step_field(step: &Step, rest: &[&str]) -> Option<String> {
    match rest {
        ["name"] => Some(step.name.clone()),
        ["workspace"] => Some(step.workspace.clone()),
        ["type"] => Some(step.step_type.to_string()),
        ["approve"] => Some(step.approval().to_string()),
        ["vpc", "id"] => step.vpc.as_ref().map(|v| v.id.clone()),
        ["kubernetes", "cluster_name"] => step.kubernetes.as_ref().map(|k| k.cluster_name.clone()),
        ["modules", module, field] => {
            let m = match module.parse::<usize>() {
                Ok(idx) => step.modules.get(idx)?,
                Err(_) => step.module(module)?,
            };
            match *field {
                "name" => Some(m.name.clone()),
                "source" => Some(m.source.clone()),
                "version" => Some(m.version.clone()),
                _ => None,
            }
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("config not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("malformed version '{0}'")]
    MalformedVersion(String),

    #[error("source not found: {0}")]
    SourceNotFound(String),

    #[error("source '{0}' has no releases")]
    NoReleases(String),

    #[error("invalid checksum manifest line {line}: {content}")]
    InvalidManifest { line: usize, content: String },

    #[error("no source serves module '{module}' ({module_source}) in step '{step}'")]
    ModuleSourceNotFound {
        step: String,
        module: String,
        module_source: String,
    },

    #[error("step not found: {0}")]
    StepNotFound(String),

    #[error("module '{module}' not found in step '{step}'")]
    ModuleNotFound { step: String, module: String },

    #[error("module type '{module_type}' matched {matches} modules, expected exactly one")]
    AmbiguousModuleType { module_type: String, matches: usize },

    #[error("unknown replacement tag type '{0}'")]
    UnknownTagType(String),

    #[error("malformed replacement tag '{0}'")]
    MalformedTag(String),

    #[error("unknown config field '{0}'")]
    UnknownConfigField(String),

    #[error("tag '{0}' is only valid inside module input files")]
    ModuleTagOutsideModule(String),

    #[error("parameter not found: {0}")]
    ParameterNotFound(String),

    #[error("index {index} out of range for '{name}' ({len} values)")]
    IndexOutOfRange {
        name: String,
        index: usize,
        len: usize,
    },

    #[error("invalid range [{start}-{end}] for '{name}'")]
    InvalidRange {
        name: String,
        start: usize,
        end: usize,
    },

    #[error("{file}: invalid content after substitution: {reason}")]
    TemplateValidation { file: String, reason: String },

    #[error("parameter store error: {0}")]
    ParameterStore(String),

    #[error("pipeline for step '{step}' failed: {reason}")]
    Pipeline { step: String, reason: String },

    #[error("plan for step '{step}' rejected by approval policy")]
    PlanRejected { step: String },

    #[error("manual approval denied for step '{step}'")]
    ApprovalDenied { step: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RolloutError {
    pub fn is_parameter_not_found(&self) -> bool {
        matches!(self, RolloutError::ParameterNotFound(_))
    }

    /// Errors that may succeed on the sequential retry pass: missing
    /// parameters (another step may publish them) and pipeline failures.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RolloutError::ParameterNotFound(_) | RolloutError::Pipeline { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RolloutError>;

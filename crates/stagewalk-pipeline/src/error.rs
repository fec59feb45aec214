use stagewalk_core::config::StepKey;
use stagewalk_core::RolloutError;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("`{command}` {status}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("step directory {0} does not exist")]
    MissingStepDir(PathBuf),

    #[error("unknown execution {0}")]
    UnknownExecution(Uuid),

    #[error("`{command}` printed invalid JSON: {source}")]
    Output {
        command: String,
        #[source]
        source: serde_json::Error,
    },
}

impl PipelineError {
    /// Captured stderr of a failed command, if any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            PipelineError::CommandFailed { stderr, .. } if !stderr.is_empty() => Some(stderr),
            _ => None,
        }
    }

    /// Report as a step execution failure, which the orchestrator may retry.
    pub fn into_rollout(self, step: &StepKey) -> RolloutError {
        let reason = match self.stderr() {
            Some(stderr) => format!("{self}\nstderr: {stderr}"),
            None => self.to_string(),
        };
        RolloutError::Pipeline {
            step: step.to_string(),
            reason,
        }
    }
}

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use stagewalk_core::approval::{Approval, ChangeCounts};
use stagewalk_core::artifact::ResolvedStep;
use stagewalk_core::config::{CommandSet, Config, PipelineConfig, StepKey, StepType};
use stagewalk_core::executor::{ExecutionHandle, PipelineExecutor};
use stagewalk_core::orchestrator::RolloutOptions;
use stagewalk_core::{paths, RolloutError};
use tracing::{info, warn};
use uuid::Uuid;

use crate::approver::Approver;
use crate::plan::parse_plan;
use crate::process::run_shell;
use crate::PipelineError;

struct Job {
    key: StepKey,
    dir: PathBuf,
    commands: CommandSet,
    env: Vec<(String, String)>,
}

/// Runs each step's plan and apply commands in its artifact directory.
pub struct ScriptExecutor {
    pipeline: PipelineConfig,
    prefix: String,
    steps_dir: PathBuf,
    step_types: HashMap<StepKey, StepType>,
    approver: Arc<dyn Approver>,
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl ScriptExecutor {
    pub fn new(config: &Config, options: &RolloutOptions, approver: Arc<dyn Approver>) -> Self {
        Self {
            pipeline: config.pipeline.clone(),
            prefix: options.prefix.clone(),
            steps_dir: options.steps_dir.clone(),
            step_types: config.steps.iter().map(|s| (s.key(), s.step_type)).collect(),
            approver,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn commands(&self, key: &StepKey) -> &CommandSet {
        let step_type = self.step_types.get(key).copied().unwrap_or_default();
        self.pipeline.commands_for(step_type)
    }

    fn take_job(&self, id: Uuid) -> Option<Job> {
        self.jobs.lock().ok().and_then(|mut jobs| jobs.remove(&id))
    }

    async fn run_job(&self, job: &Job, approval: Approval) -> Result<ChangeCounts, RolloutError> {
        let fail = |e: PipelineError| e.into_rollout(&job.key);

        let plan = run_shell(&job.commands.plan, &job.dir, &job.env)
            .await
            .map_err(fail)?;
        let counts = parse_plan(&plan.stdout);
        info!(step = %job.key, %approval, "plan: {counts}");

        if approval == Approval::Reject {
            return Err(RolloutError::PlanRejected {
                step: job.key.to_string(),
            });
        }
        if counts.is_empty() {
            info!(step = %job.key, "no changes, skipping apply");
            return Ok(counts);
        }
        if approval.requires_gate(&counts) {
            let approved = self
                .approver
                .approve(&job.key, &counts, &plan.stdout)
                .await
                .map_err(fail)?;
            if !approved {
                warn!(step = %job.key, "apply not approved");
                return Err(RolloutError::ApprovalDenied {
                    step: job.key.to_string(),
                });
            }
        }

        run_shell(&job.commands.apply, &job.dir, &job.env)
            .await
            .map_err(fail)?;
        info!(step = %job.key, "applied");
        Ok(counts)
    }
}

#[async_trait]
impl PipelineExecutor for ScriptExecutor {
    async fn create_or_update(&self, step: &ResolvedStep) -> stagewalk_core::Result<ExecutionHandle> {
        if !step.dir.is_dir() {
            return Err(PipelineError::MissingStepDir(step.dir.clone()).into_rollout(&step.key));
        }
        let handle = ExecutionHandle::new(step.key.clone());
        let job = Job {
            key: step.key.clone(),
            dir: step.dir.clone(),
            commands: self.pipeline.commands_for(step.step.step_type).clone(),
            env: vec![
                ("STAGEWALK_STEP".into(), step.key.name.clone()),
                ("STAGEWALK_WORKSPACE".into(), step.key.workspace.clone()),
                ("STAGEWALK_RELEASE_INDEX".into(), step.release_index.to_string()),
                ("STAGEWALK_FIRST_APPLY".into(), step.first_apply.to_string()),
            ],
        };
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.insert(handle.id, job);
        }
        Ok(handle)
    }

    async fn wait_for_completion(
        &self,
        handle: &ExecutionHandle,
        approval: Approval,
    ) -> stagewalk_core::Result<ChangeCounts> {
        let job = self
            .take_job(handle.id)
            .ok_or_else(|| PipelineError::UnknownExecution(handle.id).into_rollout(&handle.step))?;
        self.run_job(&job, approval).await
    }

    async fn outputs(&self, step: &StepKey) -> stagewalk_core::Result<Option<Value>> {
        let command = &self.commands(step).output;
        if command.trim().is_empty() {
            return Ok(None);
        }
        let dir = self.steps_dir.join(paths::step_dir_name(&self.prefix, step));
        if !dir.is_dir() {
            return Ok(None);
        }

        let out = run_shell(command, &dir, &[])
            .await
            .map_err(|e| e.into_rollout(step))?;
        if out.stdout.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&out.stdout).map(Some).map_err(|source| {
            PipelineError::Output {
                command: command.clone(),
                source,
            }
            .into_rollout(step)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StaticApprover;
    use stagewalk_core::config::Step;
    use std::path::Path;
    use tempfile::TempDir;

    const PLAN_ADD: &str = "echo 'Plan: 1 to add, 0 to change, 0 to destroy.'";
    const PLAN_CHANGE: &str = "echo 'Plan: 0 to add, 2 to change, 0 to destroy.'";

    fn config(plan: &str, output: &str) -> Config {
        let mut cfg = Config::new("ep");
        cfg.steps.push(serde_yaml::from_str("name: net\n").unwrap());
        cfg.pipeline.terraform = CommandSet {
            plan: plan.into(),
            apply: "echo \"$STAGEWALK_STEP\" > applied".into(),
            output: output.into(),
        };
        cfg
    }

    fn executor(root: &Path, cfg: &Config, approve: bool) -> ScriptExecutor {
        let options = RolloutOptions::for_root(root, cfg);
        ScriptExecutor::new(cfg, &options, Arc::new(StaticApprover(approve)))
    }

    fn resolved(root: &Path, cfg: &Config, approval: Approval) -> ResolvedStep {
        let step: Step = cfg.steps[0].clone();
        let key = step.key();
        let dir = paths::steps_dir(root).join(paths::step_dir_name("ep", &key));
        std::fs::create_dir_all(&dir).unwrap();
        ResolvedStep {
            key,
            step,
            modules: Vec::new(),
            files: Vec::new(),
            approval,
            first_apply: true,
            release_index: 0,
            dir,
        }
    }

    async fn run(exec: &ScriptExecutor, step: &ResolvedStep) -> stagewalk_core::Result<ChangeCounts> {
        let handle = exec.create_or_update(step).await?;
        exec.wait_for_completion(&handle, step.approval).await
    }

    #[tokio::test]
    async fn plan_then_apply() {
        let dir = TempDir::new().unwrap();
        let cfg = config(PLAN_ADD, "");
        let exec = executor(dir.path(), &cfg, false);
        let step = resolved(dir.path(), &cfg, Approval::Manual);

        let counts = run(&exec, &step).await.unwrap();
        assert_eq!(counts.added, 1);
        let applied = std::fs::read_to_string(step.dir.join("applied")).unwrap();
        assert_eq!(applied, "net\n");
    }

    #[tokio::test]
    async fn manual_gate_denied() {
        let dir = TempDir::new().unwrap();
        let cfg = config(PLAN_CHANGE, "");
        let exec = executor(dir.path(), &cfg, false);
        let step = resolved(dir.path(), &cfg, Approval::Manual);

        let err = run(&exec, &step).await.unwrap_err();
        assert!(matches!(err, RolloutError::ApprovalDenied { .. }));
        assert!(!step.dir.join("applied").exists());
    }

    #[tokio::test]
    async fn manual_gate_approved() {
        let dir = TempDir::new().unwrap();
        let cfg = config(PLAN_CHANGE, "");
        let exec = executor(dir.path(), &cfg, true);
        let step = resolved(dir.path(), &cfg, Approval::Manual);

        run(&exec, &step).await.unwrap();
        assert!(step.dir.join("applied").exists());
    }

    #[tokio::test]
    async fn reject_stops_after_plan() {
        let dir = TempDir::new().unwrap();
        let cfg = config(PLAN_ADD, "");
        let exec = executor(dir.path(), &cfg, true);
        let step = resolved(dir.path(), &cfg, Approval::Reject);

        let err = run(&exec, &step).await.unwrap_err();
        assert!(matches!(err, RolloutError::PlanRejected { .. }));
        assert!(!step.dir.join("applied").exists());
    }

    #[tokio::test]
    async fn empty_plan_skips_apply() {
        let dir = TempDir::new().unwrap();
        let cfg = config("echo 'No changes.'", "");
        let exec = executor(dir.path(), &cfg, false);
        let step = resolved(dir.path(), &cfg, Approval::Manual);

        assert!(run(&exec, &step).await.unwrap().is_empty());
        assert!(!step.dir.join("applied").exists());
    }

    #[tokio::test]
    async fn failing_plan_is_retryable_pipeline_error() {
        let dir = TempDir::new().unwrap();
        let cfg = config("echo bad credentials >&2; exit 1", "");
        let exec = executor(dir.path(), &cfg, true);
        let step = resolved(dir.path(), &cfg, Approval::Auto);

        let err = run(&exec, &step).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("bad credentials"));
    }

    #[tokio::test]
    async fn missing_step_dir_fails_create() {
        let dir = TempDir::new().unwrap();
        let cfg = config(PLAN_ADD, "");
        let exec = executor(dir.path(), &cfg, true);
        let mut step = resolved(dir.path(), &cfg, Approval::Auto);
        step.dir = dir.path().join("nowhere");

        assert!(exec.create_or_update(&step).await.is_err());
    }

    #[tokio::test]
    async fn outputs_parse_json() {
        let dir = TempDir::new().unwrap();
        let cfg = config(PLAN_ADD, r#"echo '{"vpc__id": {"value": "vpc-123"}}'"#);
        let exec = executor(dir.path(), &cfg, true);
        let key = StepKey::new("net", "");

        assert_eq!(exec.outputs(&key).await.unwrap(), None);

        resolved(dir.path(), &cfg, Approval::Auto);
        let outputs = exec.outputs(&key).await.unwrap().unwrap();
        assert_eq!(outputs["vpc__id"]["value"], "vpc-123");
    }

    #[tokio::test]
    async fn invalid_output_json_is_an_error() {
        let dir = TempDir::new().unwrap();
        let cfg = config(PLAN_ADD, "echo not-json");
        let exec = executor(dir.path(), &cfg, true);
        resolved(dir.path(), &cfg, Approval::Auto);

        assert!(exec.outputs(&StepKey::new("net", "")).await.is_err());
    }
}

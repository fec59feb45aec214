//! The rollout control loop.
//!
//! Releases of the walk run strictly one after another. Within a release,
//! steps are processed in config order: versions are resolved, templates
//! rendered and artifacts written, then the step is skipped, executed
//! inline, or (first application with settled targets) dispatched to a
//! bounded [`TaskGroup`]. State is written only by this loop, after every
//! step of the release has settled and again after the retry pass.

mod group;

pub use group::TaskGroup;

use crate::approval::{Approval, ChangeCounts};
use crate::artifact::{IncludedFile, ResolvedModule, ResolvedStep, StepWriter};
use crate::config::{ApprovalPolicy, Config, Module, Step, StepKey};
use crate::detector;
use crate::error::{Result, RolloutError};
use crate::executor::PipelineExecutor;
use crate::observer::{RolloutEvent, RolloutObserver, StepPhase};
use crate::outputs::OutputCache;
use crate::params::ParameterStore;
use crate::paths;
use crate::resolver::{self, Walk};
use crate::source::SourceRegistry;
use crate::state::{State, StateStep};
use crate::template::{self, AgentValues, ModuleScope, TemplateContext};
use chrono::Utc;
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Options / collaborators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RolloutOptions {
    pub parallel: bool,
    pub max_parallel: usize,
    pub prefix: String,
    pub account_id: String,
    pub state_path: PathBuf,
    /// `config/`: included files and module input files per step.
    pub config_dir: PathBuf,
    /// `steps/`: written step artifacts.
    pub steps_dir: PathBuf,
}

impl RolloutOptions {
    pub fn for_root(root: &Path, config: &Config) -> Self {
        Self {
            parallel: config.pipeline.parallel,
            max_parallel: config.pipeline.max_parallel,
            prefix: config.prefix.clone(),
            account_id: String::new(),
            state_path: paths::state_path(root),
            config_dir: paths::config_dir(root),
            steps_dir: paths::steps_dir(root),
        }
    }
}

pub struct Services {
    pub params: Arc<dyn ParameterStore>,
    pub executor: Arc<dyn PipelineExecutor>,
    pub writer: Arc<dyn StepWriter>,
    pub observer: Arc<dyn RolloutObserver>,
}

// ---------------------------------------------------------------------------
// Run summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Applied(ChangeCounts),
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub release: usize,
    pub step: StepKey,
    pub status: StepStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub walk: Walk,
    pub outcomes: Vec<StepOutcome>,
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

struct AppliedModule {
    name: String,
    checksum: String,
    source: Option<String>,
}

struct Execution {
    counts: ChangeCounts,
    outputs: Option<serde_json::Value>,
    modules: Vec<AppliedModule>,
}

async fn execute(executor: &dyn PipelineExecutor, step: &ResolvedStep) -> Result<Execution> {
    let handle = executor.create_or_update(step).await?;
    let counts = executor.wait_for_completion(&handle, step.approval).await?;
    let outputs = executor.outputs(&step.key).await?;
    Ok(Execution {
        counts,
        outputs,
        modules: step
            .modules
            .iter()
            .map(|m| AppliedModule {
                name: m.module.name.clone(),
                checksum: m.checksum.clone(),
                source: m.version.source_url.clone(),
            })
            .collect(),
    })
}

enum Disposition {
    Finished(StepStatus),
    Dispatched,
}

/// Failures that the sequential retry pass may fix.
fn deferrable(err: &RolloutError, in_flight: bool) -> bool {
    match err {
        RolloutError::ParameterNotFound(_) => in_flight,
        RolloutError::Pipeline { .. } => true,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Agent values
// ---------------------------------------------------------------------------

/// `agent.version.<step>.<module>`: the version decision for another
/// module at the current release, without gating.
struct AgentVersions<'a> {
    config: &'a Config,
    state: &'a State,
    registry: &'a SourceRegistry,
    index: usize,
}

impl AgentValues for AgentVersions<'_> {
    fn module_version(&self, step: &str, module: &str) -> Result<String> {
        let target = self
            .config
            .step_named(step)
            .ok_or_else(|| RolloutError::StepNotFound(step.to_string()))?;
        let declared = target
            .module(module)
            .ok_or_else(|| RolloutError::ModuleNotFound {
                step: step.to_string(),
                module: module.to_string(),
            })?;
        let recorded = self.state.module(&target.key(), module);
        let mv = resolver::module_version(
            step,
            declared,
            recorded,
            self.index,
            ApprovalPolicy::Never,
            self.registry,
        )?;
        Ok(mv.version)
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    config: Config,
    state: State,
    registry: SourceRegistry,
    services: Services,
    outputs: OutputCache,
    options: RolloutOptions,
    parallel: bool,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        state: State,
        registry: SourceRegistry,
        services: Services,
        options: RolloutOptions,
    ) -> Self {
        let parallel = options.parallel;
        Self {
            config,
            state,
            registry,
            services,
            outputs: OutputCache::new(),
            options,
            parallel,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn outputs(&self) -> &OutputCache {
        &self.outputs
    }

    /// Walk every release. On error, state for the steps that completed
    /// has already been persisted.
    pub async fn run(&mut self) -> Result<RunSummary> {
        for key in self.state.remove_stale(&self.config) {
            info!(step = %key, "removing state of step no longer in config");
        }

        let walk = resolver::plan_walk(&self.config, &self.state, &mut self.registry)?;
        self.emit(RolloutEvent::WalkPlanned {
            oldest: walk.oldest.clone(),
            newest: walk.newest.clone(),
            len: walk.len,
        });

        self.prime_outputs().await;

        let mut outcomes = Vec::new();
        for index in 0..walk.len {
            self.registry.advance(index);
            let tags = self
                .registry
                .iter()
                .filter_map(|s| s.current_release())
                .map(|r| r.tag.clone())
                .collect();
            self.emit(RolloutEvent::ReleaseStarted { index, tags });
            self.run_release(index, &mut outcomes).await?;
        }

        Ok(RunSummary { walk, outcomes })
    }

    async fn prime_outputs(&mut self) {
        let applied: Vec<StepKey> = self
            .config
            .steps
            .iter()
            .map(Step::key)
            .filter(|k| {
                self.state
                    .step(k)
                    .is_some_and(|s| !s.is_first_application())
            })
            .collect();
        for key in applied {
            match self.services.executor.outputs(&key).await {
                Ok(Some(outputs)) => self.outputs.insert(key.name.clone(), outputs),
                Ok(None) => {}
                Err(e) => warn!(step = %key, error = %e, "could not load step outputs"),
            }
        }
    }

    async fn run_release(&mut self, index: usize, outcomes: &mut Vec<StepOutcome>) -> Result<()> {
        let mut group: TaskGroup<Execution> = TaskGroup::new(self.options.max_parallel);
        let mut retry: Vec<StepKey> = Vec::new();
        let mut fatal: Option<RolloutError> = None;

        let steps = self.config.steps.clone();
        for step in &steps {
            let key = step.key();
            match self.process_step(index, step, &mut group).await {
                Ok(Disposition::Finished(status)) => outcomes.push(StepOutcome {
                    release: index,
                    step: key,
                    status,
                }),
                Ok(Disposition::Dispatched) => {}
                Err(e) if self.parallel && deferrable(&e, !group.is_empty()) => {
                    self.emit_step(index, &key, StepPhase::Deferred(e.to_string()));
                    retry.push(key);
                }
                Err(e) => {
                    self.emit_step(index, &key, StepPhase::Failed(e.to_string()));
                    fatal = Some(e);
                    break;
                }
            }
        }

        for (key, result) in group.join().await {
            match result {
                Ok(execution) => {
                    let counts = self.complete(index, &key, execution);
                    outcomes.push(StepOutcome {
                        release: index,
                        step: key,
                        status: StepStatus::Applied(counts),
                    });
                }
                Err(e) if e.is_retryable() && fatal.is_none() => {
                    self.emit_step(index, &key, StepPhase::Deferred(e.to_string()));
                    retry.push(key);
                }
                Err(e) => {
                    self.emit_step(index, &key, StepPhase::Failed(e.to_string()));
                    fatal.get_or_insert(e);
                }
            }
        }

        self.persist()?;
        if let Some(e) = fatal {
            return Err(e);
        }

        if retry.is_empty() {
            return Ok(());
        }

        // config order, so a step publishing outputs runs before its readers
        retry.sort_by_key(|key| self.config.steps.iter().position(|s| s.key() == *key));

        self.parallel = false;
        self.emit(RolloutEvent::RetryPass {
            index,
            steps: retry.clone(),
        });
        for key in retry {
            let Some(step) = self.config.step(&key).cloned() else {
                continue;
            };
            match self.process_step(index, &step, &mut group).await {
                Ok(Disposition::Finished(status)) => outcomes.push(StepOutcome {
                    release: index,
                    step: key,
                    status,
                }),
                Ok(Disposition::Dispatched) => {}
                Err(e) => {
                    self.emit_step(index, &key, StepPhase::Failed(e.to_string()));
                    self.persist()?;
                    return Err(e);
                }
            }
        }
        self.persist()
    }

    async fn process_step(
        &mut self,
        index: usize,
        step: &Step,
        group: &mut TaskGroup<Execution>,
    ) -> Result<Disposition> {
        let key = step.key();
        self.emit_step(index, &key, StepPhase::Pending);

        let resolved = self.prepare(step, index)?;
        self.services.writer.write(&resolved)?;
        self.emit_step(index, &key, StepPhase::FilesWritten);

        let recorded = self.state.step(&key);
        let first = recorded.map_or(true, StateStep::is_first_application);
        if !first {
            let changes = detector::detect(step, &resolved.modules, recorded, &self.registry);
            if changes.is_empty() {
                self.record_targets(&resolved);
                if let Some(s) = self.state.step_mut(&key) {
                    s.mark_skipped(Utc::now());
                }
                self.emit_step(index, &key, StepPhase::Skipped);
                return Ok(Disposition::Finished(StepStatus::Skipped));
            }
            debug!(
                step = %key,
                changes = %changes.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "),
                "step changed"
            );
        }

        let settled = self.targets_settled(&resolved);
        self.record_targets(&resolved);

        if first && self.parallel && settled {
            self.emit_step(index, &key, StepPhase::Executing { parallel: true });
            let executor = Arc::clone(&self.services.executor);
            group.spawn(key, async move { execute(executor.as_ref(), &resolved).await });
            return Ok(Disposition::Dispatched);
        }

        self.emit_step(index, &key, StepPhase::Executing { parallel: false });
        let execution = execute(self.services.executor.as_ref(), &resolved).await?;
        let counts = self.complete(index, &key, execution);
        Ok(Disposition::Finished(StepStatus::Applied(counts)))
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    /// Resolve versions and templates for `step` at release `index`. The
    /// returned step is a new value.
    fn prepare(&self, step: &Step, index: usize) -> Result<ResolvedStep> {
        let key = step.key();
        let policy = step.approval();
        let recorded = self.state.step(&key);

        let versions = step
            .modules
            .iter()
            .map(|m| {
                resolver::module_version(
                    &step.name,
                    m,
                    recorded.and_then(|s| s.module(&m.name)),
                    index,
                    policy,
                    &self.registry,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let agent = AgentVersions {
            config: &self.config,
            state: &self.state,
            registry: &self.registry,
            index,
        };
        let ctx = TemplateContext {
            config: &self.config,
            prefix: &self.options.prefix,
            account_id: &self.options.account_id,
            params: self.services.params.as_ref(),
            outputs: &self.outputs,
            agent: Some(&agent),
        };

        let mut modules = Vec::with_capacity(step.modules.len());
        for (module, version) in step.modules.iter().zip(versions) {
            let (inputs, checksum) = self.module_inputs(&ctx, step, module)?;
            let mut resolved = module.clone();
            resolved.inputs = inputs;
            resolved.version = version.version.clone();
            modules.push(ResolvedModule {
                module: resolved,
                version,
                checksum,
            });
        }

        let mut skeleton = step.clone();
        for m in &mut skeleton.modules {
            m.inputs = Mapping::new();
        }
        let rendered = ctx.render_value(&serde_yaml::to_value(&skeleton)?, None)?;
        let mut resolved_step: Step = serde_yaml::from_value(rendered.value)?;
        resolved_step.modules = modules.iter().map(|m| m.module.clone()).collect();

        let mut files = Vec::with_capacity(step.files.len());
        for rel in &step.files {
            let path = self.options.config_dir.join(&step.name).join(rel);
            let text = std::fs::read_to_string(&path).map_err(|e| {
                RolloutError::InvalidConfig(format!(
                    "included file {} of step '{key}': {e}",
                    path.display()
                ))
            })?;
            let rendered = ctx.render_file(rel, &text, None)?;
            files.push(IncludedFile {
                path: rel.clone(),
                content: rendered.content,
            });
        }

        let auto = modules.iter().all(|m| m.version.auto_approve);
        let dir = self
            .options
            .steps_dir
            .join(paths::step_dir_name(&self.options.prefix, &key));
        Ok(ResolvedStep {
            approval: Approval::for_policy(policy, auto),
            first_apply: recorded.map_or(true, StateStep::is_first_application),
            key,
            step: resolved_step,
            modules,
            files,
            release_index: index,
            dir,
        })
    }

    /// Render a module's inline inputs and its optional
    /// `config/<step>/<module>.yaml`; file keys override inline keys. The
    /// checksum covers both documents after the immediate pass.
    fn module_inputs(
        &self,
        ctx: &TemplateContext<'_>,
        step: &Step,
        module: &Module,
    ) -> Result<(Mapping, String)> {
        let scope = ModuleScope { step, module };
        let file_name = format!("{}.yaml", module.name);

        let inline = Value::Mapping(module.inputs.clone());
        let rendered = ctx.render_value(&inline, Some(&scope))?;
        let mut inputs = into_mapping(rendered.value)?;
        let mut intermediate = rendered.intermediate;

        let path = self.options.config_dir.join(&step.name).join(&file_name);
        if let Some(text) = crate::io::read_optional(&path)? {
            let rendered = ctx.render_file(&file_name, &text, Some(&scope))?;
            for (k, v) in parse_mapping(&rendered.content)? {
                inputs.insert(k, v);
            }
            intermediate.push_str(&rendered.intermediate);
        }

        Ok((inputs, template::checksum(&intermediate)))
    }

    // -----------------------------------------------------------------------
    // State updates
    // -----------------------------------------------------------------------

    /// Every module's recorded target is unset or already equals the new
    /// target.
    fn targets_settled(&self, resolved: &ResolvedStep) -> bool {
        resolved.modules.iter().all(|m| {
            match self.state.module(&resolved.key, &m.module.name) {
                Some(recorded) if !recorded.version.is_empty() => {
                    recorded.version == m.version.version
                }
                _ => true,
            }
        })
    }

    fn record_targets(&mut self, resolved: &ResolvedStep) {
        let step = self.state.get_or_create_step(&resolved.key);
        step.retain_modules(resolved.modules.iter().map(|m| m.module.name.as_str()));
        for m in &resolved.modules {
            let recorded = step.get_or_create_module(&m.module.name);
            recorded.version = m.version.version.clone();
            recorded.module_type = m.module.module_type();
            recorded.auto_approve = m.version.auto_approve;
        }
    }

    fn complete(&mut self, index: usize, key: &StepKey, execution: Execution) -> ChangeCounts {
        let step = self.state.get_or_create_step(key);
        for applied in &execution.modules {
            if let Some(m) = step.module_mut(&applied.name) {
                m.checksum = Some(applied.checksum.clone());
                if let Some(source) = &applied.source {
                    m.source = source.clone();
                }
            }
        }
        step.mark_applied(Utc::now());

        if let Some(outputs) = execution.outputs {
            self.outputs.insert(key.name.clone(), outputs);
        }
        self.emit_step(index, key, StepPhase::Applied(execution.counts));
        execution.counts
    }

    fn persist(&mut self) -> Result<()> {
        self.state.base_config_version = Some(self.config.version.clone());
        self.state.save_to(&self.options.state_path)?;
        self.emit(RolloutEvent::StatePersisted {
            path: self.options.state_path.clone(),
        });
        Ok(())
    }

    fn emit(&self, event: RolloutEvent) {
        self.services.observer.on_event(&event);
    }

    fn emit_step(&self, index: usize, step: &StepKey, phase: StepPhase) {
        self.emit(RolloutEvent::Step {
            index,
            step: step.clone(),
            phase,
        });
    }
}

fn parse_mapping(text: &str) -> Result<Mapping> {
    if text.trim().is_empty() {
        return Ok(Mapping::new());
    }
    into_mapping(serde_yaml::from_str(text)?)
}

fn into_mapping(value: Value) -> Result<Mapping> {
    match value {
        Value::Mapping(m) => Ok(m),
        Value::Null => Ok(Mapping::new()),
        other => Err(RolloutError::InvalidConfig(format!(
            "module inputs must be a mapping, got {other:?}"
        ))),
    }
}

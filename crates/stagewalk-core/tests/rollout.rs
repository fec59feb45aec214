use async_trait::async_trait;
use serde_json::{json, Value};
use serde_yaml::Mapping;
use stagewalk_core::approval::{Approval, ChangeCounts};
use stagewalk_core::artifact::{FileStepWriter, ResolvedStep};
use stagewalk_core::config::{Config, StepKey};
use stagewalk_core::executor::{ExecutionHandle, PipelineExecutor};
use stagewalk_core::observer::{CapturingObserver, RolloutEvent, StepPhase};
use stagewalk_core::orchestrator::{Orchestrator, RolloutOptions, Services, StepStatus};
use stagewalk_core::params::{MemoryParameterStore, Parameter};
use stagewalk_core::source::{Manifest, MemorySourceBackend, SourceRegistry};
use stagewalk_core::state::State;
use stagewalk_core::{paths, RolloutError};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use uuid::Uuid;

const URL: &str = "https://github.com/acme/infralib";
const RELEASES: [&str; 3] = ["v1.0.0", "v1.1.0", "v2.0.0"];

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Call {
    step: String,
    versions: HashMap<String, String>,
    inputs: HashMap<String, Mapping>,
    approval: Approval,
}

#[derive(Default)]
struct FakeExecutor {
    pending: Mutex<HashMap<Uuid, ResolvedStep>>,
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashMap<String, usize>>,
    applied: Mutex<HashSet<String>>,
    outputs: HashMap<String, Value>,
}

impl FakeExecutor {
    fn with_outputs(outputs: HashMap<String, Value>) -> Self {
        Self {
            outputs,
            ..Default::default()
        }
    }

    fn fail(&self, step: &str, times: usize) {
        self.failures.lock().unwrap().insert(step.to_string(), times);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_for(&self, step: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.step == step).collect()
    }
}

#[async_trait]
impl PipelineExecutor for FakeExecutor {
    async fn create_or_update(&self, step: &ResolvedStep) -> stagewalk_core::Result<ExecutionHandle> {
        let handle = ExecutionHandle::new(step.key.clone());
        self.pending.lock().unwrap().insert(handle.id, step.clone());
        Ok(handle)
    }

    async fn wait_for_completion(
        &self,
        handle: &ExecutionHandle,
        approval: Approval,
    ) -> stagewalk_core::Result<ChangeCounts> {
        let step = self
            .pending
            .lock()
            .unwrap()
            .remove(&handle.id)
            .expect("unknown handle");
        let name = step.key.name.clone();
        self.calls.lock().unwrap().push(Call {
            step: name.clone(),
            versions: step
                .modules
                .iter()
                .map(|m| (m.module.name.clone(), m.version.version.clone()))
                .collect(),
            inputs: step
                .modules
                .iter()
                .map(|m| (m.module.name.clone(), m.module.inputs.clone()))
                .collect(),
            approval,
        });

        if let Some(remaining) = self.failures.lock().unwrap().get_mut(&name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RolloutError::Pipeline {
                    step: name,
                    reason: "apply exited with status 1".into(),
                });
            }
        }
        if approval == Approval::Reject {
            return Err(RolloutError::PlanRejected { step: name });
        }
        self.applied.lock().unwrap().insert(name);
        Ok(ChangeCounts {
            added: 0,
            changed: 1,
            destroyed: 0,
        })
    }

    async fn outputs(&self, step: &StepKey) -> stagewalk_core::Result<Option<Value>> {
        if !self.applied.lock().unwrap().contains(&step.name) {
            return Ok(None);
        }
        Ok(self.outputs.get(&step.name).cloned())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Three releases. `identical` keeps every checksum the same across them.
fn backend(identical: bool) -> MemorySourceBackend {
    let mut backend = MemorySourceBackend::new();
    for (i, tag) in RELEASES.iter().enumerate() {
        let digest = |base: &str| {
            if identical {
                base.to_string()
            } else {
                format!("{base}{i}")
            }
        };
        let mut m = Manifest::new();
        m.insert("modules/aws/vpc", digest("aa"));
        m.insert("modules/k8s/argocd", digest("bb"));
        m.insert("providers/aws", digest("cc"));
        backend.add_release(URL, tag, m);
    }
    backend
}

struct Harness {
    dir: TempDir,
    executor: Arc<FakeExecutor>,
    observer: Arc<CapturingObserver>,
    params: Arc<MemoryParameterStore>,
}

impl Harness {
    fn new(executor: FakeExecutor) -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            executor: Arc::new(executor),
            observer: Arc::new(CapturingObserver::new()),
            params: Arc::new(MemoryParameterStore::new()),
        }
    }

    fn orchestrator(&self, config: &Config, backend: &MemorySourceBackend, parallel: bool) -> Orchestrator {
        let state = State::load(self.dir.path()).unwrap();
        let registry = SourceRegistry::load(config, backend).unwrap();
        let mut options = RolloutOptions::for_root(self.dir.path(), config);
        options.parallel = parallel;
        options.account_id = "123456789012".into();
        Orchestrator::new(
            config.clone(),
            state,
            registry,
            Services {
                params: self.params.clone(),
                executor: self.executor.clone(),
                writer: Arc::new(FileStepWriter),
                observer: self.observer.clone(),
            },
            options,
        )
    }

    fn saved_state(&self) -> State {
        State::load(self.dir.path()).unwrap()
    }

    fn applied(&self, step: &str, module: &str) -> Option<String> {
        self.saved_state()
            .module(&StepKey::new(step, ""), module)
            .and_then(|m| m.applied_version.clone())
    }
}

fn config(yaml: &str) -> Config {
    serde_yaml::from_str(yaml).unwrap()
}

const SINGLE_STEP: &str = r#"
prefix: ep
version: v1.0.0
sources:
  - url: https://github.com/acme/infralib
steps:
  - name: net
    approve: major
    modules:
      - name: vpc
        source: aws/vpc
        inputs:
          cidr: 10.0.0.0/16
"#;

const TWO_STEPS: &str = r#"
prefix: ep
sources:
  - url: https://github.com/acme/infralib
steps:
  - name: net
    approve: never
    modules:
      - name: vpc
        source: aws/vpc
  - name: apps
    approve: never
    modules:
      - name: argocd
        source: k8s/argocd
"#;

fn versions_of(calls: &[Call], module: &str) -> Vec<String> {
    calls.iter().map(|c| c.versions[module].clone()).collect()
}

// ---------------------------------------------------------------------------
// Release walk
// ---------------------------------------------------------------------------

#[tokio::test]
async fn walks_three_releases_with_major_policy() {
    let h = Harness::new(FakeExecutor::default());
    let cfg = config(SINGLE_STEP);
    let summary = h.orchestrator(&cfg, &backend(false), true).run().await.unwrap();

    assert_eq!(summary.walk.len, 3);
    let calls = h.executor.calls();
    assert_eq!(versions_of(&calls, "vpc"), ["v1.0.0", "v1.1.0", "v2.0.0"]);
    let approvals: Vec<_> = calls.iter().map(|c| c.approval).collect();
    assert_eq!(approvals, [Approval::Auto, Approval::Auto, Approval::Manual]);
    assert_eq!(h.applied("net", "vpc").as_deref(), Some("v2.0.0"));

    let net = StepKey::new("net", "");
    assert_eq!(
        h.observer.phases(0, &net),
        [
            StepPhase::Pending,
            StepPhase::FilesWritten,
            StepPhase::Executing { parallel: true },
            StepPhase::Applied(ChangeCounts { added: 0, changed: 1, destroyed: 0 }),
        ]
    );
    assert!(h
        .observer
        .phases(1, &net)
        .contains(&StepPhase::Executing { parallel: false }));
}

#[tokio::test]
async fn minor_policy_gates_minor_release() {
    let h = Harness::new(FakeExecutor::default());
    let cfg = config(&SINGLE_STEP.replace("approve: major", "approve: minor"));
    h.orchestrator(&cfg, &backend(false), true).run().await.unwrap();

    let approvals: Vec<_> = h.executor.calls().iter().map(|c| c.approval).collect();
    assert_eq!(approvals, [Approval::Auto, Approval::Manual, Approval::Manual]);
}

#[tokio::test]
async fn unchanged_releases_are_skipped() {
    let h = Harness::new(FakeExecutor::default());
    let cfg = config(SINGLE_STEP);
    let summary = h.orchestrator(&cfg, &backend(true), true).run().await.unwrap();

    assert_eq!(h.executor.calls().len(), 1);
    let net = StepKey::new("net", "");
    assert_eq!(
        h.observer.phases(1, &net),
        [StepPhase::Pending, StepPhase::FilesWritten, StepPhase::Skipped]
    );
    let skipped = summary
        .outcomes
        .iter()
        .filter(|o| o.status == StepStatus::Skipped)
        .count();
    assert_eq!(skipped, 2);

    // skipping never confirms a version no pipeline applied
    let saved = h.saved_state();
    let step = saved.step(&net).unwrap();
    assert!(step.applied_at.is_some());
    let vpc = step.module("vpc").unwrap();
    assert_eq!(vpc.version, "v2.0.0");
    assert_eq!(vpc.applied_version.as_deref(), Some("v1.0.0"));
}

#[tokio::test]
async fn rerun_without_changes_executes_nothing() {
    let h = Harness::new(FakeExecutor::default());
    let cfg = config(SINGLE_STEP);
    h.orchestrator(&cfg, &backend(true), true).run().await.unwrap();
    let before = h.saved_state();

    let summary = h.orchestrator(&cfg, &backend(true), true).run().await.unwrap();
    assert_eq!(h.executor.calls().len(), 1);
    assert!(summary.outcomes.iter().all(|o| o.status == StepStatus::Skipped));

    let after = h.saved_state();
    let key = StepKey::new("net", "");
    assert_eq!(
        before.module(&key, "vpc").unwrap().applied_version,
        after.module(&key, "vpc").unwrap().applied_version
    );
}

#[tokio::test]
async fn applied_versions_never_regress() {
    let h = Harness::new(FakeExecutor::default());
    let cfg = config(SINGLE_STEP);
    h.orchestrator(&cfg, &backend(false), true).run().await.unwrap();

    let mut pinned = cfg.clone();
    pinned.steps[0].modules[0].version = "v1.0.0".into();
    h.orchestrator(&pinned, &backend(false), true).run().await.unwrap();

    let calls = versions_of(&h.executor.calls(), "vpc");
    let mut sorted = calls.clone();
    sorted.sort_by(|a, b| semver_of(a).cmp(&semver_of(b)));
    assert_eq!(calls, sorted);
    assert_eq!(h.applied("net", "vpc").as_deref(), Some("v2.0.0"));
}

fn semver_of(v: &str) -> semver::Version {
    stagewalk_core::release::parse_version(v).unwrap()
}

const PLATFORM_URL: &str = "https://github.com/acme/platform";

const TWO_SOURCES: &str = r#"
prefix: ep
version: v1.0.0
sources:
  - url: https://github.com/acme/infralib
  - url: https://github.com/acme/platform
steps:
  - name: net
    approve: never
    modules:
      - name: vpc
        source: aws/vpc
  - name: apps
    approve: never
    modules:
      - name: argocd
        source: k8s/argocd
"#;

/// infralib publishes three releases, platform only two.
fn two_source_backend() -> MemorySourceBackend {
    let mut backend = MemorySourceBackend::new();
    for (i, tag) in RELEASES.iter().enumerate() {
        let mut m = Manifest::new();
        m.insert("modules/aws/vpc", format!("aa{i}"));
        m.insert("providers/aws", "cc");
        backend.add_release(URL, tag, m);
    }
    for (i, tag) in ["v1.0.0", "v1.5.0"].iter().enumerate() {
        let mut m = Manifest::new();
        m.insert("modules/k8s/argocd", format!("bb{i}"));
        backend.add_release(PLATFORM_URL, tag, m);
    }
    backend
}

fn release_tags(observer: &CapturingObserver) -> Vec<Vec<String>> {
    observer
        .events()
        .into_iter()
        .filter_map(|e| match e {
            RolloutEvent::ReleaseStarted { tags, .. } => Some(tags),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn shorter_source_holds_its_newest_release() {
    let h = Harness::new(FakeExecutor::default());
    let cfg = config(TWO_SOURCES);
    let summary = h
        .orchestrator(&cfg, &two_source_backend(), true)
        .run()
        .await
        .unwrap();

    assert_eq!(summary.walk.len, 3);
    assert_eq!(
        release_tags(&h.observer),
        [
            vec!["v1.0.0", "v1.0.0"],
            vec!["v1.1.0", "v1.5.0"],
            vec!["v2.0.0", "v1.5.0"],
        ]
    );
    assert_eq!(
        versions_of(&h.executor.calls_for("net"), "vpc"),
        ["v1.0.0", "v1.1.0", "v2.0.0"]
    );
    assert_eq!(
        versions_of(&h.executor.calls_for("apps"), "argocd"),
        ["v1.0.0", "v1.5.0"]
    );
    assert_eq!(
        h.observer.phases(2, &StepKey::new("apps", "")).last(),
        Some(&StepPhase::Skipped)
    );
    assert_eq!(h.applied("net", "vpc").as_deref(), Some("v2.0.0"));
    assert_eq!(h.applied("apps", "argocd").as_deref(), Some("v1.5.0"));
    let argocd = h.saved_state();
    let argocd = argocd.module(&StepKey::new("apps", ""), "argocd").unwrap();
    assert_eq!(argocd.source, PLATFORM_URL);

    // walking again from the configured floor moves nothing backwards
    h.orchestrator(&cfg, &two_source_backend(), true)
        .run()
        .await
        .unwrap();
    assert_eq!(h.executor.calls().len(), 5);
    assert_eq!(h.applied("net", "vpc").as_deref(), Some("v2.0.0"));
    assert_eq!(h.applied("apps", "argocd").as_deref(), Some("v1.5.0"));
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

const AGENT_STEPS: &str = r#"
prefix: ep
sources:
  - url: https://github.com/acme/infralib
steps:
  - name: net
    modules:
      - name: vpc
        source: aws/vpc
  - name: apps
    files:
      - values.yaml
    modules:
      - name: argocd
        source: k8s/argocd
        inputs:
          net_version: "{{ agent.version.net.vpc }}"
          account: "{{ agent.accountId }}"
"#;

#[tokio::test]
async fn resolves_agent_values_and_included_files() {
    let h = Harness::new(FakeExecutor::default());
    let cfg = config(AGENT_STEPS);

    let apps_config = paths::config_dir(h.dir.path()).join("apps");
    std::fs::create_dir_all(&apps_config).unwrap();
    std::fs::write(
        apps_config.join("values.yaml"),
        "prefix: {{ config.prefix }}\nliteral: \"{{ `{{ .Values.name }}` }}\"\n",
    )
    .unwrap();

    h.orchestrator(&cfg, &backend(false), true).run().await.unwrap();

    let apps = h.executor.calls_for("apps");
    let inputs = &apps[0].inputs["argocd"];
    assert_eq!(inputs["net_version"].as_str(), Some("v2.0.0"));
    assert_eq!(inputs["account"].as_str(), Some("123456789012"));

    let written = std::fs::read_to_string(
        paths::steps_dir(h.dir.path()).join("ep-apps").join("values.yaml"),
    )
    .unwrap();
    assert_eq!(written, "prefix: ep\nliteral: \"{{ .Values.name }}\"\n");
    assert!(paths::steps_dir(h.dir.path()).join("ep-net/step.yaml").exists());
}

#[tokio::test]
async fn parameter_values_are_substituted_verbatim() {
    let h = Harness::new(FakeExecutor::default());
    h.params
        .insert("shared/owner", Parameter::string("it's \"ours\"\nplatform team"));
    let cfg = config(&TWO_STEPS.replace(
        "        source: k8s/argocd\n",
        "        source: k8s/argocd\n        inputs:\n          owner: \"{{ output-custom.shared/owner }}\"\n          replicas: 2\n",
    ));
    h.orchestrator(&cfg, &backend(false), true).run().await.unwrap();

    let inputs = &h.executor.calls_for("apps")[0].inputs["argocd"];
    assert_eq!(inputs["owner"].as_str(), Some("it's \"ours\"\nplatform team"));
    assert_eq!(inputs["replicas"].as_u64(), Some(2));

    let written =
        std::fs::read_to_string(paths::steps_dir(h.dir.path()).join("ep-apps").join(paths::STEP_FILE))
            .unwrap();
    let step: serde_yaml::Value = serde_yaml::from_str(&written).unwrap();
    assert_eq!(
        step["modules"][0]["inputs"]["owner"].as_str(),
        Some("it's \"ours\"\nplatform team")
    );
}

// ---------------------------------------------------------------------------
// Retry pass
// ---------------------------------------------------------------------------

fn dependent_steps() -> Config {
    config(&TWO_STEPS.replace(
        "        source: k8s/argocd\n",
        "        source: k8s/argocd\n        inputs:\n          vpc_id: \"{{ output.net.vpc.id }}\"\n",
    ))
}

#[tokio::test]
async fn missing_parameter_waits_for_parallel_step() {
    let outputs = HashMap::from([("net".to_string(), json!({"vpc__id": {"value": "vpc-123"}}))]);
    let h = Harness::new(FakeExecutor::with_outputs(outputs));
    let cfg = dependent_steps();
    h.orchestrator(&cfg, &backend(false), true).run().await.unwrap();

    let apps = h.executor.calls_for("apps");
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].inputs["argocd"]["vpc_id"].as_str(), Some("vpc-123"));

    let phases = h.observer.phases(0, &StepKey::new("apps", ""));
    assert!(matches!(phases[1], StepPhase::Deferred(_)));
    assert!(phases.contains(&StepPhase::Executing { parallel: false }));
    assert!(h
        .observer
        .events()
        .iter()
        .any(|e| matches!(e, RolloutEvent::RetryPass { steps, .. } if steps == &[StepKey::new("apps", "")])));
}

#[tokio::test]
async fn failed_publisher_is_retried_before_its_readers() {
    let outputs = HashMap::from([("net".to_string(), json!({"vpc__id": {"value": "vpc-123"}}))]);
    let h = Harness::new(FakeExecutor::with_outputs(outputs));
    h.executor.fail("net", 1);
    let cfg = dependent_steps();
    h.orchestrator(&cfg, &backend(false), true).run().await.unwrap();

    let retried: Vec<Vec<StepKey>> = h
        .observer
        .events()
        .into_iter()
        .filter_map(|e| match e {
            RolloutEvent::RetryPass { steps, .. } => Some(steps),
            _ => None,
        })
        .collect();
    assert_eq!(retried, [vec![StepKey::new("net", ""), StepKey::new("apps", "")]]);

    let names: Vec<String> = h.executor.calls().into_iter().map(|c| c.step).collect();
    assert_eq!(names, ["net", "net", "apps"]);
    let apps = h.executor.calls_for("apps");
    assert_eq!(apps[0].inputs["argocd"]["vpc_id"].as_str(), Some("vpc-123"));
    assert_eq!(h.applied("apps", "argocd").as_deref(), Some("v2.0.0"));
}

#[tokio::test]
async fn missing_parameter_without_steps_in_flight_is_fatal() {
    let h = Harness::new(FakeExecutor::default());
    let cfg = dependent_steps();
    let err = h
        .orchestrator(&cfg, &backend(false), false)
        .run()
        .await
        .unwrap_err();

    assert!(err.is_parameter_not_found());
    assert_eq!(h.applied("net", "vpc").as_deref(), Some("v2.0.0"));
    assert!(h.executor.calls_for("apps").is_empty());
}

#[tokio::test]
async fn failed_pipeline_is_retried_once() {
    let h = Harness::new(FakeExecutor::default());
    h.executor.fail("apps", 1);
    let cfg = config(TWO_STEPS);
    h.orchestrator(&cfg, &backend(false), true).run().await.unwrap();

    assert_eq!(h.executor.calls_for("apps").len(), 2);
    assert_eq!(h.applied("apps", "argocd").as_deref(), Some("v2.0.0"));
}

#[tokio::test]
async fn failed_retry_is_fatal_but_keeps_completed_state() {
    let h = Harness::new(FakeExecutor::default());
    h.executor.fail("apps", 2);
    let cfg = config(TWO_STEPS);
    let err = h
        .orchestrator(&cfg, &backend(false), true)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, RolloutError::Pipeline { .. }));
    assert_eq!(h.executor.calls_for("apps").len(), 2);
    assert_eq!(h.applied("net", "vpc").as_deref(), Some("v2.0.0"));
    assert_eq!(h.applied("apps", "argocd"), None);
}

#[tokio::test]
async fn sequential_failure_is_fatal_immediately() {
    let h = Harness::new(FakeExecutor::default());
    h.executor.fail("net", 1);
    let cfg = config(TWO_STEPS);
    let err = h
        .orchestrator(&cfg, &backend(false), false)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, RolloutError::Pipeline { .. }));
    assert_eq!(h.executor.calls().len(), 1);
    assert!(h.executor.calls_for("apps").is_empty());
}

#[tokio::test]
async fn reject_policy_stops_after_plan() {
    let h = Harness::new(FakeExecutor::default());
    let cfg = config(&TWO_STEPS.replacen("approve: never", "approve: reject", 1));
    let err = h
        .orchestrator(&cfg, &backend(false), true)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, RolloutError::PlanRejected { ref step } if step == "net"));
    assert_eq!(h.applied("net", "vpc"), None);
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stale_steps_are_removed_from_state() {
    let h = Harness::new(FakeExecutor::default());
    let mut state = State::default();
    state
        .get_or_create_step(&StepKey::new("gone", "dev"))
        .get_or_create_module("old");
    state.save(h.dir.path()).unwrap();

    let cfg = config(TWO_STEPS);
    h.orchestrator(&cfg, &backend(false), true).run().await.unwrap();

    let saved = h.saved_state();
    assert!(saved.step(&StepKey::new("gone", "dev")).is_none());
    assert_eq!(saved.steps.len(), 2);
    assert_eq!(saved.base_config_version.as_deref(), Some("stable"));
    let vpc = saved.module(&StepKey::new("net", ""), "vpc").unwrap();
    assert_eq!(vpc.source, URL);
    assert_eq!(vpc.module_type, "vpc");
    assert!(vpc.checksum.is_some());
}

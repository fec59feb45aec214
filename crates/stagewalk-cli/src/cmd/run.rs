use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Args;
use stagewalk_core::artifact::FileStepWriter;
use stagewalk_core::observer::TracingObserver;
use stagewalk_core::orchestrator::{Orchestrator, RolloutOptions, Services, StepStatus};
use stagewalk_core::params::FileParameterStore;
use stagewalk_core::paths;
use stagewalk_core::state::State;
use stagewalk_pipeline::{Approver, ScriptExecutor, StaticApprover, StdinApprover};
use std::path::Path;
use std::sync::Arc;

#[derive(Args)]
pub struct RunArgs {
    /// Run every step inline, never dispatching in parallel
    #[arg(long)]
    sequential: bool,

    /// Maximum number of steps applied concurrently
    #[arg(long)]
    max_parallel: Option<usize>,

    /// Resource name prefix (overrides `prefix` in stagewalk.yaml)
    #[arg(long, env = "STAGEWALK_PREFIX")]
    prefix: Option<String>,

    /// Cloud account id exposed to templates as `agent.accountId`
    #[arg(long, env = "STAGEWALK_ACCOUNT_ID")]
    account_id: Option<String>,

    /// Approve every manual gate
    #[arg(long, short = 'y', conflicts_with = "no_input")]
    yes: bool,

    /// Deny every manual gate instead of prompting
    #[arg(long)]
    no_input: bool,
}

pub fn run(root: &Path, args: RunArgs, json: bool) -> anyhow::Result<()> {
    let config = super::load_project(root)?;
    super::ensure_valid(&config)?;
    let state = State::load(root).context("failed to load state")?;
    let registry = super::load_registry(root, &config)?;

    let mut options = RolloutOptions::for_root(root, &config);
    if args.sequential {
        options.parallel = false;
    }
    if let Some(n) = args.max_parallel {
        options.max_parallel = n;
    }
    if let Some(prefix) = args.prefix {
        options.prefix = prefix;
    }
    options.account_id = args.account_id.unwrap_or_default();

    let approver: Arc<dyn Approver> = if args.yes {
        Arc::new(StaticApprover(true))
    } else if args.no_input {
        Arc::new(StaticApprover(false))
    } else {
        Arc::new(StdinApprover::new())
    };
    let services = Services {
        params: Arc::new(FileParameterStore::new(paths::parameters_path(root))),
        executor: Arc::new(ScriptExecutor::new(&config, &options, approver)),
        writer: Arc::new(FileStepWriter),
        observer: Arc::new(TracingObserver),
    };

    let mut orchestrator = Orchestrator::new(config, state, registry, services, options);
    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt
        .block_on(orchestrator.run())
        .context("rollout failed")?;

    if json {
        return print_json(&summary);
    }

    println!(
        "walked {} -> {} ({} release{})\n",
        summary.walk.oldest,
        summary.walk.newest,
        summary.walk.len,
        if summary.walk.len == 1 { "" } else { "s" }
    );
    let rows = summary
        .outcomes
        .iter()
        .map(|o| {
            let status = match &o.status {
                StepStatus::Applied(counts) => format!("applied ({counts})"),
                StepStatus::Skipped => "skipped".to_string(),
            };
            vec![o.release.to_string(), o.step.to_string(), status]
        })
        .collect();
    print_table(&["RELEASE", "STEP", "STATUS"], rows);
    Ok(())
}

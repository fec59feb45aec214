use crate::approval::ChangeCounts;
use crate::config::StepKey;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Where a step is within one release iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepPhase {
    Pending,
    FilesWritten,
    Skipped,
    Executing { parallel: bool },
    Applied(ChangeCounts),
    /// Queued for the retry pass.
    Deferred(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutEvent {
    WalkPlanned {
        oldest: String,
        newest: String,
        len: usize,
    },
    ReleaseStarted {
        index: usize,
        tags: Vec<String>,
    },
    Step {
        index: usize,
        step: StepKey,
        phase: StepPhase,
    },
    RetryPass {
        index: usize,
        steps: Vec<StepKey>,
    },
    StatePersisted {
        path: PathBuf,
    },
}

/// Receives every orchestration event. Passed to the orchestrator
/// explicitly.
pub trait RolloutObserver: Send + Sync {
    fn on_event(&self, event: &RolloutEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl RolloutObserver for TracingObserver {
    fn on_event(&self, event: &RolloutEvent) {
        match event {
            RolloutEvent::WalkPlanned { oldest, newest, len } => {
                info!(%oldest, %newest, releases = len, "walk planned")
            }
            RolloutEvent::ReleaseStarted { index, tags } => {
                info!(index, tags = %tags.join(","), "release started")
            }
            RolloutEvent::Step { index, step, phase } => match phase {
                StepPhase::Applied(counts) => {
                    info!(index, step = %step, %counts, "step applied")
                }
                StepPhase::Skipped => info!(index, step = %step, "step unchanged, skipped"),
                StepPhase::Executing { parallel } => {
                    info!(index, step = %step, parallel, "step executing")
                }
                StepPhase::Deferred(reason) => {
                    warn!(index, step = %step, %reason, "step deferred to retry pass")
                }
                StepPhase::Failed(reason) => warn!(index, step = %step, %reason, "step failed"),
                other => debug!(index, step = %step, phase = ?other, "step"),
            },
            RolloutEvent::RetryPass { index, steps } => {
                let steps: Vec<String> = steps.iter().map(ToString::to_string).collect();
                warn!(index, steps = %steps.join(","), "retrying steps sequentially")
            }
            RolloutEvent::StatePersisted { path } => {
                debug!(path = %path.display(), "state persisted")
            }
        }
    }
}

/// Records events for inspection in tests.
#[derive(Debug, Default)]
pub struct CapturingObserver {
    events: Mutex<Vec<RolloutEvent>>,
}

impl CapturingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RolloutEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Phases of `step` at release `index`, in order.
    pub fn phases(&self, index: usize, step: &StepKey) -> Vec<StepPhase> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RolloutEvent::Step {
                    index: i,
                    step: s,
                    phase,
                } if i == index && s == *step => Some(phase),
                _ => None,
            })
            .collect()
    }
}

impl RolloutObserver for CapturingObserver {
    fn on_event(&self, event: &RolloutEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

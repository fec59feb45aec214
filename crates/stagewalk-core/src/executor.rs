use crate::approval::{Approval, ChangeCounts};
use crate::artifact::ResolvedStep;
use crate::config::StepKey;
use crate::error::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Identifies one plan/apply cycle started by [`PipelineExecutor::create_or_update`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionHandle {
    pub id: Uuid,
    pub step: StepKey,
}

impl ExecutionHandle {
    pub fn new(step: StepKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            step,
        }
    }
}

/// Runs a step's plan/apply cycle on some backend.
///
/// `wait_for_completion` blocks until the execution is terminal and returns
/// the plan's change counts. The executor enforces the approval gate:
/// [`Approval::requires_gate`] decides when a human must confirm, and
/// [`Approval::Reject`] stops after the plan with
/// [`RolloutError::PlanRejected`](crate::error::RolloutError::PlanRejected).
#[async_trait]
pub trait PipelineExecutor: Send + Sync {
    async fn create_or_update(&self, step: &ResolvedStep) -> Result<ExecutionHandle>;

    async fn wait_for_completion(
        &self,
        handle: &ExecutionHandle,
        approval: Approval,
    ) -> Result<ChangeCounts>;

    /// Output JSON of the step's last apply, if the backend captures it.
    async fn outputs(&self, _step: &StepKey) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }
}

use crate::config::ApprovalPolicy;
use serde::{Deserialize, Serialize};

/// Auto-approve decision for moving a module from `applied` to `release`.
///
/// `never` and `always` ignore the versions. `force` and `reject` are
/// enforced by the executor and report `true`/`false` here.
pub fn auto_approve(policy: ApprovalPolicy, applied: &semver::Version, release: &semver::Version) -> bool {
    match policy {
        ApprovalPolicy::Never => true,
        ApprovalPolicy::Always => false,
        ApprovalPolicy::Major => applied.major >= release.major,
        ApprovalPolicy::Minor => applied.major == release.major && applied.minor >= release.minor,
        ApprovalPolicy::Force => true,
        ApprovalPolicy::Reject => false,
    }
}

/// Plan/apply change counts reported by a pipeline execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub added: u32,
    pub changed: u32,
    pub destroyed: u32,
}

impl ChangeCounts {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.changed == 0 && self.destroyed == 0
    }
}

impl std::fmt::Display for ChangeCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to add, {} to change, {} to destroy",
            self.added, self.changed, self.destroyed
        )
    }
}

/// How the executor treats a step's plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Approval {
    /// Apply unless the plan destroys resources.
    Auto,
    /// Gate any plan that changes or destroys resources.
    Manual,
    /// Never gate, even destructive plans.
    Force,
    /// Stop after the plan.
    Reject,
}

impl Approval {
    /// Combine a step policy with the per-module auto-approve flags.
    pub fn for_policy(policy: ApprovalPolicy, auto: bool) -> Self {
        match policy {
            ApprovalPolicy::Force => Approval::Force,
            ApprovalPolicy::Reject => Approval::Reject,
            _ if auto => Approval::Auto,
            _ => Approval::Manual,
        }
    }

    pub fn requires_gate(&self, counts: &ChangeCounts) -> bool {
        match self {
            Approval::Force | Approval::Reject => false,
            Approval::Auto => counts.destroyed > 0,
            Approval::Manual => counts.changed > 0 || counts.destroyed > 0,
        }
    }
}

impl std::fmt::Display for Approval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Approval::Auto => "auto",
            Approval::Manual => "manual",
            Approval::Force => "force",
            Approval::Reject => "reject",
        };
        f.write_str(s)
    }
}

//! `stagewalk-pipeline` runs a step's plan/apply cycle as local shell
//! commands.
//!
//! ```text
//! ResolvedStep ── create_or_update ──▶ Job (dir, commands, env)
//!                                       │
//!               wait_for_completion ────┤ plan   ─▶ ChangeCounts
//!                                       │ gate   ─▶ Approver
//!                                       │ apply
//!                       outputs ────────┘ output ─▶ JSON
//! ```
//!
//! Commands come from the config's `pipeline` section, per step type, and
//! run through `sh -c` inside the step's artifact directory.

pub mod approver;
pub mod error;
pub mod executor;
pub mod plan;
pub mod process;

pub use approver::{Approver, StaticApprover, StdinApprover};
pub use error::PipelineError;
pub use executor::ScriptExecutor;
pub use plan::parse_plan;

pub type Result<T> = std::result::Result<T, PipelineError>;

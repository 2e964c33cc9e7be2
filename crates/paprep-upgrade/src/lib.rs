//! paprep Upgrade - Drives a device through its upgrade path
//!
//! A single hop downloads, installs, reboots into, and verifies one version.
//! The orchestrator resolves the full path once and applies hops strictly in
//! order, stopping at the first failure.

pub mod commands;
pub mod executor;
pub mod orchestrator;
pub mod progress;

#[cfg(test)]
pub(crate) mod testing;

pub use commands::{CommandSet, JobStatus, RequestOutcome, ResponseError};
pub use executor::{ExecutorTimings, Hop, StepExecutor, StepFailure, StepResult};
pub use orchestrator::{
    HopOutcome, HopStatus, OrchestrationResult, Orchestrator, RunError, RunPhase, RunReport,
    UpgradeRunState,
};
pub use progress::{Phase, ProgressEvent, ProgressSink};

//! Multi-hop upgrade orchestration
//!
//! The path is resolved once, up front, before the device is touched. Hops
//! then run strictly in order; the first failure ends the run and leaves the
//! device on the last version it verified. There is no automatic retry.

use chrono::{DateTime, Utc};
use paprep_core::{resolve, Ladder, PathError, UpgradePath, Version};
use paprep_ssh::{DeviceSession, Transport};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::commands::CommandSet;
use crate::executor::{ExecutorTimings, Hop, StepExecutor, StepFailure, StepResult};
use crate::progress::{Phase, ProgressEvent, ProgressSink};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("Could not determine the running version: {0}")]
    RunningVersion(StepFailure),
}

/// Overall state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Planning,
    Upgrading,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HopStatus {
    Upgraded,
    AlreadyAtVersion,
    Failed,
}

/// Audit record for one hop
#[derive(Debug, Clone, Serialize)]
pub struct HopOutcome {
    pub index: usize,
    pub version: Version,
    pub status: HopStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Working state of an orchestration run
#[derive(Debug, Clone, Serialize)]
pub struct UpgradeRunState {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub starting_version: Version,
    pub target: Version,
    pub path: UpgradePath,
    /// Index of the hop in progress, or of the last hop attempted
    pub current_hop: usize,
    pub phase: RunPhase,
    pub hops: Vec<HopOutcome>,
}

impl UpgradeRunState {
    fn new(starting_version: Version, target: Version, path: UpgradePath) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            starting_version,
            target,
            path,
            current_hop: 0,
            phase: RunPhase::Planning,
            hops: Vec::new(),
        }
    }

    fn finish(&mut self, phase: RunPhase) {
        self.phase = phase;
        self.finished_at = Some(Utc::now());
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationResult {
    Completed,
    AbortedAt {
        hop_index: usize,
        version: Version,
        reason: StepFailure,
    },
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub result: OrchestrationResult,
    pub state: UpgradeRunState,
}

impl RunReport {
    pub fn is_completed(&self) -> bool {
        self.result == OrchestrationResult::Completed
    }
}

/// Runs every hop of an upgrade path against one session
pub struct Orchestrator<'a> {
    ladder: &'a Ladder,
    executor: StepExecutor<'a>,
    progress: &'a dyn ProgressSink,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        ladder: &'a Ladder,
        commands: &'a CommandSet,
        timings: ExecutorTimings,
        progress: &'a dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ladder,
            executor: StepExecutor::new(ladder, commands, timings, progress, cancel),
            progress,
        }
    }

    /// Upgrade from the version the device reports right now
    ///
    /// Safe to re-run after an aborted run: hops the device has already
    /// passed are no longer part of the resolved path.
    pub async fn run_from_device<T: Transport>(
        &self,
        session: &mut DeviceSession<T>,
        target: &Version,
    ) -> Result<RunReport, RunError> {
        let current = self
            .executor
            .running_version(session)
            .await
            .map_err(RunError::RunningVersion)?;
        info!(current = %current, target = %target, "Read running version");
        Ok(self.run(session, &current, target).await?)
    }

    /// Upgrade from `current` to `target`
    ///
    /// Path errors are returned before any command is sent.
    pub async fn run<T: Transport>(
        &self,
        session: &mut DeviceSession<T>,
        current: &Version,
        target: &Version,
    ) -> Result<RunReport, PathError> {
        let path = resolve(current, target, self.ladder)?;
        let total = path.len();
        let mut state = UpgradeRunState::new(*current, *target, path.clone());

        info!(run_id = %state.run_id, path = %path, hops = total, "Upgrade path resolved");
        self.emit(Phase::Planning, 0, total, format!("Upgrade path: {}", path));

        state.phase = RunPhase::Upgrading;
        for (index, version) in path.iter().enumerate() {
            state.current_hop = index;
            let hop = Hop { index, total };
            info!(hop = index + 1, total, version = %version, "Applying hop");

            let started_at = Utc::now();
            let result = self.executor.apply_step(session, version, hop).await;
            let finished_at = Utc::now();

            let (status, detail) = match &result {
                StepResult::Success => (HopStatus::Upgraded, None),
                StepResult::AlreadyAtVersion => (HopStatus::AlreadyAtVersion, None),
                StepResult::Failure(reason) => (HopStatus::Failed, Some(reason.to_string())),
            };
            state.hops.push(HopOutcome {
                index,
                version: *version,
                status,
                detail,
                started_at,
                finished_at,
            });

            if let StepResult::Failure(reason) = result {
                error!(run_id = %state.run_id, hop = index + 1, version = %version, error = %reason, "Upgrade aborted");
                self.emit(
                    Phase::Aborted,
                    index,
                    total,
                    format!("Aborted at {}: {}", version, reason),
                );
                state.finish(RunPhase::Aborted);
                return Ok(RunReport {
                    result: OrchestrationResult::AbortedAt {
                        hop_index: index,
                        version: *version,
                        reason,
                    },
                    state,
                });
            }
        }

        state.finish(RunPhase::Completed);
        info!(run_id = %state.run_id, target = %target, "Upgrade complete");
        self.emit(
            Phase::Completed,
            total.saturating_sub(1),
            total,
            format!("Device runs {}", target),
        );

        Ok(RunReport {
            result: OrchestrationResult::Completed,
            state,
        })
    }

    fn emit(&self, phase: Phase, hop_index: usize, total_hops: usize, message: String) {
        self.progress.emit(ProgressEvent {
            phase,
            hop_index,
            total_hops,
            message,
        });
    }
}

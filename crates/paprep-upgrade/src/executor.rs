//! Single-hop upgrade execution
//!
//! One hop takes the device from its running version to one target version:
//!
//! 1. Query the running version (returns early if already at the target)
//! 2. Ensure the base image is in place
//! 3. Download the target image
//! 4. Install it
//! 5. Reboot
//! 6. Wait for the device to come back
//! 7. Verify it runs the target
//!
//! Cancellation is honored between commands and during every wait, never in
//! the middle of a command.

use paprep_core::{Ladder, Version};
use paprep_ssh::{DeviceSession, ReachabilityPolicy, SessionError, Transport};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commands::{self, CommandSet, JobStatus, RequestOutcome};
use crate::progress::{Phase, ProgressEvent, ProgressSink};

/// Why a hop did not reach its target
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepFailure {
    #[error("Download of {version} failed: {reason}")]
    DownloadFailed { version: Version, reason: String },
    #[error("Install of {version} failed: {reason}")]
    InstallFailed { version: Version, reason: String },
    #[error("Device did not come back within {}s of the reboot", .waited.as_secs())]
    RebootTimeout { waited: Duration },
    #[error("Expected {expected} after reboot but the device runs {actual}")]
    VersionMismatch { expected: Version, actual: Version },
    #[error("Device runs {running}, which is already beyond {target}")]
    AlreadyBeyond { running: Version, target: Version },
    #[error("Unexpected response to `{command}`: {detail}")]
    UnexpectedResponse { command: String, detail: String },
    #[error("{0}")]
    Session(SessionError),
    #[error("Upgrade cancelled")]
    Cancelled,
}

impl From<SessionError> for StepFailure {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Cancelled => StepFailure::Cancelled,
            other => StepFailure::Session(other),
        }
    }
}

/// Outcome of one hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Success,
    /// The device already ran the target; nothing was changed
    AlreadyAtVersion,
    Failure(StepFailure),
}

/// Position of a hop within its path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Hop {
    pub index: usize,
    pub total: usize,
}

impl Hop {
    pub fn single() -> Self {
        Self { index: 0, total: 1 }
    }
}

/// Waits and retry budgets for a hop
#[derive(Debug, Clone, Copy)]
pub struct ExecutorTimings {
    pub download_timeout: Duration,
    pub install_timeout: Duration,
    pub job_poll_interval: Duration,
    /// Pause after issuing the reboot before probing starts
    pub reboot_settle: Duration,
    /// Total budget from reboot to reachable, settle included
    pub reboot_timeout: Duration,
    pub reachability_poll: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for ExecutorTimings {
    fn default() -> Self {
        Self {
            download_timeout: Duration::from_secs(1800),
            install_timeout: Duration::from_secs(1200),
            job_poll_interval: Duration::from_secs(30),
            reboot_settle: Duration::from_secs(60),
            reboot_timeout: Duration::from_secs(600),
            reachability_poll: Duration::from_secs(30),
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(10),
        }
    }
}

/// Which kind of background job is being waited on
#[derive(Debug, Clone, Copy)]
enum JobKind {
    Download,
    Install,
}

impl JobKind {
    fn phase(self) -> Phase {
        match self {
            JobKind::Download => Phase::Download,
            JobKind::Install => Phase::Install,
        }
    }

    fn failure(self, version: Version, reason: String) -> StepFailure {
        match self {
            JobKind::Download => StepFailure::DownloadFailed { version, reason },
            JobKind::Install => StepFailure::InstallFailed { version, reason },
        }
    }
}

/// Applies one hop to a connected session
pub struct StepExecutor<'a> {
    ladder: &'a Ladder,
    commands: &'a CommandSet,
    timings: ExecutorTimings,
    progress: &'a dyn ProgressSink,
    cancel: CancellationToken,
}

impl<'a> StepExecutor<'a> {
    pub fn new(
        ladder: &'a Ladder,
        commands: &'a CommandSet,
        timings: ExecutorTimings,
        progress: &'a dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ladder,
            commands,
            timings,
            progress,
            cancel,
        }
    }

    /// Bring the device to `target`
    pub async fn apply_step<T: Transport>(
        &self,
        session: &mut DeviceSession<T>,
        target: &Version,
        hop: Hop,
    ) -> StepResult {
        match self.try_step(session, target, hop).await {
            Ok(result) => result,
            Err(failure) => {
                warn!(target = %target, hop = hop.index, error = %failure, "Hop failed");
                StepResult::Failure(failure)
            }
        }
    }

    async fn try_step<T: Transport>(
        &self,
        session: &mut DeviceSession<T>,
        target: &Version,
        hop: Hop,
    ) -> Result<StepResult, StepFailure> {
        self.check_cancelled()?;
        self.emit(Phase::QueryVersion, hop, format!("Checking running version before {}", target));

        let running = self.running_version(session).await?;
        if running == *target {
            info!(version = %running, "Device already runs hop target");
            self.emit(Phase::HopComplete, hop, format!("Already at {}", target));
            return Ok(StepResult::AlreadyAtVersion);
        }
        if running > *target {
            return Err(StepFailure::AlreadyBeyond {
                running,
                target: *target,
            });
        }

        info!(from = %running, to = %target, hop = hop.index + 1, total = hop.total, "Starting hop");
        self.ensure_base_image(session, &running, target, hop).await?;
        self.upgrade_to(session, target, hop).await?;

        self.emit(Phase::HopComplete, hop, format!("Now running {}", target));
        Ok(StepResult::Success)
    }

    /// Query `show system info` for the running version
    pub async fn running_version<T: Transport>(
        &self,
        session: &mut DeviceSession<T>,
    ) -> Result<Version, StepFailure> {
        let command = &self.commands.show_system_info;
        let output = session.run_command(command).await?;
        commands::parse_sw_version(&output).map_err(|e| StepFailure::UnexpectedResponse {
            command: command.clone(),
            detail: e.to_string(),
        })
    }

    /// A maintenance release installs only on top of its family's base image
    ///
    /// When the family's minimum build is later than `X.Y.0`, that build is
    /// installed first as a nested hop. Otherwise the base image only has to
    /// be downloaded.
    async fn ensure_base_image<T: Transport>(
        &self,
        session: &mut DeviceSession<T>,
        running: &Version,
        target: &Version,
        hop: Hop,
    ) -> Result<(), StepFailure> {
        let family = target.family();
        let base = self.ladder.base_of(family);
        let has_override = self
            .ladder
            .checkpoint(family)
            .is_some_and(|c| c.has_base_override());

        if has_override && *running < base && base < *target {
            self.emit(
                Phase::EnsureBaseImage,
                hop,
                format!("Installing base {} before {}", base, target),
            );
            return self.upgrade_to(session, &base, hop).await;
        }

        if *target == base || running.family() == family {
            return Ok(());
        }

        self.emit(Phase::EnsureBaseImage, hop, format!("Checking base image {}", base));
        let listing = session.run_command(&self.commands.software_info).await?;
        if commands::is_downloaded(&listing, &base) {
            debug!(base = %base, "Base image already downloaded");
            return Ok(());
        }
        self.download(session, &base, hop).await
    }

    /// Download, install, reboot into and verify one version
    async fn upgrade_to<T: Transport>(
        &self,
        session: &mut DeviceSession<T>,
        version: &Version,
        hop: Hop,
    ) -> Result<(), StepFailure> {
        self.download(session, version, hop).await?;
        self.install(session, version, hop).await?;
        self.reboot(session, hop).await?;
        self.await_recovery(session, hop).await?;
        self.verify(session, version, hop).await
    }

    async fn download<T: Transport>(
        &self,
        session: &mut DeviceSession<T>,
        version: &Version,
        hop: Hop,
    ) -> Result<(), StepFailure> {
        self.check_cancelled()?;
        self.emit(Phase::Download, hop, format!("Downloading {}", version));

        // Refresh the catalog so the device knows about the image
        let check = session.run_command(&self.commands.software_check).await?;
        if let Some(reason) = commands::error_text(&check) {
            return Err(StepFailure::DownloadFailed {
                version: *version,
                reason,
            });
        }

        let output = session.run_command(&self.commands.download(version)).await?;
        self.follow_request(session, &output, JobKind::Download, version, hop)
            .await
    }

    async fn install<T: Transport>(
        &self,
        session: &mut DeviceSession<T>,
        version: &Version,
        hop: Hop,
    ) -> Result<(), StepFailure> {
        self.check_cancelled()?;
        self.emit(Phase::Install, hop, format!("Installing {}", version));

        let output = session.run_command(&self.commands.install(version)).await?;
        self.follow_request(session, &output, JobKind::Install, version, hop)
            .await
    }

    async fn follow_request<T: Transport>(
        &self,
        session: &mut DeviceSession<T>,
        output: &str,
        kind: JobKind,
        version: &Version,
        hop: Hop,
    ) -> Result<(), StepFailure> {
        match commands::classify_request(output) {
            RequestOutcome::Enqueued(job) => {
                info!(job, version = %version, ?kind, "Job enqueued");
                self.wait_for_job(session, job, kind, version, hop).await
            }
            RequestOutcome::AlreadyDone => {
                info!(version = %version, ?kind, "Nothing to do");
                Ok(())
            }
            RequestOutcome::Completed => Ok(()),
            RequestOutcome::Rejected(reason) => Err(kind.failure(*version, reason)),
        }
    }

    async fn wait_for_job<T: Transport>(
        &self,
        session: &mut DeviceSession<T>,
        job: u64,
        kind: JobKind,
        version: &Version,
        hop: Hop,
    ) -> Result<(), StepFailure> {
        let limit = match kind {
            JobKind::Download => self.timings.download_timeout,
            JobKind::Install => self.timings.install_timeout,
        };
        let deadline = Instant::now() + limit;
        let command = self.commands.job(job);
        let mut last_progress = None;

        loop {
            let output = session.run_command(&command).await?;
            match commands::parse_job_status(&output, job) {
                Some(JobStatus::Succeeded) => {
                    info!(job, version = %version, ?kind, "Job finished");
                    return Ok(());
                }
                Some(JobStatus::Failed { detail }) => {
                    return Err(kind.failure(*version, format!("job {} failed: {}", job, detail)));
                }
                Some(JobStatus::Running { progress }) => {
                    if let Some(percent) = progress.filter(|p| last_progress != Some(*p)) {
                        last_progress = Some(percent);
                        self.emit(kind.phase(), hop, format!("{} {}%", version, percent));
                    }
                }
                None => {
                    return Err(kind.failure(
                        *version,
                        format!("no status for job {}: {}", job, output.trim()),
                    ));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(kind.failure(
                    *version,
                    format!("job {} did not finish within {}s", job, limit.as_secs()),
                ));
            }
            self.pause(self.timings.job_poll_interval.min(deadline - now))
                .await?;
        }
    }

    async fn reboot<T: Transport>(
        &self,
        session: &mut DeviceSession<T>,
        hop: Hop,
    ) -> Result<(), StepFailure> {
        self.check_cancelled()?;
        self.emit(Phase::Reboot, hop, "Rebooting");

        session.send_line(&self.commands.restart).await?;
        if let Err(e) = session.send_line(&self.commands.restart_confirm).await {
            // The device may drop the link as soon as the restart is accepted
            debug!(error = %e, "Restart confirmation not sent");
        }
        session.mark_unreachable().await;
        Ok(())
    }

    async fn await_recovery<T: Transport>(
        &self,
        session: &mut DeviceSession<T>,
        hop: Hop,
    ) -> Result<(), StepFailure> {
        let settle = self.timings.reboot_settle.min(self.timings.reboot_timeout);
        self.emit(
            Phase::AwaitRecovery,
            hop,
            format!("Waiting up to {}s for the device to return", self.timings.reboot_timeout.as_secs()),
        );
        self.pause(settle).await?;

        let policy = ReachabilityPolicy {
            poll_interval: self.timings.reachability_poll,
            max_wait: self.timings.reboot_timeout - settle,
        };
        match session.wait_until_reachable(policy, &self.cancel).await {
            Ok(()) => Ok(()),
            Err(SessionError::UnreachableTimeout { .. }) => Err(StepFailure::RebootTimeout {
                waited: self.timings.reboot_timeout,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn verify<T: Transport>(
        &self,
        session: &mut DeviceSession<T>,
        version: &Version,
        hop: Hop,
    ) -> Result<(), StepFailure> {
        self.emit(Phase::Verify, hop, format!("Verifying {}", version));

        if !session.is_connected() {
            session
                .reconnect(
                    self.timings.reconnect_attempts,
                    self.timings.reconnect_delay,
                    &self.cancel,
                )
                .await?;
        }

        let actual = self.running_version(session).await?;
        if actual != *version {
            return Err(StepFailure::VersionMismatch {
                expected: *version,
                actual,
            });
        }
        info!(version = %actual, "Version verified");
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), StepFailure> {
        if self.cancel.is_cancelled() {
            return Err(StepFailure::Cancelled);
        }
        Ok(())
    }

    async fn pause(&self, duration: Duration) -> Result<(), StepFailure> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(StepFailure::Cancelled),
            _ = sleep(duration) => Ok(()),
        }
    }

    fn emit(&self, phase: Phase, hop: Hop, message: impl Into<String>) {
        self.progress.emit(ProgressEvent {
            phase,
            hop_index: hop.index,
            total_hops: hop.total,
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_session, FakeDevice};
    use std::sync::Mutex;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn executor<'a>(
        commands: &'a CommandSet,
        progress: &'a dyn ProgressSink,
        cancel: CancellationToken,
    ) -> StepExecutor<'a> {
        StepExecutor::new(
            Ladder::builtin(),
            commands,
            ExecutorTimings::default(),
            progress,
            cancel,
        )
    }

    fn ignore(_: ProgressEvent) {}

    #[tokio::test(start_paused = true)]
    async fn test_already_at_version_sends_no_upgrade_commands() {
        let device = FakeDevice::running(v("10.1.3"));
        let mut session = fake_session(&device).await;
        let commands = CommandSet::default();
        let exec = executor(&commands, &ignore, CancellationToken::new());

        let result = exec.apply_step(&mut session, &v("10.1.3"), Hop::single()).await;

        assert_eq!(result, StepResult::AlreadyAtVersion);
        assert_eq!(device.commands(), vec!["show system info"]);
        assert!(session.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_beyond_target_fails() {
        let device = FakeDevice::running(v("11.0.0"));
        let mut session = fake_session(&device).await;
        let commands = CommandSet::default();
        let exec = executor(&commands, &ignore, CancellationToken::new());

        let result = exec.apply_step(&mut session, &v("10.2.0"), Hop::single()).await;
        assert!(matches!(
            result,
            StepResult::Failure(StepFailure::AlreadyBeyond { .. })
        ));
        assert!(!device.rebooted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_hop() {
        let device = FakeDevice::running(v("10.0.0"));
        let mut session = fake_session(&device).await;
        let commands = CommandSet::default();
        let events = Mutex::new(Vec::new());
        let sink = |e: ProgressEvent| events.lock().unwrap().push(e.phase);
        let exec = executor(&commands, &sink, CancellationToken::new());

        let result = exec.apply_step(&mut session, &v("10.1.0"), Hop::single()).await;

        assert_eq!(result, StepResult::Success);
        assert_eq!(device.running_version(), v("10.1.0"));
        assert!(session.is_connected());

        let phases = events.lock().unwrap().clone();
        let order = [
            Phase::QueryVersion,
            Phase::Download,
            Phase::Install,
            Phase::Reboot,
            Phase::AwaitRecovery,
            Phase::Verify,
            Phase::HopComplete,
        ];
        let positions: Vec<usize> = order
            .iter()
            .map(|p| phases.iter().position(|q| q == p).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_release_downloads_base_first() {
        let device = FakeDevice::running(v("10.2.0"));
        let mut session = fake_session(&device).await;
        let commands = CommandSet::default();
        let exec = executor(&commands, &ignore, CancellationToken::new());

        let result = exec.apply_step(&mut session, &v("11.0.2"), Hop::single()).await;
        assert_eq!(result, StepResult::Success);

        let log = device.commands();
        let base_download = log
            .iter()
            .position(|c| c == "request system software download version 11.0.0")
            .unwrap();
        let target_download = log
            .iter()
            .position(|c| c == "request system software download version 11.0.2")
            .unwrap();
        assert!(base_download < target_download);
        assert!(!log.iter().any(|c| c.contains("install version 11.0.0")));
        assert_eq!(device.running_version(), v("11.0.2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_base_already_downloaded_is_not_fetched_again() {
        let device = FakeDevice::running(v("10.2.0"));
        device.mark_downloaded(v("11.0.0"));
        let mut session = fake_session(&device).await;
        let commands = CommandSet::default();
        let exec = executor(&commands, &ignore, CancellationToken::new());

        let result = exec.apply_step(&mut session, &v("11.0.2"), Hop::single()).await;
        assert_eq!(result, StepResult::Success);
        assert!(!device
            .commands()
            .iter()
            .any(|c| c == "request system software download version 11.0.0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_base_override_installed_as_nested_hop() {
        let device = FakeDevice::running(v("11.2.4"));
        let mut session = fake_session(&device).await;
        let commands = CommandSet::default();
        let exec = executor(&commands, &ignore, CancellationToken::new());

        let result = exec.apply_step(&mut session, &v("12.1.4"), Hop::single()).await;
        assert_eq!(result, StepResult::Success);

        let log = device.commands();
        let base_install = log
            .iter()
            .position(|c| c == "request system software install version 12.1.2")
            .unwrap();
        let target_download = log
            .iter()
            .position(|c| c == "request system software download version 12.1.4")
            .unwrap();
        assert!(base_install < target_download);
        assert_eq!(device.reboot_count(), 2);
        assert_eq!(device.running_version(), v("12.1.4"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_error_during_install_never_reboots() {
        let device = FakeDevice::running(v("10.0.0"));
        device.break_link_on_install(v("10.1.0"));
        let mut session = fake_session(&device).await;
        let commands = CommandSet::default();
        let exec = executor(&commands, &ignore, CancellationToken::new());

        let result = exec.apply_step(&mut session, &v("10.1.0"), Hop::single()).await;

        assert!(matches!(
            result,
            StepResult::Failure(StepFailure::Session(SessionError::Command { .. }))
        ));
        assert!(!device.rebooted());
        assert!(!device.commands().iter().any(|c| c == "request restart system"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_download_job() {
        let device = FakeDevice::running(v("10.0.0"));
        device.fail_job_for(v("10.1.0"));
        let mut session = fake_session(&device).await;
        let commands = CommandSet::default();
        let exec = executor(&commands, &ignore, CancellationToken::new());

        let result = exec.apply_step(&mut session, &v("10.1.0"), Hop::single()).await;
        assert!(matches!(
            result,
            StepResult::Failure(StepFailure::DownloadFailed { .. })
        ));
        assert!(!device
            .commands()
            .iter()
            .any(|c| c.starts_with("request system software install")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reboot_timeout() {
        let device = FakeDevice::running(v("10.0.0"));
        device.stay_down_after_reboot();
        let mut session = fake_session(&device).await;
        let commands = CommandSet::default();
        let exec = executor(&commands, &ignore, CancellationToken::new());

        let start = Instant::now();
        let result = exec.apply_step(&mut session, &v("10.1.0"), Hop::single()).await;

        assert!(matches!(
            result,
            StepResult::Failure(StepFailure::RebootTimeout { .. })
        ));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(600));
        assert!(waited < Duration::from_secs(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_mismatch_after_reboot() {
        let device = FakeDevice::running(v("10.0.0"));
        device.boot_into(v("10.0.0"));
        let mut session = fake_session(&device).await;
        let commands = CommandSet::default();
        let exec = executor(&commands, &ignore, CancellationToken::new());

        let result = exec.apply_step(&mut session, &v("10.1.0"), Hop::single()).await;
        assert_eq!(
            result,
            StepResult::Failure(StepFailure::VersionMismatch {
                expected: v("10.1.0"),
                actual: v("10.0.0"),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start() {
        let device = FakeDevice::running(v("10.0.0"));
        let mut session = fake_session(&device).await;
        let commands = CommandSet::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let exec = executor(&commands, &ignore, cancel);

        let result = exec.apply_step(&mut session, &v("10.1.0"), Hop::single()).await;
        assert_eq!(result, StepResult::Failure(StepFailure::Cancelled));
        assert!(device.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_during_recovery_wait() {
        let device = FakeDevice::running(v("10.0.0"));
        device.stay_down_after_reboot();
        let mut session = fake_session(&device).await;
        let commands = CommandSet::default();
        let cancel = CancellationToken::new();
        let exec = executor(&commands, &ignore, cancel.clone());

        let watcher = device.clone();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            while !watcher.rebooted() {
                sleep(Duration::from_secs(1)).await;
            }
            sleep(Duration::from_secs(120)).await;
            trigger.cancel();
        });

        let result = exec.apply_step(&mut session, &v("10.1.0"), Hop::single()).await;
        assert_eq!(result, StepResult::Failure(StepFailure::Cancelled));
    }
}

//! In-process appliance simulator for executor and orchestrator tests

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use paprep_core::Version;
use paprep_ssh::{Credentials, DeviceSession, Endpoint, SessionTimeouts, Transport};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Polls a job reports as running before it finishes
const JOB_POLLS: u32 = 1;

/// Failed connection probes while a rebooting device is down
const BOOT_PROBES: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    Download,
    Install,
}

#[derive(Debug)]
struct Job {
    kind: JobKind,
    version: Version,
    polls_left: u32,
    fail: bool,
}

#[derive(Debug)]
struct Appliance {
    running: Version,
    downloaded: BTreeSet<Version>,
    pending: Option<Version>,
    jobs: HashMap<u64, Job>,
    next_job: u64,
    connected: bool,
    down_probes: u32,
    reboots: u32,
    log: Vec<String>,
    failing_jobs: BTreeSet<Version>,
    break_on_install: Option<Version>,
    boot_into: Option<Version>,
    stay_down: bool,
}

/// A simulated PA-VM reachable through the `Transport` trait
#[derive(Clone)]
pub struct FakeDevice {
    state: Arc<Mutex<Appliance>>,
}

impl FakeDevice {
    pub fn running(version: Version) -> Self {
        let mut downloaded = BTreeSet::new();
        downloaded.insert(version);
        Self {
            state: Arc::new(Mutex::new(Appliance {
                running: version,
                downloaded,
                pending: None,
                jobs: HashMap::new(),
                next_job: 1,
                connected: false,
                down_probes: 0,
                reboots: 0,
                log: Vec::new(),
                failing_jobs: BTreeSet::new(),
                break_on_install: None,
                boot_into: None,
                stay_down: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Appliance> {
        self.state.lock().unwrap()
    }

    /// Every command and line received, in order
    pub fn commands(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    pub fn running_version(&self) -> Version {
        self.lock().running
    }

    pub fn rebooted(&self) -> bool {
        self.lock().reboots > 0
    }

    pub fn reboot_count(&self) -> u32 {
        self.lock().reboots
    }

    pub fn mark_downloaded(&self, version: Version) {
        self.lock().downloaded.insert(version);
    }

    /// Jobs for `version` finish with a failed result
    pub fn fail_job_for(&self, version: Version) {
        self.lock().failing_jobs.insert(version);
    }

    /// The link drops when installing `version` is requested
    pub fn break_link_on_install(&self, version: Version) {
        self.lock().break_on_install = Some(version);
    }

    /// Boot into `version` regardless of what was installed
    pub fn boot_into(&self, version: Version) {
        self.lock().boot_into = Some(version);
    }

    pub fn stay_down_after_reboot(&self) {
        self.lock().stay_down = true;
    }

    fn enqueue(state: &mut Appliance, kind: JobKind, version: Version) -> u64 {
        let id = state.next_job;
        state.next_job += 1;
        let fail = state.failing_jobs.contains(&version);
        state.jobs.insert(
            id,
            Job {
                kind,
                version,
                polls_left: JOB_POLLS,
                fail,
            },
        );
        id
    }

    fn respond(state: &mut Appliance, command: &str) -> Result<String> {
        if command == "show system info" {
            return Ok(format!(
                "hostname: PA-VM\nmodel: PA-VM\nsw-version: {}\napp-version: 8799-8509\n",
                state.running
            ));
        }
        if command == "request system software check" {
            return Ok("Version   Filename   Size   Released   Downloaded   Currently Installed\n".to_string());
        }
        if command == "request system software info" {
            let mut table = String::from(
                "Version   Filename   Size   Released   Downloaded   Currently Installed\n\
                 ---------------------------------------------------------------------\n",
            );
            for version in &state.downloaded {
                let current = if *version == state.running { "yes" } else { "no" };
                table.push_str(&format!(
                    "{v}   PanOS_vm-{v}   450MB   2024/01/01   yes   {current}\n",
                    v = version
                ));
            }
            return Ok(table);
        }
        if let Some(raw) = command.strip_prefix("request system software download version ") {
            let version = Version::parse(raw)?;
            if state.downloaded.contains(&version) {
                return Ok(format!("PanOS_vm-{} is already downloaded", version));
            }
            let id = Self::enqueue(state, JobKind::Download, version);
            return Ok(format!("Download job enqueued with jobid {}", id));
        }
        if let Some(raw) = command.strip_prefix("request system software install version ") {
            let version = Version::parse(raw)?;
            if state.break_on_install == Some(version) {
                state.connected = false;
                return Err(anyhow!("Channel closed by device"));
            }
            if !state.downloaded.contains(&version) {
                return Ok(format!("Error: Image PanOS_vm-{} is not downloaded", version));
            }
            let id = Self::enqueue(state, JobKind::Install, version);
            return Ok(format!(
                "Software install job enqueued with jobid {id}. Run 'show jobs id {id}' to monitor its status."
            ));
        }
        if let Some(raw) = command.strip_prefix("show jobs id ") {
            let id: u64 = raw.trim().parse()?;
            let job = state
                .jobs
                .get_mut(&id)
                .ok_or_else(|| anyhow!("unknown job {}", id))?;
            let kind = match job.kind {
                JobKind::Download => "Downld",
                JobKind::Install => "SWInstall",
            };
            if job.polls_left > 0 {
                job.polls_left -= 1;
                return Ok(format!(
                    "2026/10/14 10:00:00   10:00:01   {id}   {kind}   ACT   PEND   50%\n"
                ));
            }
            if job.fail {
                return Ok(format!(
                    "2026/10/14 10:00:00   10:00:01   {id}   {kind}   FIN   FAIL   10:05:00\nDetails:\nImage verification failed\n"
                ));
            }
            let version = job.version;
            match job.kind {
                JobKind::Download => {
                    state.downloaded.insert(version);
                }
                JobKind::Install => state.pending = Some(version),
            }
            return Ok(format!(
                "2026/10/14 10:00:00   10:00:01   {id}   {kind}   FIN   OK   10:05:00\n"
            ));
        }
        Ok(format!("Unknown command: {}", command))
    }
}

#[async_trait]
impl Transport for FakeDevice {
    async fn connect(&mut self, _: &Endpoint, _: &Credentials, _: Duration) -> Result<()> {
        let mut state = self.lock();
        if state.stay_down && state.reboots > 0 {
            return Err(anyhow!("Connection refused"));
        }
        if state.down_probes > 0 {
            state.down_probes -= 1;
            return Err(anyhow!("Connection refused"));
        }
        state.connected = true;
        Ok(())
    }

    async fn run(&mut self, command: &str, _: Duration) -> Result<String> {
        let mut state = self.lock();
        if !state.connected {
            return Err(anyhow!("Not connected"));
        }
        state.log.push(command.to_string());
        Self::respond(&mut state, command)
    }

    async fn send(&mut self, line: &str) -> Result<()> {
        let mut state = self.lock();
        if !state.connected {
            return Err(anyhow!("Not connected"));
        }
        state.log.push(line.to_string());
        if line == "request restart system" {
            state.reboots += 1;
            state.connected = false;
            state.down_probes = BOOT_PROBES;
            let pending = state.pending.take();
            let booted = state.boot_into.or(pending).unwrap_or(state.running);
            state.running = booted;
            state.downloaded.insert(booted);
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.lock().connected = false;
    }
}

/// A connected session to `device`
pub async fn fake_session(device: &FakeDevice) -> DeviceSession<FakeDevice> {
    let mut session = DeviceSession::new(
        device.clone(),
        Endpoint::new("10.0.0.1", paprep_ssh::SSH_PORT),
        Credentials::new("admin", "Admin1234"),
        SessionTimeouts::default(),
    );
    session.connect().await.unwrap();
    session
}

//! PAN-OS operational commands and their response formats
//!
//! Command text is configurable; `{version}` and `{job}` placeholders are
//! substituted at send time. The parsers here only understand the CLI's
//! text output and never talk to a device.

use paprep_core::{Version, VersionError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResponseError {
    #[error("Response has no {0} field")]
    MissingField(&'static str),
    #[error("Response carries an unparseable version: {0}")]
    Version(#[from] VersionError),
}

/// Command templates sent to the device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSet {
    pub show_system_info: String,
    pub software_check: String,
    pub software_info: String,
    pub software_download: String,
    pub software_install: String,
    pub show_job: String,
    pub restart: String,
    pub restart_confirm: String,
}

impl Default for CommandSet {
    fn default() -> Self {
        Self {
            show_system_info: "show system info".to_string(),
            software_check: "request system software check".to_string(),
            software_info: "request system software info".to_string(),
            software_download: "request system software download version {version}".to_string(),
            software_install: "request system software install version {version}".to_string(),
            show_job: "show jobs id {job}".to_string(),
            restart: "request restart system".to_string(),
            restart_confirm: "y".to_string(),
        }
    }
}

impl CommandSet {
    pub fn download(&self, version: &Version) -> String {
        self.software_download
            .replace("{version}", &version.to_string())
    }

    pub fn install(&self, version: &Version) -> String {
        self.software_install.replace("{version}", &version.to_string())
    }

    pub fn job(&self, job: u64) -> String {
        self.show_job.replace("{job}", &job.to_string())
    }
}

/// How the device answered a download or install request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A background job was queued
    Enqueued(u64),
    /// Nothing to do; the image is already downloaded or installed
    AlreadyDone,
    /// The request finished synchronously
    Completed,
    /// The device refused, or the answer was not understood
    Rejected(String),
}

/// Classify the response to a download or install request
pub fn classify_request(output: &str) -> RequestOutcome {
    let lower = output.to_lowercase();

    if lower.contains("already downloaded") || lower.contains("already installed") {
        return RequestOutcome::AlreadyDone;
    }
    if let Some(reason) = error_text(output) {
        return RequestOutcome::Rejected(reason);
    }
    if lower.contains("job enqueued") {
        return match parse_job_id(output) {
            Some(job) => RequestOutcome::Enqueued(job),
            None => RequestOutcome::Rejected(format!("job enqueued without a job id: {}", output.trim())),
        };
    }
    if lower.contains("successfully") {
        return RequestOutcome::Completed;
    }

    let detail = output.trim();
    if detail.is_empty() {
        RequestOutcome::Rejected("empty response".to_string())
    } else {
        RequestOutcome::Rejected(format!("unrecognised response: {}", detail))
    }
}

/// The first error line of a response, if it reports one
pub fn error_text(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| {
            let lower = line.to_lowercase();
            lower.starts_with("error")
                || lower.starts_with("server error")
                || lower.starts_with("invalid syntax")
                || lower.contains("failed to")
        })
        .map(str::to_string)
}

/// Extract N from "... job enqueued with jobid N ..."
pub fn parse_job_id(output: &str) -> Option<u64> {
    let lower = output.to_lowercase();
    let rest = &lower[lower.find("jobid")? + "jobid".len()..];
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Running version from `show system info`
pub fn parse_sw_version(output: &str) -> Result<Version, ResponseError> {
    let value = output
        .lines()
        .find_map(|line| line.trim().strip_prefix("sw-version:"))
        .map(str::trim)
        .ok_or(ResponseError::MissingField("sw-version"))?;
    Ok(Version::parse(value)?)
}

/// State of a background job as reported by `show jobs id N`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Running { progress: Option<u8> },
    Succeeded,
    Failed { detail: String },
}

/// Parse the job table row for `job`
///
/// ```text
/// Enqueued             Dequeued    ID  Type    Status Result Completed
/// ---------------------------------------------------------------------
/// 2026/10/14 10:00:00  10:00:01    42  Downld  FIN    OK     10:05:12
/// ```
///
/// Returns `None` when no row for the job is present.
pub fn parse_job_status(output: &str, job: u64) -> Option<JobStatus> {
    let id = job.to_string();
    let row: Vec<&str> = output
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .find(|tokens| {
            tokens.iter().any(|t| *t == id)
                && tokens.iter().any(|t| matches!(*t, "FIN" | "ACT" | "PEND" | "QUEUED"))
        })?;

    if row.contains(&"FIN") {
        if row.contains(&"OK") {
            return Some(JobStatus::Succeeded);
        }
        return Some(JobStatus::Failed {
            detail: job_details(output).unwrap_or_else(|| row.join(" ")),
        });
    }

    let progress = row
        .iter()
        .find_map(|t| t.strip_suffix('%'))
        .and_then(|p| p.parse::<u8>().ok());
    Some(JobStatus::Running { progress })
}

/// Text under the `Details:` heading of a job listing
fn job_details(output: &str) -> Option<String> {
    let (_, details) = output.split_once("Details:")?;
    let details = details
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    (!details.is_empty()).then_some(details)
}

/// Whether `request system software info` lists `version` as downloaded
///
/// Rows end with the `Downloaded` and `Currently Installed` columns.
pub fn is_downloaded(output: &str, version: &Version) -> bool {
    let wanted = version.to_string();
    output.lines().any(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        tokens.len() >= 3 && tokens[0] == wanted && tokens[tokens.len() - 2] == "yes"
    })
}

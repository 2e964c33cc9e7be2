//! Configuration loading

use anyhow::Result;
use paprep_core::{LadderConfig, SetupInput};
use paprep_ssh::{ReachabilityPolicy, SessionTimeouts, SSH_PORT};
use paprep_upgrade::{CommandSet, ExecutorTimings};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub setup: SetupConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub ladder: LadderConfig,
    #[serde(default)]
    pub commands: CommandSet,
}

/// How to reach a factory-default device
#[derive(Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_factory_address")]
    pub factory_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_factory_password")]
    pub factory_password: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            factory_address: default_factory_address(),
            port: default_port(),
            username: default_username(),
            factory_password: default_factory_password(),
        }
    }
}

impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("factory_address", &self.factory_address)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("factory_password", &"[REDACTED]")
            .finish()
    }
}

fn default_factory_address() -> String {
    "192.168.1.1".to_string()
}

fn default_port() -> u16 {
    SSH_PORT
}

fn default_username() -> String {
    "admin".to_string()
}

fn default_factory_password() -> String {
    "admin".to_string()
}

/// Settings applied during initial configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct SetupConfig {
    #[serde(default)]
    pub new_ip: String,
    #[serde(default = "default_netmask")]
    pub netmask: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default = "default_dns_servers")]
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub new_password: String,
    #[serde(default)]
    pub target_version: String,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            new_ip: String::new(),
            netmask: default_netmask(),
            gateway: String::new(),
            dns_servers: default_dns_servers(),
            new_password: String::new(),
            target_version: String::new(),
        }
    }
}

impl fmt::Debug for SetupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupConfig")
            .field("new_ip", &self.new_ip)
            .field("netmask", &self.netmask)
            .field("gateway", &self.gateway)
            .field("dns_servers", &self.dns_servers)
            .field("new_password", &"[REDACTED]")
            .field("target_version", &self.target_version)
            .finish()
    }
}

fn default_netmask() -> String {
    "255.255.255.0".to_string()
}

fn default_dns_servers() -> Vec<String> {
    vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()]
}

impl SetupConfig {
    pub fn to_input(&self) -> SetupInput {
        SetupInput {
            new_ip: self.new_ip.clone(),
            netmask: self.netmask.clone(),
            gateway: self.gateway.clone(),
            dns_servers: self.dns_servers.clone(),
            new_password: self.new_password.clone(),
            target_version: self.target_version.clone(),
        }
    }
}

/// Timeouts and polling intervals, all in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_reachability_poll")]
    pub reachability_poll_secs: u64,
    /// Wait after a reboot before probing starts
    #[serde(default = "default_reboot_settle")]
    pub reboot_settle_secs: u64,
    /// Reboot to reachable, settle included
    #[serde(default = "default_reboot_timeout")]
    pub reboot_timeout_secs: u64,
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,
    #[serde(default = "default_job_poll_interval")]
    pub job_poll_interval_secs: u64,
    #[serde(default = "default_commit_timeout")]
    pub commit_timeout_secs: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// How long the device may take to answer at its new address
    #[serde(default = "default_new_address_wait")]
    pub new_address_wait_secs: u64,
    #[serde(default = "default_new_address_poll")]
    pub new_address_poll_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            reachability_poll_secs: default_reachability_poll(),
            reboot_settle_secs: default_reboot_settle(),
            reboot_timeout_secs: default_reboot_timeout(),
            download_timeout_secs: default_download_timeout(),
            install_timeout_secs: default_install_timeout(),
            job_poll_interval_secs: default_job_poll_interval(),
            commit_timeout_secs: default_commit_timeout(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_secs: default_reconnect_delay(),
            new_address_wait_secs: default_new_address_wait(),
            new_address_poll_secs: default_new_address_poll(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    60
}

fn default_command_timeout() -> u64 {
    120
}

fn default_reachability_poll() -> u64 {
    30
}

fn default_reboot_settle() -> u64 {
    60
}

fn default_reboot_timeout() -> u64 {
    600 // PA-VM reboots take 5-10 minutes
}

fn default_download_timeout() -> u64 {
    1800
}

fn default_install_timeout() -> u64 {
    1200
}

fn default_job_poll_interval() -> u64 {
    30
}

fn default_commit_timeout() -> u64 {
    300
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_delay() -> u64 {
    10
}

fn default_new_address_wait() -> u64 {
    180
}

fn default_new_address_poll() -> u64 {
    15
}

impl TimingConfig {
    pub fn session_timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            connect: Duration::from_secs(self.connect_timeout_secs),
            command: Duration::from_secs(self.command_timeout_secs),
        }
    }

    pub fn executor_timings(&self) -> ExecutorTimings {
        ExecutorTimings {
            download_timeout: Duration::from_secs(self.download_timeout_secs),
            install_timeout: Duration::from_secs(self.install_timeout_secs),
            job_poll_interval: Duration::from_secs(self.job_poll_interval_secs),
            reboot_settle: Duration::from_secs(self.reboot_settle_secs),
            reboot_timeout: Duration::from_secs(self.reboot_timeout_secs),
            reachability_poll: Duration::from_secs(self.reachability_poll_secs),
            reconnect_attempts: self.reconnect_attempts,
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
        }
    }

    pub fn new_address_policy(&self) -> ReachabilityPolicy {
        ReachabilityPolicy {
            poll_interval: Duration::from_secs(self.new_address_poll_secs),
            max_wait: Duration::from_secs(self.new_address_wait_secs),
        }
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_secs(self.commit_timeout_secs)
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let config = Config {
        setup: SetupConfig {
            new_ip: "192.168.10.50".to_string(),
            gateway: "192.168.10.1".to_string(),
            target_version: "11.1.4".to_string(),
            ..SetupConfig::default()
        },
        ..Config::default()
    };

    let content = toml::to_string_pretty(&config)?;
    std::fs::write(path, content)?;
    Ok(())
}

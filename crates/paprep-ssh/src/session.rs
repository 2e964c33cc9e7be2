//! Device session state machine
//!
//! A session owns one transport and tracks where the device connection stands:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected
//!                                        \-> Unreachable (after reboot)
//! ```
//!
//! Every suspending operation carries an explicit timeout, and the long
//! reachability wait checks for cancellation between probes.

use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{Credentials, Endpoint, Transport};

/// Longest command output printed in debug logs
const LOG_OUTPUT_LIMIT: usize = 200;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Failed to connect to {address}: {message}")]
    Connect { address: String, message: String },
    #[error("Not connected to {0}")]
    NotConnected(String),
    #[error("Command `{command}` failed: {message}")]
    Command { command: String, message: String },
    #[error("Command `{command}` timed out after {}s", .timeout.as_secs())]
    CommandTimeout { command: String, timeout: Duration },
    #[error("{address} did not become reachable within {}s", .waited.as_secs())]
    UnreachableTimeout { address: String, waited: Duration },
    #[error("Operation cancelled")]
    Cancelled,
}

impl SessionError {
    /// Operator-facing hint for resolving this error
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::Connect { message, .. } => {
                let message = message.to_lowercase();
                if message.contains("authentication") || message.contains("password") {
                    "Check the username and password. The factory default is admin/admin."
                } else if message.contains("timed out") {
                    "The device may be unreachable. Check network connectivity and the IP address."
                } else if message.contains("refused") {
                    "SSH may not be enabled yet or the device is still booting. Wait and try again."
                } else if message.contains("no route") || message.contains("unreachable") {
                    "Cannot reach the device. Check that this host is on the management network."
                } else {
                    "Check the logs for more details and try again."
                }
            }
            Self::NotConnected(_) => "The session was closed. Reconnect before issuing commands.",
            Self::Command { .. } => "The connection dropped mid-command. Check the device console.",
            Self::CommandTimeout { .. } => {
                "The device did not answer in time. It may be busy committing or installing."
            }
            Self::UnreachableTimeout { .. } => {
                "The device did not come back after reboot. Check its console before retrying."
            }
            Self::Cancelled => "The operation was cancelled.",
        }
    }
}

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// The device is expected to be down (rebooting)
    Unreachable,
}

/// Time budgets for single operations
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    pub connect: Duration,
    pub command: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(60),
            command: Duration::from_secs(120),
        }
    }
}

/// How to poll for a device coming back
#[derive(Debug, Clone, Copy)]
pub struct ReachabilityPolicy {
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl Default for ReachabilityPolicy {
    fn default() -> Self {
        Self {
            // Reboots take several minutes; probing faster only adds noise
            poll_interval: Duration::from_secs(30),
            max_wait: Duration::from_secs(600),
        }
    }
}

/// A command session with one device address
pub struct DeviceSession<T: Transport> {
    transport: T,
    endpoint: Endpoint,
    credentials: Credentials,
    timeouts: SessionTimeouts,
    state: SessionState,
}

impl<T: Transport> DeviceSession<T> {
    pub fn new(
        transport: T,
        endpoint: Endpoint,
        credentials: Credentials,
        timeouts: SessionTimeouts,
    ) -> Self {
        Self {
            transport,
            endpoint,
            credentials,
            timeouts,
            state: SessionState::Disconnected,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn timeouts(&self) -> SessionTimeouts {
        self.timeouts
    }

    /// Open a connection; a single attempt bounded by the connect timeout
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        info!(endpoint = %self.endpoint, user = %self.credentials.username, "Connecting");
        self.attempt_connect(self.timeouts.connect).await.map_err(|message| {
            SessionError::Connect {
                address: self.endpoint.to_string(),
                message,
            }
        })?;
        info!(endpoint = %self.endpoint, "Connected");
        Ok(())
    }

    /// One connection attempt; any previous handle is closed first
    async fn attempt_connect(&mut self, budget: Duration) -> Result<(), String> {
        self.transport.disconnect().await;
        self.state = SessionState::Connecting;

        let result = timeout(
            budget,
            self.transport.connect(&self.endpoint, &self.credentials, budget),
        )
        .await;

        match result {
            Ok(Ok(())) => {
                self.state = SessionState::Connected;
                Ok(())
            }
            Ok(Err(e)) => {
                self.state = SessionState::Disconnected;
                Err(format!("{:#}", e))
            }
            Err(_) => {
                self.transport.disconnect().await;
                self.state = SessionState::Disconnected;
                Err(format!("timed out after {}s", budget.as_secs()))
            }
        }
    }

    /// Run a command with the default command timeout
    pub async fn run_command(&mut self, command: &str) -> Result<String, SessionError> {
        self.run_command_with_timeout(command, self.timeouts.command)
            .await
    }

    pub async fn run_command_with_timeout(
        &mut self,
        command: &str,
        limit: Duration,
    ) -> Result<String, SessionError> {
        self.execute(command, command, limit).await
    }

    /// Run a command whose text must not appear in logs or errors
    pub async fn run_sensitive(
        &mut self,
        command: &str,
        label: &str,
    ) -> Result<String, SessionError> {
        self.execute(command, label, self.timeouts.command).await
    }

    async fn execute(
        &mut self,
        command: &str,
        label: &str,
        limit: Duration,
    ) -> Result<String, SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected(self.endpoint.to_string()));
        }

        debug!(command = %label, "Sending command");
        match timeout(limit, self.transport.run(command, limit)).await {
            Ok(Ok(output)) => {
                debug!(command = %label, output = %truncate(&output), "Command output");
                Ok(output)
            }
            Ok(Err(e)) => {
                // Channel state is unknown; never reuse it
                self.drop_connection(SessionState::Disconnected).await;
                Err(SessionError::Command {
                    command: label.to_string(),
                    message: format!("{:#}", e),
                })
            }
            Err(_) => {
                self.drop_connection(SessionState::Disconnected).await;
                Err(SessionError::CommandTimeout {
                    command: label.to_string(),
                    timeout: limit,
                })
            }
        }
    }

    /// Write a line without waiting for the device to answer
    pub async fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected(self.endpoint.to_string()));
        }
        debug!(line = %line, "Sending line");
        let result = timeout(self.timeouts.command, self.transport.send(line)).await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SessionError::Command {
                command: line.to_string(),
                message: format!("{:#}", e),
            }),
            Err(_) => Err(SessionError::CommandTimeout {
                command: line.to_string(),
                timeout: self.timeouts.command,
            }),
        }
    }

    /// Drop the connection because the device is going down
    pub async fn mark_unreachable(&mut self) {
        self.drop_connection(SessionState::Unreachable).await;
        info!(endpoint = %self.endpoint, "Device marked unreachable");
    }

    /// Close the connection; safe to call in any state
    pub async fn disconnect(&mut self) {
        if self.state != SessionState::Disconnected {
            info!(endpoint = %self.endpoint, "Disconnecting");
        }
        self.drop_connection(SessionState::Disconnected).await;
    }

    async fn drop_connection(&mut self, next: SessionState) {
        self.transport.disconnect().await;
        self.state = next;
    }

    /// Close and reopen the connection, retrying on failure
    pub async fn reconnect(
        &mut self,
        attempts: u32,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        self.disconnect().await;
        let attempts = attempts.max(1);

        let mut last_error = None;
        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Reconnect attempt failed");
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                    _ = sleep(delay) => {}
                }
            }
        }

        Err(last_error.unwrap_or(SessionError::Cancelled))
    }

    /// Poll until the device accepts a connection again
    ///
    /// Probe failures are expected while the device reboots and are only
    /// debug-logged. Returns `UnreachableTimeout` once `max_wait` has elapsed
    /// and `Cancelled` if the token fires; both are checked at every poll
    /// boundary. On success the probe connection is kept and the session is
    /// `Connected`.
    pub async fn wait_until_reachable(
        &mut self,
        policy: ReachabilityPolicy,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        if self.is_connected() {
            return Ok(());
        }

        let start = Instant::now();
        let deadline = start + policy.max_wait;
        let mut attempt: u32 = 0;

        info!(
            endpoint = %self.endpoint,
            max_wait_secs = policy.max_wait.as_secs(),
            "Waiting for device to become reachable"
        );

        loop {
            if cancel.is_cancelled() {
                self.state = SessionState::Unreachable;
                return Err(SessionError::Cancelled);
            }

            let now = Instant::now();
            if now >= deadline {
                self.state = SessionState::Unreachable;
                warn!(endpoint = %self.endpoint, attempts = attempt, "Device did not come back");
                return Err(SessionError::UnreachableTimeout {
                    address: self.endpoint.to_string(),
                    waited: now - start,
                });
            }

            attempt += 1;
            let budget = self.timeouts.connect.min(deadline - now);
            debug!(
                attempt,
                elapsed_secs = (now - start).as_secs(),
                "Probing device"
            );

            match self.attempt_connect(budget).await {
                Ok(()) => {
                    info!(
                        endpoint = %self.endpoint,
                        attempt,
                        elapsed_secs = start.elapsed().as_secs(),
                        "Device is reachable"
                    );
                    return Ok(());
                }
                Err(message) => {
                    self.state = SessionState::Unreachable;
                    debug!(attempt, error = %message, "Probe failed");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                continue;
            }

            let pause = policy.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.state = SessionState::Unreachable;
                    return Err(SessionError::Cancelled);
                }
                _ = sleep(pause) => {}
            }
        }
    }
}

fn truncate(output: &str) -> String {
    if output.len() <= LOG_OUTPUT_LIMIT {
        return output.to_string();
    }
    let mut end = LOG_OUTPUT_LIMIT;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &output[..end])
}

//! Interactive SSH shell transport for the PAN-OS CLI
//!
//! PAN-OS does not accept exec requests for operational commands, so the
//! transport opens a PTY-backed shell and reads until the CLI prompt
//! (`admin@PA-VM>` or `admin@PA-VM#` in configure mode) reappears.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use crate::transport::{Credentials, Endpoint, Transport};

/// Upper bound on a graceful disconnect; the peer may already be gone
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Command sent after login so long outputs are not paginated
const PAGER_OFF: &str = "set cli pager off";

/// russh client handler
///
/// Factory-default appliances generate a fresh host key on every reset, so
/// there is no known key to pin against.
struct AcceptHostKey;

impl client::Handler for AcceptHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

struct Connection {
    handle: Handle<AcceptHostKey>,
    channel: Channel<Msg>,
}

/// SSH transport driving the PAN-OS interactive CLI
pub struct ShellTransport {
    config: Arc<client::Config>,
    connection: Option<Connection>,
}

impl ShellTransport {
    pub fn new() -> Self {
        let config = client::Config {
            inactivity_timeout: Some(Duration::from_secs(600)),
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            connection: None,
        }
    }

    async fn open(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<Connection> {
        let mut handle = client::connect(
            self.config.clone(),
            (endpoint.host.as_str(), endpoint.port),
            AcceptHostKey,
        )
        .await
        .with_context(|| format!("SSH connection to {} failed", endpoint))?;

        let auth = handle
            .authenticate_password(credentials.username.clone(), credentials.password())
            .await
            .context("SSH authentication request failed")?;
        if !auth.success() {
            bail!("Authentication failed for user {}", credentials.username);
        }

        let channel = handle.channel_open_session().await?;
        channel
            .request_pty(false, "vt100", 200, 48, 0, 0, &[])
            .await?;
        channel.request_shell(false).await?;

        Ok(Connection { handle, channel })
    }
}

impl Default for ShellTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ShellTransport {
    async fn connect(
        &mut self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        connect_timeout: Duration,
    ) -> Result<()> {
        self.disconnect().await;

        let mut connection = timeout(connect_timeout, self.open(endpoint, credentials))
            .await
            .map_err(|_| anyhow!("Connection timed out after {}s", connect_timeout.as_secs()))??;

        // Consume the login banner up to the first prompt
        read_until_prompt(&mut connection.channel, connect_timeout).await?;
        write_line(&connection.channel, PAGER_OFF).await?;
        read_until_prompt(&mut connection.channel, connect_timeout).await?;

        info!(endpoint = %endpoint, "SSH shell session established");
        self.connection = Some(connection);
        Ok(())
    }

    async fn run(&mut self, command: &str, command_timeout: Duration) -> Result<String> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| anyhow!("Not connected"))?;

        write_line(&connection.channel, command).await?;
        let raw = read_until_prompt(&mut connection.channel, command_timeout).await?;
        Ok(clean_output(&raw, command))
    }

    async fn send(&mut self, line: &str) -> Result<()> {
        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| anyhow!("Not connected"))?;
        write_line(&connection.channel, line).await
    }

    async fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            let _ = timeout(
                DISCONNECT_TIMEOUT,
                connection
                    .handle
                    .disconnect(Disconnect::ByApplication, "", "en"),
            )
            .await;
            debug!("SSH connection closed");
        }
    }
}

async fn write_line(channel: &Channel<Msg>, line: &str) -> Result<()> {
    let data = format!("{}\n", line);
    channel
        .data(data.as_bytes())
        .await
        .map_err(|e| anyhow!("Failed to write to channel: {}", e))
}

/// Collect channel output until the CLI prompt is the last line
async fn read_until_prompt(channel: &mut Channel<Msg>, read_timeout: Duration) -> Result<String> {
    let read = async {
        let mut buffer = String::new();
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    buffer.push_str(&String::from_utf8_lossy(&data));
                    trace!(bytes = data.len(), "Received shell output");
                    if ends_with_prompt(&buffer) {
                        return Ok(buffer);
                    }
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    bail!("Channel closed by device");
                }
                Some(_) => {}
            }
        }
    };

    timeout(read_timeout, read)
        .await
        .map_err(|_| anyhow!("No prompt within {}s", read_timeout.as_secs()))?
}

/// True when the last line of `buffer` is a PAN-OS CLI prompt
///
/// Prompts look like `admin@PA-VM> `, `admin@fw01(active)> ` or
/// `admin@PA-VM# `.
pub fn ends_with_prompt(buffer: &str) -> bool {
    let last = buffer.rsplit('\n').next().unwrap_or_default().trim();
    !last.is_empty()
        && last.contains('@')
        && !last.contains(char::is_whitespace)
        && (last.ends_with('>') || last.ends_with('#'))
}

/// Strip carriage returns, the echoed command, and the trailing prompt
pub fn clean_output(raw: &str, command: &str) -> String {
    let normalized = raw.replace('\r', "");
    let mut lines: Vec<&str> = normalized.lines().collect();

    if lines.last().is_some_and(|line| ends_with_prompt(line)) {
        lines.pop();
    }
    if let Some(pos) = lines.iter().position(|line| line.trim_end().ends_with(command.trim())) {
        if pos <= 1 {
            lines.drain(..=pos);
        }
    }

    lines.join("\n").trim().to_string()
}

//! Transport abstraction for the remote command channel

use anyhow::Result;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::time::Duration;

/// Default SSH port
pub const SSH_PORT: u16 = 22;

/// Network location of a device's management interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Login credentials; the password is redacted from `Debug` output
#[derive(Debug)]
pub struct Credentials {
    pub username: String,
    password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }
}

/// Minimal text-in/text-out command channel
///
/// Implementations hold at most one live connection. `connect` replaces any
/// existing connection; `disconnect` must be safe to call in any state.
#[async_trait]
pub trait Transport: Send {
    /// Open and authenticate a connection, ready to accept commands
    async fn connect(
        &mut self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<()>;

    /// Run one command and return its output with echo and prompt removed
    async fn run(&mut self, command: &str, timeout: Duration) -> Result<String>;

    /// Write a line without waiting for a response
    async fn send(&mut self, line: &str) -> Result<()>;

    /// Close the connection if one is open
    async fn disconnect(&mut self);
}

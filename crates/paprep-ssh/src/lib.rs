//! paprep SSH - Remote command sessions to PAN-OS appliances
//!
//! This crate wraps russh to provide an interactive CLI session with
//! explicit connection states, bounded command execution, and reboot
//! recovery polling.

pub mod session;
pub mod shell;
pub mod transport;

pub use session::{DeviceSession, ReachabilityPolicy, SessionError, SessionState, SessionTimeouts};
pub use shell::ShellTransport;
pub use transport::{Credentials, Endpoint, Transport, SSH_PORT};

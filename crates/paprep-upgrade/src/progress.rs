//! Progress reporting
//!
//! Events are fire-and-forget: a slow or absent listener never stalls an
//! upgrade.

use serde::Serialize;
use tokio::sync::broadcast;

/// Where in the run an event was emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    QueryVersion,
    EnsureBaseImage,
    Download,
    Install,
    Reboot,
    AwaitRecovery,
    Verify,
    HopComplete,
    Completed,
    Aborted,
}

/// A progress update for the operator
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub phase: Phase,
    /// Zero-based hop index
    pub hop_index: usize,
    pub total_hops: usize,
    pub message: String,
}

/// Receiver of progress events; `emit` must not block
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

impl ProgressSink for broadcast::Sender<ProgressEvent> {
    fn emit(&self, event: ProgressEvent) {
        // No subscribers is fine
        let _ = self.send(event);
    }
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn emit(&self, event: ProgressEvent) {
        self(event)
    }
}

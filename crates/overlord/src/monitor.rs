//! Monitor pub/sub fan-out.
//!
//! Registry join/leave events (`"agent joined"`, `"agent left"`,
//! `"slogcat joined"`, `"slogcat left"`) are broadcast to any number of
//! operator subscribers over a plain [`tokio::sync::broadcast`] channel,
//! exposed at `/api/socket.io/*` as a WebSocket feed of JSON text frames.
//! See DESIGN.md for why that path serves plain WebSocket frames rather
//! than real Socket.IO framing.

use serde::Serialize;
use tokio::sync::broadcast;

/// Events with no subscriber are simply dropped; publish never blocks and
/// never fails the caller.
const MONITOR_BUFFER: usize = 1024;

#[derive(Debug, Clone, Serialize)]
pub struct MonitorMessage {
    #[serde(rename = "type")]
    pub event: &'static str,
    pub mid: String,
    pub cid: String,
}

#[derive(Clone)]
pub struct MonitorSink {
    tx: broadcast::Sender<MonitorMessage>,
}

impl MonitorSink {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(MONITOR_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorMessage> {
        self.tx.subscribe()
    }

    /// Publishes a join/leave event. Best-effort: a lagging or absent
    /// subscriber never surfaces an error to the registry.
    pub fn publish(&self, event: &'static str, mid: &str, cid: &str) {
        let _ = self.tx.send(MonitorMessage {
            event,
            mid: mid.to_string(),
            cid: cid.to_string(),
        });
    }
}

impl Default for MonitorSink {
    fn default() -> Self {
        Self::new()
    }
}

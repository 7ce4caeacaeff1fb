//! Lifecycle events emitted by the bridge's background services.
//!
//! The supervisor, the broadcast server and the frame loop report what they
//! did through an optional channel. Nothing here is required for correct
//! operation: a missing or disconnected receiver simply drops events. The
//! host drains the channel and appends the events to the session log.

use std::sync::mpsc;

use crate::broadcast::ConnectionId;

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// The advisor answered its handshake.
    AdvisorStarted {
        command: String,
        generation: u64,
        handshake: String,
    },
    /// The advisor could not be spawned at all.
    AdvisorSpawnFailed { command: String, error: String },
    /// The advisor did not write its handshake line in time.
    HandshakeTimedOut { command: String, timeout_secs: u64 },
    /// The advisor process exited on its own.
    AdvisorDied { generation: u64 },
    /// The advisor was terminated on request (stop or restart).
    AdvisorStopped { generation: u64 },
    ServerStarted { addr: String },
    ServerStopped,
    ViewerConnected { id: ConnectionId, peer: String },
    ViewerDropped { id: ConnectionId, reason: String },
    /// A recommendations payload replaced the stored snapshot.
    RecommendationsUpdated { version: u64, scores: usize },
    RecommendationsCleared,
    /// A game command was rejected by the executor.
    CommandRejected { command: String, error: String },
}

/// Cloneable, optional event sender.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<BridgeEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<BridgeEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: BridgeEvent) {
        if let Some(ref tx) = self.tx {
            let _ = tx.send(event);
        }
    }
}

//! Events emitted by the controller.
//!
//! Every notification the core produces is a [`DeviceEvent`] published on an
//! [`EventBus`]. Publishing never waits for a consumer. Broadcast subscribers
//! that fall too far behind miss events; attached sinks each get an unbounded
//! queue and see every event.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::state::TestPhase;

pub const TITLE_ALREADY_STARTED: &str = "Test Started";
pub const TITLE_NOT_RUNNING: &str = "Test Not Running";
pub const TITLE_TEST_ENDED: &str = "Test Ended";
pub const TITLE_TEST_STOPPED: &str = "Test Stopped";
pub const TITLE_DEVICE_ERROR: &str = "Connection ERROR!";
pub const TITLE_UNKNOWN_RESULT: &str = "Unknown Result";
pub const TITLE_ID_ERROR: &str = "ID Error";
pub const TITLE_STATUS_ERROR: &str = "Status Error";
pub const TITLE_UNKNOWN_STATE: &str = "Unknown State";
pub const TITLE_UNHANDLED_STATUS: &str = "Unhandled Status";
pub const TITLE_SEND_FAILED: &str = "Send Command Failed";

/// One decoded measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Device time in seconds (wire value is milliseconds).
    pub time_secs: f64,
    pub millivolts: i64,
    pub milliamps: i64,
}

/// Which user affordances make sense in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Controls {
    pub connect: bool,
    pub start: bool,
    pub stop: bool,
    pub save: bool,
}

impl Default for Controls {
    /// Disconnected: only connecting is possible.
    fn default() -> Self {
        Self {
            connect: true,
            start: false,
            stop: false,
            save: false,
        }
    }
}

/// Notifications broadcast to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DeviceEvent {
    /// Opening the socket failed.
    ConnectError { reason: String },

    /// The device answered discovery.
    Identified { model: String, serial: String },

    /// A complete, non-placeholder telemetry sample.
    Sample(TelemetrySample),

    /// Previously received samples should be discarded.
    BufferClear,

    /// The test phase changed.
    TestStateChanged { phase: TestPhase },

    /// Informational or error message for the user.
    Notice { title: String, message: String },

    /// A datagram that could not be classified.
    UnhandledMessage { raw: String },

    /// The enabled set of user affordances changed.
    ControlsChanged(Controls),

    /// The receive loop hit a socket error and the link was closed.
    ConnectionLost { reason: String },
}

impl DeviceEvent {
    pub fn notice(title: impl Into<String>, message: impl Into<String>) -> Self {
        DeviceEvent::Notice {
            title: title.into(),
            message: message.into(),
        }
    }

    /// Returns `true` for a notice with the given title.
    pub fn is_notice(&self, expected: &str) -> bool {
        matches!(self, DeviceEvent::Notice { title, .. } if title == expected)
    }
}

/// Fan-out point for [`DeviceEvent`]s.
///
/// Both consumer kinds are fed under one lock, so every consumer observes
/// events in the same order.
#[derive(Clone)]
pub struct EventBus {
    broadcast: broadcast::Sender<DeviceEvent>,
    queues: Arc<Mutex<Vec<mpsc::UnboundedSender<DeviceEvent>>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (broadcast, _) = broadcast::channel(capacity.max(1));
        Self {
            broadcast,
            queues: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Lossy receiver bounded by the bus capacity.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.broadcast.subscribe()
    }

    /// Lossless receiver. The queue is released once the receiver is dropped.
    pub fn attach(&self) -> mpsc::UnboundedReceiver<DeviceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn publish(&self, event: DeviceEvent) {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues.retain(|queue| queue.send(event.clone()).is_ok());
        let _ = self.broadcast.send(event);
    }
}

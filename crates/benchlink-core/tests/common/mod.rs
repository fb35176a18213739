//! Shared test helpers for benchlink-core integration tests.
//!
//! This module provides a scriptable UDP device, event waiting helpers, and a
//! recording [`Sink`] for tests that exercise the session, the controller,
//! and the simulator.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use benchlink_core::config::ControllerConfig;
use benchlink_core::controller::Controller;
use benchlink_core::event::{Controls, DeviceEvent};
use benchlink_core::sink::Sink;
use benchlink_core::state::TestPhase;

/// How long any single expectation waits before failing the test.
pub const WAIT: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Mock device
// ---------------------------------------------------------------------------

/// A UDP endpoint standing in for the device.
///
/// Every datagram it receives is forwarded to the test through a channel, and
/// replies go to whichever peer spoke last.
pub struct MockDevice {
    socket: Arc<UdpSocket>,
    inbound: mpsc::UnboundedReceiver<String>,
    peer: Arc<Mutex<Option<SocketAddr>>>,
    reader: tokio::task::JoinHandle<()>,
}

impl MockDevice {
    pub async fn bind() -> Self {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (tx, inbound) = mpsc::unbounded_channel();
        let peer = Arc::new(Mutex::new(None));

        let reader = {
            let socket = socket.clone();
            let peer = peer.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                    *peer.lock().unwrap() = Some(from);
                    let text: String = buf[..len].iter().map(|&b| char::from(b)).collect();
                    if tx.send(text).is_err() {
                        return;
                    }
                }
            })
        };

        Self {
            socket,
            inbound,
            peer,
            reader,
        }
    }

    pub fn port(&self) -> u16 {
        self.socket.local_addr().unwrap().port()
    }

    /// Wait for the next datagram from the controller.
    pub async fn expect_command(&mut self) -> String {
        tokio::time::timeout(WAIT, self.inbound.recv())
            .await
            .expect("timed out waiting for a command")
            .expect("mock device reader stopped")
    }

    /// Assert that nothing arrives for `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(Some(command)) = tokio::time::timeout(window, self.inbound.recv()).await {
            panic!("unexpected command: {command}");
        }
    }

    /// Send `text` to the last peer that spoke.
    pub async fn send(&self, text: &str) {
        self.send_bytes(text.as_bytes()).await;
    }

    pub async fn send_bytes(&self, bytes: &[u8]) {
        let peer = self
            .peer
            .lock()
            .unwrap()
            .expect("no peer has contacted the mock device yet");
        self.socket.send_to(bytes, peer).await.unwrap();
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// A loopback port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.local_addr().unwrap().port()
}

// ---------------------------------------------------------------------------
// Controller helpers
// ---------------------------------------------------------------------------

/// Config with short timeouts so loss and shutdown are observed quickly.
pub fn fast_config() -> ControllerConfig {
    ControllerConfig {
        read_timeout_ms: 100,
        connect_timeout_ms: 1000,
        sample_rate_ms: 100,
        ..ControllerConfig::default()
    }
}

/// Connect `controller` to `device`, answer discovery, and wait until the
/// identification has been published.
pub async fn connect_and_identify(
    controller: &Controller,
    device: &mut MockDevice,
    events: &mut broadcast::Receiver<DeviceEvent>,
) {
    controller
        .connect("127.0.0.1", device.port())
        .await
        .unwrap();
    assert_eq!(device.expect_command().await, "ID;");
    device.send("ID;MODEL=X1;SERIAL=99;").await;
    wait_for(events, |e| matches!(e, DeviceEvent::Identified { .. })).await;
}

/// Drive `controller` into [`TestPhase::Running`] for a test of
/// `duration_secs`.
pub async fn start_running(
    controller: &Controller,
    device: &mut MockDevice,
    events: &mut broadcast::Receiver<DeviceEvent>,
    duration_secs: u32,
) {
    controller.start_test(duration_secs).await.unwrap();
    let command = device.expect_command().await;
    assert!(command.starts_with("TEST;CMD=START;"), "got {command}");
    device.send("TEST;RESULT=STARTED;").await;
    wait_for(events, |e| {
        *e == DeviceEvent::TestStateChanged {
            phase: TestPhase::Running,
        }
    })
    .await;
}

/// Return the first event matching `pred`, discarding everything before it.
pub async fn wait_for<F>(events: &mut broadcast::Receiver<DeviceEvent>, pred: F) -> DeviceEvent
where
    F: Fn(&DeviceEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Collect events up to and including the first one matching `pred`.
pub async fn collect_until<F>(
    events: &mut broadcast::Receiver<DeviceEvent>,
    pred: F,
) -> Vec<DeviceEvent>
where
    F: Fn(&DeviceEvent) -> bool,
{
    let mut seen = Vec::new();
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let done = pred(&event);
                    seen.push(event);
                    if done {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out collecting events");
    seen
}

/// Everything already queued on `events`.
pub fn drain(events: &mut broadcast::Receiver<DeviceEvent>) -> Vec<DeviceEvent> {
    let mut seen = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => seen.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return seen,
        }
    }
}

// ---------------------------------------------------------------------------
// Recording sink
// ---------------------------------------------------------------------------

/// A [`Sink`] that records each call as a short string.
#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    /// Poll until a recorded call satisfies `pred`.
    pub async fn wait_for<F>(&self, pred: F)
    where
        F: Fn(&str) -> bool,
    {
        tokio::time::timeout(WAIT, async {
            loop {
                if self.calls().iter().any(|call| pred(call)) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for sink call");
    }
}

impl Sink for RecordingSink {
    fn on_connect_error(&self, reason: &str) {
        self.record(format!("connect_error {reason}"));
    }
    fn on_identified(&self, model: &str, serial: &str) {
        self.record(format!("identified {model} {serial}"));
    }
    fn on_sample(&self, time_secs: f64, millivolts: i64, milliamps: i64) {
        self.record(format!("sample {time_secs} {millivolts} {milliamps}"));
    }
    fn on_buffer_clear(&self) {
        self.record("buffer_clear".to_string());
    }
    fn on_test_state_changed(&self, phase: TestPhase) {
        self.record(format!("phase {phase}"));
    }
    fn on_notice(&self, title: &str, message: &str) {
        self.record(format!("notice {title}: {message}"));
    }
    fn on_unhandled_message(&self, raw: &str) {
        self.record(format!("unhandled {raw}"));
    }
    fn on_controls_changed(&self, controls: Controls) {
        self.record(format!(
            "controls connect={} start={} stop={} save={}",
            controls.connect, controls.start, controls.stop, controls.save
        ));
    }
    fn on_connection_lost(&self, reason: &str) {
        self.record(format!("connection_lost {reason}"));
    }
}

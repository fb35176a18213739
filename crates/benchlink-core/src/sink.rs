//! Callback-style consumer interface.
//!
//! A [`Sink`] is the shape a GUI or other collaborator implements to hear
//! about device activity. The controller never owns a sink: it is attached by
//! [`Weak`] reference and fed from a dedicated forwarding task over an
//! unbounded queue. A slow consumer falls behind without losing events, and a
//! dropped one never stalls frame processing.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use benchlink_core::config::ControllerConfig;
//! use benchlink_core::controller::Controller;
//! use benchlink_core::sink::Sink;
//!
//! struct Printer;
//!
//! impl Sink for Printer {
//!     fn on_sample(&self, time_secs: f64, millivolts: i64, milliamps: i64) {
//!         println!("{time_secs:.3}s {millivolts} mV {milliamps} mA");
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let controller = Controller::new(ControllerConfig::default());
//!     let printer: Arc<dyn Sink> = Arc::new(Printer);
//!     let handle = controller.attach_sink(Arc::downgrade(&printer));
//!     // ...
//!     handle.stop().await;
//! }
//! ```

use std::sync::Weak;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument, Span};

use crate::event::{Controls, DeviceEvent};
use crate::state::TestPhase;

/// Receiver of controller notifications. Every method defaults to a no-op.
///
/// Implementations must return quickly; they run on the forwarding task, not
/// on the caller's thread.
pub trait Sink: Send + Sync {
    fn on_connect_error(&self, _reason: &str) {}
    fn on_identified(&self, _model: &str, _serial: &str) {}
    fn on_sample(&self, _time_secs: f64, _millivolts: i64, _milliamps: i64) {}
    fn on_buffer_clear(&self) {}
    fn on_test_state_changed(&self, _phase: TestPhase) {}
    fn on_notice(&self, _title: &str, _message: &str) {}
    fn on_unhandled_message(&self, _raw: &str) {}
    fn on_controls_changed(&self, _controls: Controls) {}
    fn on_connection_lost(&self, _reason: &str) {}
}

/// Invoke the sink method matching `event`.
pub fn deliver(sink: &dyn Sink, event: &DeviceEvent) {
    match event {
        DeviceEvent::ConnectError { reason } => sink.on_connect_error(reason),
        DeviceEvent::Identified { model, serial } => sink.on_identified(model, serial),
        DeviceEvent::Sample(sample) => {
            sink.on_sample(sample.time_secs, sample.millivolts, sample.milliamps)
        }
        DeviceEvent::BufferClear => sink.on_buffer_clear(),
        DeviceEvent::TestStateChanged { phase } => sink.on_test_state_changed(*phase),
        DeviceEvent::Notice { title, message } => sink.on_notice(title, message),
        DeviceEvent::UnhandledMessage { raw } => sink.on_unhandled_message(raw),
        DeviceEvent::ControlsChanged(controls) => sink.on_controls_changed(*controls),
        DeviceEvent::ConnectionLost { reason } => sink.on_connection_lost(reason),
    }
}

/// Handle for a running sink forwarder.
///
/// The forwarder ends on its own when the sink is dropped or the controller
/// goes away.
pub struct SinkHandle {
    cancel_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

impl SinkHandle {
    /// Stops forwarding and waits for the task to finish.
    pub async fn stop(self) {
        self.cancel_token.cancel();
        let _ = self.join_handle.await;
    }

    /// Stops forwarding without waiting.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.join_handle.is_finished()
    }
}

pub(crate) fn spawn_forwarder(
    sink: Weak<dyn Sink>,
    mut events: mpsc::UnboundedReceiver<DeviceEvent>,
    parent: &Span,
) -> SinkHandle {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();
    let span = tracing::debug_span!(parent: parent, "sink_forwarder");

    let join_handle = tokio::spawn(
        async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => event,
                };
                let Some(event) = event else {
                    break;
                };
                let Some(sink) = sink.upgrade() else {
                    debug!("sink dropped, forwarder exiting");
                    break;
                };
                deliver(sink.as_ref(), &event);
            }
        }
        .instrument(span),
    );

    SinkHandle {
        cancel_token,
        join_handle,
    }
}

//! The single entry point collaborators talk to.
//!
//! [`Controller`] composes the [`Session`], the [`TestStateMachine`], and the
//! [`CommandDispatcher`], and routes every inbound frame to the right
//! transition. All outcomes are published as [`DeviceEvent`]s; subscribe with
//! [`Controller::subscribe`] or attach a [`Sink`] with
//! [`Controller::attach_sink`].
//!
//! A process is expected to construct exactly one controller and pass it by
//! reference to whatever needs it. Nothing enforces this at runtime.
//!
//! # Example
//!
//! ```no_run
//! use benchlink_core::config::ControllerConfig;
//! use benchlink_core::controller::Controller;
//! use benchlink_core::event::DeviceEvent;
//!
//! #[tokio::main]
//! async fn main() -> benchlink_core::Result<()> {
//!     let controller = Controller::new(ControllerConfig::load());
//!     let mut events = controller.subscribe();
//!
//!     controller.connect("192.168.1.50", 8888).await?;
//!     while let Ok(event) = events.recv().await {
//!         if let DeviceEvent::Identified { model, serial } = event {
//!             println!("{model} #{serial}");
//!             break;
//!         }
//!     }
//!
//!     controller.start_test(10).await?;
//!     // ...
//!     controller.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::io;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, info_span, trace, warn, Span};

use crate::config::ControllerConfig;
use crate::dispatcher::CommandDispatcher;
use crate::error::{FieldError, Result};
use crate::event::{
    Controls, DeviceEvent, EventBus, TelemetrySample, TITLE_ID_ERROR, TITLE_STATUS_ERROR,
    TITLE_UNHANDLED_STATUS, TITLE_UNKNOWN_STATE,
};
use crate::protocol::{
    self, Command, Frame, MessageKind, FIELD_MESSAGE, FIELD_MILLIAMPS, FIELD_MILLIVOLTS,
    FIELD_MODEL, FIELD_RESULT, FIELD_SERIAL, FIELD_STATE, FIELD_TIME,
};
use crate::session::{Connection, DatagramHandler, Session, SessionError, SessionState};
use crate::sink::{self, Sink, SinkHandle};
use crate::state::{Rejection, TestPhase, TestSession, TestStateMachine, Transition};
use crate::validation;

/// Whether a start/stop request went out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// The command was handed to the dispatcher.
    Dispatched,
    /// The request was refused locally and a notice was published.
    Ignored,
}

/// Facade over one device session. See the module docs.
pub struct Controller {
    config: ControllerConfig,
    session: Arc<Session>,
    router: Arc<Router>,
    dispatcher: CommandDispatcher,
    span: Span,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Self {
        Self::with_span(config, info_span!("controller"))
    }

    /// Create a controller whose tracing output is parented to `span`.
    pub fn with_span(config: ControllerConfig, span: Span) -> Self {
        let events = EventBus::new(config.event_capacity);
        let session = Arc::new(Session::with_span(&config, span.clone()));
        let router = Arc::new(Router {
            machine: Mutex::new(TestStateMachine::new()),
            events: events.clone(),
        });
        let dispatcher = CommandDispatcher::new(session.clone(), events, span.clone());

        Self {
            config,
            session,
            router,
            dispatcher,
            span,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Subscribe to every event published from now on. A receiver that falls
    /// more than `event_capacity` events behind skips ahead.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.router.events.subscribe()
    }

    /// Forward events to `sink` until it is dropped or the handle is stopped.
    pub fn attach_sink(&self, sink: Weak<dyn Sink>) -> SinkHandle {
        sink::spawn_forwarder(sink, self.router.events.attach(), &self.span)
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Connect to the device and send discovery.
    ///
    /// Connecting while already connected succeeds without dialing or
    /// sending anything. A failure is also published as
    /// [`DeviceEvent::ConnectError`]; the session stays unconnected and the
    /// call may be retried.
    pub async fn connect(&self, host: &str, port: u16) -> Result<Connection> {
        let handler: Arc<dyn DatagramHandler> = self.router.clone();
        let connection = match self.session.connect(host, port, handler).await {
            Ok(connection) => connection,
            Err(error) => {
                warn!(parent: &self.span, host, port, %error, "connect failed");
                self.router.publish(DeviceEvent::ConnectError {
                    reason: error.to_string(),
                });
                return Err(error.into());
            }
        };

        if connection.is_new() {
            self.router.apply(|machine| machine.connected()).await;
            self.dispatcher.dispatch(Command::Identify)?;
        }
        Ok(connection)
    }

    /// Re-send discovery on an open link.
    pub async fn identify(&self) -> Result<()> {
        if !self.session.is_connected().await {
            return Err(SessionError::NotConnected.into());
        }
        self.dispatcher.dispatch(Command::Identify)?;
        Ok(())
    }

    /// Start a test of `duration_secs` seconds.
    ///
    /// A zero duration is a validation error and nothing is sent. If a test
    /// is already starting or running, an "already started" notice is
    /// published and no command is sent.
    pub async fn start_test(&self, duration_secs: u32) -> Result<CommandStatus> {
        let duration_secs = validation::check_duration(i64::from(duration_secs))?;
        let rate_ms = self.config.sample_rate_ms;
        let decision = self
            .router
            .try_apply(|machine| machine.request_start(duration_secs, rate_ms))
            .await;
        self.finish_request(decision)
    }

    /// Stop the active test. Ignored with a notice when no test is active.
    pub async fn stop_test(&self) -> Result<CommandStatus> {
        let decision = self.router.try_apply(|machine| machine.request_stop()).await;
        self.finish_request(decision)
    }

    fn finish_request(
        &self,
        decision: std::result::Result<Option<Command>, Rejection>,
    ) -> Result<CommandStatus> {
        match decision {
            Ok(Some(command)) => {
                self.dispatcher.dispatch(command)?;
                Ok(CommandStatus::Dispatched)
            }
            Ok(None) => Ok(CommandStatus::Ignored),
            Err(Rejection::NotConnected) => Err(SessionError::NotConnected.into()),
            Err(rejection) => {
                debug!(parent: &self.span, ?rejection, "request ignored");
                if let Some(notice) = rejection.notice() {
                    self.router.publish(notice);
                }
                Ok(CommandStatus::Ignored)
            }
        }
    }

    /// Close the link and reset local state. Safe to call repeatedly.
    pub async fn disconnect(&self) -> bool {
        let released = self.session.disconnect().await;
        self.router.apply(|machine| machine.disconnected()).await;
        released
    }

    /// Release everything on application exit.
    pub async fn shutdown(&self) {
        info!(parent: &self.span, "controller shutting down");
        self.disconnect().await;
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn phase(&self) -> TestPhase {
        self.router.machine.lock().await.phase()
    }

    pub async fn controls(&self) -> Controls {
        self.router.machine.lock().await.controls()
    }

    pub async fn test_session(&self) -> Option<TestSession> {
        self.router.machine.lock().await.test()
    }

    pub async fn session_state(&self) -> SessionState {
        self.session.state().await
    }

    /// Feed one datagram through inbound routing as if it came from the
    /// device.
    pub async fn inject(&self, bytes: &[u8]) {
        self.router.on_datagram(bytes).await;
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Inbound routing
// ---------------------------------------------------------------------------

/// Shared between the controller and the receive loop.
struct Router {
    machine: Mutex<TestStateMachine>,
    events: EventBus,
}

impl Router {
    fn publish(&self, event: DeviceEvent) {
        self.events.publish(event);
    }

    fn publish_all(&self, events: Vec<DeviceEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    /// Run one transition under the lock and publish its events in order.
    async fn apply<F>(&self, transition: F)
    where
        F: FnOnce(&mut TestStateMachine) -> Transition,
    {
        let mut machine = self.machine.lock().await;
        self.publish_all(transition(&mut machine).events);
    }

    /// Like [`Router::apply`] for transitions that may be refused. Returns the
    /// command the accepted transition wants sent.
    async fn try_apply<F>(&self, transition: F) -> std::result::Result<Option<Command>, Rejection>
    where
        F: FnOnce(&mut TestStateMachine) -> std::result::Result<Transition, Rejection>,
    {
        let mut machine = self.machine.lock().await;
        let t = transition(&mut machine)?;
        self.publish_all(t.events);
        Ok(t.command)
    }

    async fn route(&self, frame: &Frame, raw: &str) {
        match frame.kind() {
            MessageKind::Id => self.handle_id(frame).await,
            MessageKind::Status => self.handle_status(frame, raw).await,
            MessageKind::Test => self.handle_test(frame, raw).await,
            MessageKind::Unknown => {
                warn!(raw, "unhandled message");
                self.publish(DeviceEvent::UnhandledMessage {
                    raw: raw.to_string(),
                });
            }
        }
    }

    async fn handle_id(&self, frame: &Frame) {
        match (frame.field(FIELD_MODEL), frame.field(FIELD_SERIAL)) {
            (Some(model), Some(serial)) => {
                info!(model, serial, "device identified");
                self.apply(|machine| machine.identified(model, serial)).await;
            }
            (model, serial) => {
                let missing: Vec<&str> = [(FIELD_MODEL, model), (FIELD_SERIAL, serial)]
                    .into_iter()
                    .filter(|(_, value)| value.is_none())
                    .map(|(name, _)| name)
                    .collect();
                warn!(?missing, "identification incomplete");
                self.publish(DeviceEvent::notice(
                    TITLE_ID_ERROR,
                    format!("ID message missing {}", missing.join(", ")),
                ));
            }
        }
    }

    async fn handle_status(&self, frame: &Frame, raw: &str) {
        let has_telemetry = [FIELD_TIME, FIELD_MILLIVOLTS, FIELD_MILLIAMPS]
            .iter()
            .any(|name| frame.has_field(name));

        if has_telemetry {
            self.handle_telemetry(frame).await;
        } else if let Some(state) = frame.field(FIELD_STATE) {
            if state == "IDLE" {
                self.apply(|machine| machine.device_idle()).await;
            } else {
                self.publish(DeviceEvent::notice(
                    TITLE_UNKNOWN_STATE,
                    format!("Unknown device state: {state}"),
                ));
            }
        } else {
            warn!(raw, "status without telemetry or state");
            self.publish(DeviceEvent::notice(TITLE_UNHANDLED_STATUS, raw));
        }
    }

    async fn handle_telemetry(&self, frame: &Frame) {
        let time = integer_field(frame, FIELD_TIME);
        let millivolts = integer_field(frame, FIELD_MILLIVOLTS);
        let milliamps = integer_field(frame, FIELD_MILLIAMPS);

        for error in [&time, &millivolts, &milliamps]
            .into_iter()
            .filter_map(|field| field.as_ref().err())
        {
            warn!(%error, "bad telemetry field");
            self.publish(DeviceEvent::notice(TITLE_STATUS_ERROR, error.to_string()));
        }

        let (Ok(time_ms), Ok(millivolts), Ok(milliamps)) = (time, millivolts, milliamps) else {
            return;
        };
        if time_ms == 0 || millivolts == 0 || milliamps == 0 {
            trace!(time_ms, millivolts, milliamps, "placeholder sample suppressed");
            return;
        }

        let sample = TelemetrySample {
            time_secs: time_ms as f64 / 1000.0,
            millivolts,
            milliamps,
        };
        let mut machine = self.machine.lock().await;
        machine.record_sample();
        self.publish(DeviceEvent::Sample(sample));
    }

    async fn handle_test(&self, frame: &Frame, raw: &str) {
        match frame.field(FIELD_RESULT) {
            Some(result) => {
                let message = frame.field(FIELD_MESSAGE);
                debug!(result, ?message, "test result");
                self.apply(|machine| machine.device_result(result, message)).await;
            }
            None => {
                warn!(raw, "test message without result");
                self.publish(DeviceEvent::UnhandledMessage {
                    raw: raw.to_string(),
                });
            }
        }
    }
}

fn integer_field(frame: &Frame, name: &'static str) -> std::result::Result<i64, FieldError> {
    let value = frame
        .field(name)
        .ok_or(FieldError::Missing { field: name })?;
    value.parse().map_err(|_| FieldError::Invalid {
        field: name,
        value: value.to_string(),
    })
}

#[async_trait]
impl DatagramHandler for Router {
    async fn on_datagram(&self, bytes: &[u8]) {
        let raw = protocol::from_latin1(bytes);
        let frame = protocol::decode_str(&raw);
        debug!(kind = %frame.kind(), raw = %raw, "frame received");
        self.route(&frame, &raw).await;
    }

    async fn on_connection_lost(&self, error: &io::Error) {
        warn!(%error, "connection lost");
        let mut machine = self.machine.lock().await;
        self.publish(DeviceEvent::ConnectionLost {
            reason: error.to_string(),
        });
        self.publish_all(machine.disconnected().events);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

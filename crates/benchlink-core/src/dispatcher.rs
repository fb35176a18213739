//! Fire-and-forget command submission.
//!
//! Commands are encoded on the caller's task, so an unsendable command is
//! rejected synchronously, and written on a freshly spawned task, so the
//! caller never waits on the socket. Two commands submitted back to back may
//! reach the wire in either order. There are no retries: a failed write is
//! logged and surfaced once as a notice.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, debug_span, warn, Instrument, Span};

use crate::event::{DeviceEvent, EventBus, TITLE_SEND_FAILED};
use crate::protocol::{Command, EncodingError};
use crate::session::Session;

/// A command that has already been rendered to wire bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    name: &'static str,
    bytes: Vec<u8>,
}

impl Outbound {
    pub fn new(command: Command) -> Result<Self, EncodingError> {
        Ok(Self {
            name: command.name(),
            bytes: command.encode()?,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Spawns one short-lived task per outbound command.
pub struct CommandDispatcher {
    session: Arc<Session>,
    events: EventBus,
    span: Span,
}

impl CommandDispatcher {
    pub fn new(session: Arc<Session>, events: EventBus, span: Span) -> Self {
        Self {
            session,
            events,
            span,
        }
    }

    /// Encode and submit `command`.
    pub fn dispatch(&self, command: Command) -> Result<JoinHandle<()>, EncodingError> {
        Ok(self.submit(Outbound::new(command)?))
    }

    /// Submit an already-encoded command. The returned handle may be ignored.
    pub fn submit(&self, outbound: Outbound) -> JoinHandle<()> {
        let session = self.session.clone();
        let events = self.events.clone();
        let span = debug_span!(parent: &self.span, "dispatch", command = outbound.name);

        tokio::spawn(
            async move {
                match session.send(&outbound.bytes).await {
                    Ok(len) => debug!(bytes = len, "command sent"),
                    Err(error) => {
                        warn!(%error, "command send failed");
                        events.publish(DeviceEvent::notice(TITLE_SEND_FAILED, error.to_string()));
                    }
                }
            }
            .instrument(span),
        )
    }
}

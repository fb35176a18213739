//! Test lifecycle state machine.
//!
//! [`TestStateMachine`] is a plain value: it performs no I/O and takes no
//! locks. The controller keeps it behind a single mutex and holds that mutex
//! only across one check-and-transition call, so two start requests can never
//! both observe `Idle`.
//!
//! ```text
//!  Disconnected --connect--> Idle --start--> Starting --RESULT=STARTED--> Running
//!                              ^                 |                          |
//!                              |                 +-----------stop-----------+
//!                              |                                            v
//!                              +--------RESULT=STOPPED---------------- Stopping
//!
//!  any connected phase --STATE=IDLE--> Idle (unconditional reset)
//!  any phase --disconnect / link lost--> Disconnected
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::event::{
    Controls, DeviceEvent, TITLE_ALREADY_STARTED, TITLE_DEVICE_ERROR, TITLE_NOT_RUNNING,
    TITLE_TEST_ENDED, TITLE_TEST_STOPPED, TITLE_UNKNOWN_RESULT,
};
use crate::protocol::Command;

/// Phase of the device test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestPhase {
    /// No socket.
    Disconnected,
    /// Connected, no test in flight.
    Idle,
    /// Start sent, waiting for the device to confirm.
    Starting,
    /// Device confirmed the test is running.
    Running,
    /// Stop sent, waiting for the device to confirm.
    Stopping,
}

impl TestPhase {
    /// A test counts as active while it is starting or running.
    pub fn is_active(self) -> bool {
        matches!(self, TestPhase::Starting | TestPhase::Running)
    }
}

impl fmt::Display for TestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TestPhase::Disconnected => "disconnected",
            TestPhase::Idle => "idle",
            TestPhase::Starting => "starting",
            TestPhase::Running => "running",
            TestPhase::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// The logical test run, created when a start request is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSession {
    pub duration_secs: u32,
    pub samples: u64,
}

/// Why a start or stop request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NotConnected,
    AlreadyStarted,
    NotRunning,
}

impl Rejection {
    /// The user-facing notice for this rejection, if any.
    ///
    /// `NotConnected` is returned to the caller as an error instead.
    pub fn notice(self) -> Option<DeviceEvent> {
        match self {
            Rejection::NotConnected => None,
            Rejection::AlreadyStarted => Some(DeviceEvent::notice(
                TITLE_ALREADY_STARTED,
                "Test has already started.",
            )),
            Rejection::NotRunning => Some(DeviceEvent::notice(
                TITLE_NOT_RUNNING,
                "There is no active test to stop.",
            )),
        }
    }
}

/// Events to publish and, optionally, a command to send after a transition.
#[derive(Debug, Default)]
pub struct Transition {
    pub events: Vec<DeviceEvent>,
    pub command: Option<Command>,
}

/// The test lifecycle and the UI affordances derived from it.
#[derive(Debug, Clone)]
pub struct TestStateMachine {
    phase: TestPhase,
    test: Option<TestSession>,
    controls: Controls,
}

impl Default for TestStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TestStateMachine {
    pub fn new() -> Self {
        Self {
            phase: TestPhase::Disconnected,
            test: None,
            controls: Controls::default(),
        }
    }

    pub fn phase(&self) -> TestPhase {
        self.phase
    }

    pub fn test(&self) -> Option<TestSession> {
        self.test
    }

    pub fn controls(&self) -> Controls {
        self.controls
    }

    // -----------------------------------------------------------------------
    // Local lifecycle
    // -----------------------------------------------------------------------

    /// The socket is open.
    pub fn connected(&mut self) -> Transition {
        let mut t = Transition::default();
        if self.phase == TestPhase::Disconnected {
            self.set_phase(TestPhase::Idle, &mut t);
        }
        t
    }

    /// The socket is gone, for whatever reason.
    pub fn disconnected(&mut self) -> Transition {
        let mut t = Transition::default();
        self.test = None;
        self.set_phase(TestPhase::Disconnected, &mut t);
        self.set_controls(Controls::default(), &mut t);
        t
    }

    /// Accept or refuse a start request.
    pub fn request_start(
        &mut self,
        duration_secs: u32,
        rate_ms: u32,
    ) -> Result<Transition, Rejection> {
        match self.phase {
            TestPhase::Disconnected => return Err(Rejection::NotConnected),
            TestPhase::Idle => {}
            _ => return Err(Rejection::AlreadyStarted),
        }

        let mut t = Transition::default();
        self.test = Some(TestSession {
            duration_secs,
            samples: 0,
        });
        t.events.push(DeviceEvent::BufferClear);
        self.set_phase(TestPhase::Starting, &mut t);
        self.set_controls(
            Controls {
                start: false,
                stop: true,
                ..self.controls
            },
            &mut t,
        );
        t.command = Some(Command::StartTest {
            duration_secs,
            rate_ms,
        });
        Ok(t)
    }

    /// Accept or refuse a stop request.
    pub fn request_stop(&mut self) -> Result<Transition, Rejection> {
        if self.phase == TestPhase::Disconnected {
            return Err(Rejection::NotConnected);
        }
        if !self.phase.is_active() {
            return Err(Rejection::NotRunning);
        }

        let mut t = Transition::default();
        self.set_phase(TestPhase::Stopping, &mut t);
        self.set_controls(
            Controls {
                save: true,
                ..self.controls
            },
            &mut t,
        );
        t.command = Some(Command::StopTest);
        Ok(t)
    }

    // -----------------------------------------------------------------------
    // Device reports
    // -----------------------------------------------------------------------

    /// The device answered discovery.
    pub fn identified(&mut self, model: &str, serial: &str) -> Transition {
        let mut t = Transition::default();
        t.events.push(DeviceEvent::Identified {
            model: model.to_string(),
            serial: serial.to_string(),
        });
        self.set_controls(
            Controls {
                connect: false,
                start: true,
                save: false,
                ..self.controls
            },
            &mut t,
        );
        t.events.push(DeviceEvent::BufferClear);
        t
    }

    /// Handle a `TEST;RESULT=...` report. Only `STARTED` and `STOPPED` move
    /// the phase; errors and unknown results are surfaced as notices.
    pub fn device_result(&mut self, result: &str, message: Option<&str>) -> Transition {
        let mut t = Transition::default();
        match result {
            "STARTED" => {
                if self.phase == TestPhase::Starting {
                    self.set_phase(TestPhase::Running, &mut t);
                } else {
                    debug!(phase = %self.phase, "start confirmation outside starting phase");
                }
            }
            "STOPPED" => {
                t.events.push(DeviceEvent::notice(
                    TITLE_TEST_STOPPED,
                    "The test has been stopped.",
                ));
                if matches!(
                    self.phase,
                    TestPhase::Starting | TestPhase::Running | TestPhase::Stopping
                ) {
                    self.set_phase(TestPhase::Idle, &mut t);
                    self.set_controls(
                        Controls {
                            start: true,
                            stop: false,
                            save: true,
                            ..self.controls
                        },
                        &mut t,
                    );
                }
            }
            error if error.eq_ignore_ascii_case("error") => {
                let text = match message {
                    Some(reason) => format!("Error: {error} reason: {reason}"),
                    None => format!("Error: {error} with no reason"),
                };
                t.events.push(DeviceEvent::notice(TITLE_DEVICE_ERROR, text));
            }
            other => {
                t.events.push(DeviceEvent::notice(
                    TITLE_UNKNOWN_RESULT,
                    format!("Unknown test result: {other}"),
                ));
            }
        }
        t
    }

    /// The device reported `STATE=IDLE`: the test is over no matter what the
    /// local phase claims.
    pub fn device_idle(&mut self) -> Transition {
        let mut t = Transition::default();
        t.events.push(DeviceEvent::notice(TITLE_TEST_ENDED, "STATE IS IDLE"));
        if let Some(test) = self.test.take() {
            info!(samples = test.samples, "test ended");
        }
        if self.phase == TestPhase::Disconnected {
            return t;
        }
        self.set_phase(TestPhase::Idle, &mut t);
        self.set_controls(
            Controls {
                connect: true,
                start: true,
                stop: false,
                save: true,
            },
            &mut t,
        );
        t
    }

    /// Count a sample against the current test, if any.
    pub fn record_sample(&mut self) {
        if let Some(test) = self.test.as_mut() {
            test.samples += 1;
        }
    }

    fn set_phase(&mut self, phase: TestPhase, t: &mut Transition) {
        if self.phase != phase {
            info!(from = %self.phase, to = %phase, "test phase changed");
            self.phase = phase;
            t.events.push(DeviceEvent::TestStateChanged { phase });
        }
    }

    fn set_controls(&mut self, controls: Controls, t: &mut Transition) {
        if self.controls != controls {
            self.controls = controls;
            t.events.push(DeviceEvent::ControlsChanged(controls));
        }
    }
}

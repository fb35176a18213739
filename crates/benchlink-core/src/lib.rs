//! # benchlink-core
//!
//! Host-side controller for a measurement device that speaks a small
//! semicolon-delimited text protocol over UDP.
//!
//! The controller discovers the device, starts and stops timed tests, and
//! turns the device's telemetry stream into typed events for a UI or other
//! collaborator.
//!
//! ## Modules
//!
//! - [`protocol`] - Frame codec for the `KIND;KEY=VALUE;` wire format
//! - [`session`] - UDP link ownership and the background receive loop
//! - [`state`] - Test lifecycle state machine
//! - [`dispatcher`] - Fire-and-forget command submission
//! - [`controller`] - Facade and inbound frame routing
//! - [`event`] - Events published to collaborators
//! - [`sink`] - Callback-style consumer interface
//! - [`validation`] - Parsing of user-entered connection and test parameters
//! - [`config`] - Persistent tuning in `~/.benchlink/config.json`
//! - [`simulator`] - In-process device emulation
//!
//! ## Example
//!
//! ```no_run
//! use benchlink_core::config::ControllerConfig;
//! use benchlink_core::controller::Controller;
//!
//! # async fn demo() -> benchlink_core::Result<()> {
//! let controller = Controller::new(ControllerConfig::load());
//! controller.connect("192.168.1.50", 8888).await?;
//! controller.start_test(10).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod protocol;
pub mod session;
pub mod simulator;
pub mod sink;
pub mod state;
pub mod validation;

pub use error::{ControllerError, Result};

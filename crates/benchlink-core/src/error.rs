//! Error types surfaced by the controller facade.
//!
//! Each layer owns its error enum ([`SessionError`], [`EncodingError`],
//! [`ValidationError`]); [`ControllerError`] unifies them for callers of
//! [`Controller`](crate::controller::Controller). Protocol anomalies on the
//! receive path never become `Err` values: they are turned into
//! notifications and the session keeps running.

use thiserror::Error;

use crate::protocol::EncodingError;
use crate::session::SessionError;
use crate::validation::ValidationError;

/// Result type alias for controller operations.
pub type Result<T, E = ControllerError> = std::result::Result<T, E>;

/// Errors returned by the controller API.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// Socket setup, resolution, or I/O failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A command could not be rendered as wire bytes.
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    /// A caller-supplied parameter was rejected before any wire traffic.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl ControllerError {
    /// Returns `true` if the failure was a missing connection.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, ControllerError::Session(SessionError::NotConnected))
    }
}

/// A single telemetry field that could not be used.
///
/// Field errors are reported one by one and never abort processing of the
/// remaining fields of a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("{field} missing from status message")]
    Missing { field: &'static str },

    #[error("invalid {field} value: {value:?}")]
    Invalid { field: &'static str, value: String },
}

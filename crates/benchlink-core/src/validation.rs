//! Parsing of user-supplied connection and test parameters.
//!
//! These helpers turn raw text (as typed into a form or passed on a command
//! line) into typed values before anything reaches the network. Input is
//! trimmed of surrounding whitespace and read as base-10.

use std::net::Ipv4Addr;
use std::num::IntErrorKind;

use thiserror::Error;

/// Errors produced when a user-supplied parameter is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{what} is empty")]
    Empty { what: &'static str },

    #[error("{what} is not an integer: {value:?}")]
    NotAnInteger { what: &'static str, value: String },

    #[error("{what} out of range: {value}")]
    OutOfRange { what: &'static str, value: String },

    #[error("malformed IPv4 address: {value:?}")]
    MalformedIp { value: String },
}

/// Parse a dotted-quad IPv4 address whose octets are each in `0..=255`.
pub fn parse_ip(raw: &str) -> Result<Ipv4Addr, ValidationError> {
    let malformed = || ValidationError::MalformedIp {
        value: raw.to_string(),
    };

    let parts: Vec<&str> = raw.trim().split('.').collect();
    if parts.len() != 4 {
        return Err(malformed());
    }

    let mut octets = [0u8; 4];
    for (octet, part) in octets.iter_mut().zip(parts) {
        let value = parse_integer("octet", part).map_err(|_| malformed())?;
        *octet = u8::try_from(value).map_err(|_| malformed())?;
    }

    Ok(Ipv4Addr::from(octets))
}

/// Parse a port number in `0..=65535`.
pub fn parse_port(raw: &str) -> Result<u16, ValidationError> {
    let value = parse_integer("port", raw)?;
    u16::try_from(value).map_err(|_| ValidationError::OutOfRange {
        what: "port",
        value: value.to_string(),
    })
}

/// Parse a positive test duration in seconds.
pub fn parse_duration(raw: &str) -> Result<u32, ValidationError> {
    let value = parse_integer("duration", raw)?;
    check_duration(value)
}

/// Check that an already-numeric duration is positive and fits the wire field.
pub fn check_duration(value: i64) -> Result<u32, ValidationError> {
    match u32::try_from(value) {
        Ok(secs) if secs > 0 => Ok(secs),
        _ => Err(ValidationError::OutOfRange {
            what: "duration",
            value: value.to_string(),
        }),
    }
}

fn parse_integer(what: &'static str, raw: &str) -> Result<i64, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty { what });
    }

    trimmed.parse::<i64>().map_err(|e| match e.kind() {
        IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => ValidationError::OutOfRange {
            what,
            value: trimmed.to_string(),
        },
        _ => ValidationError::NotAnInteger {
            what,
            value: trimmed.to_string(),
        },
    })
}

//! Text wire protocol spoken with the measurement device.
//!
//! Every datagram carries exactly one message rendered in ISO-8859-1:
//!
//! ```text
//! KIND;KEY=VALUE;KEY=VALUE;
//! ```
//!
//! The first non-empty `;`-separated token names the message kind. Each
//! following token that contains exactly one `=` is a field; anything else is
//! a bare marker and is skipped. There is no length prefix, checksum, or
//! request id, so decoding is deliberately lenient: garbage never produces an
//! error, it produces a [`Frame`] of kind [`MessageKind::Unknown`].
//!
//! # Example
//!
//! ```
//! use benchlink_core::protocol::{decode, Command, MessageKind};
//!
//! let wire = Command::StartTest { duration_secs: 10, rate_ms: 1000 }.encode().unwrap();
//! assert_eq!(wire, b"TEST;CMD=START;DURATION=10;RATE=1000;");
//!
//! let frame = decode(b"STATUS;TIME=5000;MV=120;MA=30;");
//! assert_eq!(frame.kind(), MessageKind::Status);
//! assert_eq!(frame.field("MV"), Some("120"));
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Separates tokens inside a frame and terminates the frame.
pub const TOKEN_DELIMITER: char = ';';

/// Separates a field name from its value.
pub const FIELD_SEPARATOR: char = '=';

/// Sample interval requested from the device when none is configured.
pub const DEFAULT_RATE_MS: u32 = 1000;

pub const FIELD_MODEL: &str = "MODEL";
pub const FIELD_SERIAL: &str = "SERIAL";
pub const FIELD_TIME: &str = "TIME";
pub const FIELD_MILLIVOLTS: &str = "MV";
pub const FIELD_MILLIAMPS: &str = "MA";
pub const FIELD_STATE: &str = "STATE";
pub const FIELD_RESULT: &str = "RESULT";
pub const FIELD_MESSAGE: &str = "MSG";
pub const FIELD_COMMAND: &str = "CMD";
pub const FIELD_DURATION: &str = "DURATION";
pub const FIELD_RATE: &str = "RATE";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while rendering an outbound frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// A character has no ISO-8859-1 representation.
    #[error("character {ch:?} at position {position} is not representable in ISO-8859-1")]
    Unrepresentable { ch: char, position: usize },

    /// A command name or key is empty, or a token contains a frame delimiter.
    #[error("invalid frame token {token:?}")]
    InvalidToken { token: String },
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// The message kinds understood by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Identification reply (`ID;MODEL=..;SERIAL=..;`).
    Id,
    /// Telemetry or device state (`STATUS;...`).
    Status,
    /// Test command or result (`TEST;...`).
    Test,
    /// Anything that could not be classified.
    Unknown,
}

impl MessageKind {
    /// Classify the leading token of a frame.
    pub fn from_token(token: &str) -> Self {
        match token {
            "ID" => MessageKind::Id,
            "STATUS" => MessageKind::Status,
            "TEST" => MessageKind::Test,
            _ => MessageKind::Unknown,
        }
    }

    /// The wire spelling of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Id => "ID",
            MessageKind::Status => "STATUS",
            MessageKind::Test => "TEST",
            MessageKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded protocol message.
///
/// Frames are immutable value objects. A frame of kind
/// [`MessageKind::Unknown`] never carries fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: MessageKind,
    fields: BTreeMap<String, String>,
}

impl Frame {
    /// Build a frame from parts. Fields are dropped for `Unknown` frames.
    pub fn new(kind: MessageKind, fields: BTreeMap<String, String>) -> Self {
        match kind {
            MessageKind::Unknown => Self::unknown(),
            _ => Self { kind, fields },
        }
    }

    /// The frame produced for unparseable input.
    pub fn unknown() -> Self {
        Self {
            kind: MessageKind::Unknown,
            fields: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Look up a field value by name.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    pub fn is_unknown(&self) -> bool {
        self.kind == MessageKind::Unknown
    }
}

// ---------------------------------------------------------------------------
// Outbound commands
// ---------------------------------------------------------------------------

/// A command the controller can send to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Discovery request (`ID;`).
    Identify,
    /// Start a test run.
    StartTest { duration_secs: u32, rate_ms: u32 },
    /// Stop the running test.
    StopTest,
}

impl Command {
    /// Returns a short, static name for this command suitable for tracing
    /// span metadata.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Identify => "identify",
            Command::StartTest { .. } => "start_test",
            Command::StopTest => "stop_test",
        }
    }

    /// Render this command as wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, EncodingError> {
        match self {
            Command::Identify => encode(MessageKind::Id.as_str(), &[]),
            Command::StartTest {
                duration_secs,
                rate_ms,
            } => {
                let duration = duration_secs.to_string();
                let rate = rate_ms.to_string();
                encode(
                    MessageKind::Test.as_str(),
                    &[
                        (FIELD_COMMAND, "START"),
                        (FIELD_DURATION, &duration),
                        (FIELD_RATE, &rate),
                    ],
                )
            }
            Command::StopTest => encode(MessageKind::Test.as_str(), &[(FIELD_COMMAND, "STOP")]),
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Render `command` followed by `;key=value` pairs, terminated by `;`.
///
/// Fails if any character falls outside ISO-8859-1, if the command or a key
/// is empty, or if a token would contain a delimiter and therefore not
/// survive decoding.
pub fn encode(command: &str, fields: &[(&str, &str)]) -> Result<Vec<u8>, EncodingError> {
    check_name(command)?;

    let mut text = String::with_capacity(command.len() + 1 + fields.len() * 16);
    text.push_str(command);
    text.push(TOKEN_DELIMITER);

    for (key, value) in fields {
        check_name(key)?;
        if value.contains([TOKEN_DELIMITER, FIELD_SEPARATOR]) {
            return Err(EncodingError::InvalidToken {
                token: (*value).to_string(),
            });
        }
        text.push_str(key);
        text.push(FIELD_SEPARATOR);
        text.push_str(value);
        text.push(TOKEN_DELIMITER);
    }

    to_latin1(&text)
}

fn check_name(name: &str) -> Result<(), EncodingError> {
    if name.is_empty() || name.contains([TOKEN_DELIMITER, FIELD_SEPARATOR]) {
        return Err(EncodingError::InvalidToken {
            token: name.to_string(),
        });
    }
    Ok(())
}

/// Convert text to ISO-8859-1 bytes.
pub fn to_latin1(text: &str) -> Result<Vec<u8>, EncodingError> {
    text.chars()
        .enumerate()
        .map(|(position, ch)| {
            u8::try_from(ch).map_err(|_| EncodingError::Unrepresentable { ch, position })
        })
        .collect()
}

/// Interpret bytes as ISO-8859-1. Every byte maps to exactly one char.
pub fn from_latin1(bytes: &[u8]) -> String {
    bytes.iter().copied().map(char::from).collect()
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode one datagram. Never fails; see the module docs.
pub fn decode(bytes: &[u8]) -> Frame {
    decode_str(&from_latin1(bytes))
}

/// Decode already-converted frame text.
pub fn decode_str(text: &str) -> Frame {
    let mut tokens = text.split(TOKEN_DELIMITER).filter(|token| !token.is_empty());

    let kind = match tokens.next() {
        Some(head) => MessageKind::from_token(head),
        None => return Frame::unknown(),
    };
    if kind == MessageKind::Unknown {
        return Frame::unknown();
    }

    let mut fields = BTreeMap::new();
    for token in tokens {
        // Last occurrence of a key wins.
        if let Some((key, value)) = split_field(token) {
            fields.insert(key.to_string(), value.to_string());
        }
    }

    Frame { kind, fields }
}

fn split_field(token: &str) -> Option<(&str, &str)> {
    let (key, value) = token.split_once(FIELD_SEPARATOR)?;
    if key.is_empty() || value.contains(FIELD_SEPARATOR) {
        return None;
    }
    Some((key, value))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

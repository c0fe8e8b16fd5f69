/*!
 * Frame codec for the stand's ASCII command protocol.
 *
 * A request is `DDCCC[payload]`: a two-digit device group, a three-digit
 * command id and an optional signed decimal payload. The stand answers with
 * the same five-character prefix followed by its own payload. The line
 * terminator is handled by the transport, not here.
 */
use std::fmt;

use thiserror::Error;

/// Width of the echoed `DDCCC` prefix
pub const PREFIX_LEN: usize = 5;

/// Errors raised while decoding an answer frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The answer does not echo the device group and command that were sent
    #[error("Unexpected answer {answer:?} (expected echo {expected})")]
    UnexpectedAnswer {
        /// The prefix that was sent
        expected: String,
        /// The raw answer received
        answer: String,
    },

    /// The payload is not the decimal integer the command returns
    #[error("Invalid payload {payload:?}: not an integer")]
    InvalidPayload {
        /// The payload received
        payload: String,
    },
}

/// A two-digit device group id (0..=99)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceGroup(u8);

impl DeviceGroup {
    /// The "general microscope" group used by stand-level commands
    pub const GENERAL_MICROSCOPE: DeviceGroup = DeviceGroup::new(50);

    /// Create a device group id, panicking (at compile time in const context) when out of range
    pub const fn new(id: u8) -> Self {
        assert!(id <= 99, "device group id must fit in two digits");
        Self(id)
    }

    /// Create a device group id from a runtime value
    pub fn try_new(id: u8) -> Option<Self> {
        (id <= 99).then_some(Self(id))
    }

    /// Numeric value
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for DeviceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

/// A three-digit command id (0..=999)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(u16);

impl CommandId {
    /// Create a command id, panicking (at compile time in const context) when out of range
    pub const fn new(id: u16) -> Self {
        assert!(id <= 999, "command id must fit in three digits");
        Self(id)
    }

    /// Create a command id from a runtime value
    pub fn try_new(id: u16) -> Option<Self> {
        (id <= 999).then_some(Self(id))
    }

    /// Numeric value
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

/// The decoded payload of an answer frame
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload(String);

impl Payload {
    /// Payload text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the stand sent only the echo
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Take the payload text
    pub fn into_string(self) -> String {
        self.0
    }

    /// Parse the payload as a signed decimal integer
    pub fn parse_int(&self) -> Result<i32, ProtocolError> {
        self.0.trim().parse().map_err(|_| ProtocolError::InvalidPayload {
            payload: self.0.clone(),
        })
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Encode a query frame (no payload)
pub fn encode_query(device: DeviceGroup, command: CommandId) -> String {
    format!("{}{}", device, command)
}

/// Encode an action frame with an optional signed payload
pub fn encode_action(device: DeviceGroup, command: CommandId, data: Option<i32>) -> String {
    match data {
        Some(value) => format!("{}{}{}", device, command, value),
        None => encode_query(device, command),
    }
}

/// Validate an answer frame against the ids that were sent and extract its payload
pub fn decode_response(
    raw: &str,
    device: DeviceGroup,
    command: CommandId,
) -> Result<Payload, ProtocolError> {
    let unexpected = || ProtocolError::UnexpectedAnswer {
        expected: encode_query(device, command),
        answer: raw.to_string(),
    };

    let echoed_device = raw.get(0..2).and_then(parse_echo).ok_or_else(unexpected)?;
    let echoed_command = raw.get(2..PREFIX_LEN).and_then(parse_echo).ok_or_else(unexpected)?;

    if echoed_device != u16::from(device.get()) || echoed_command != command.get() {
        return Err(unexpected());
    }

    Ok(Payload(raw[PREFIX_LEN..].to_string()))
}

fn parse_echo(field: &str) -> Option<u16> {
    if field.bytes().all(|b| b.is_ascii_digit()) {
        field.parse().ok()
    } else {
        None
    }
}

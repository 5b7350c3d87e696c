//! Request/response unit handed to the transport
//!
//! A [`Message`] only lives for one `process_msg` call. Input bytes are
//! borrowed read-only; the output slice is the caller's reply buffer and its
//! length is the reply capacity.

use crate::{Result, ScmiError};

/// Well-known SCMI protocol identifiers
///
/// Command encodings for these protocols live in the protocol drivers, not
/// in the transport.
pub struct ProtocolId;

impl ProtocolId {
    pub const BASE: u8 = 0x10;
    pub const POWER_DOMAIN: u8 = 0x11;
    pub const SYSTEM: u8 = 0x12;
    pub const PERF: u8 = 0x13;
    pub const CLOCK: u8 = 0x14;
    pub const SENSOR: u8 = 0x15;
    pub const RESET_DOMAIN: u8 = 0x16;
    pub const VOLTAGE_DOMAIN: u8 = 0x17;
}

/// Status word that opens every SCMI reply payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScmiStatus {
    Success,
    NotSupported,
    InvalidParameters,
    Denied,
    NotFound,
    OutOfRange,
    Busy,
    CommsError,
    GenericError,
    HardwareError,
    ProtocolError,
    Unknown(i32),
}

impl ScmiStatus {
    /// Decode the signed status word
    pub fn from_word(word: i32) -> Self {
        match word {
            0 => ScmiStatus::Success,
            -1 => ScmiStatus::NotSupported,
            -2 => ScmiStatus::InvalidParameters,
            -3 => ScmiStatus::Denied,
            -4 => ScmiStatus::NotFound,
            -5 => ScmiStatus::OutOfRange,
            -6 => ScmiStatus::Busy,
            -7 => ScmiStatus::CommsError,
            -8 => ScmiStatus::GenericError,
            -9 => ScmiStatus::HardwareError,
            -10 => ScmiStatus::ProtocolError,
            other => ScmiStatus::Unknown(other),
        }
    }

    /// Encode back into the signed status word
    pub fn to_word(self) -> i32 {
        match self {
            ScmiStatus::Success => 0,
            ScmiStatus::NotSupported => -1,
            ScmiStatus::InvalidParameters => -2,
            ScmiStatus::Denied => -3,
            ScmiStatus::NotFound => -4,
            ScmiStatus::OutOfRange => -5,
            ScmiStatus::Busy => -6,
            ScmiStatus::CommsError => -7,
            ScmiStatus::GenericError => -8,
            ScmiStatus::HardwareError => -9,
            ScmiStatus::ProtocolError => -10,
            ScmiStatus::Unknown(word) => word,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ScmiStatus::Success)
    }
}

/// One SCMI transaction: request payload in, reply payload out
#[derive(Debug)]
pub struct Message<'a> {
    /// Protocol the command belongs to
    pub protocol_id: u8,

    /// Command within the protocol
    pub message_id: u8,

    /// Request payload (without header)
    pub input: &'a [u8],

    /// Reply buffer; its length is the reply capacity
    pub output: &'a mut [u8],

    /// Bytes of `output` filled by the last reply
    output_len: usize,
}

impl<'a> Message<'a> {
    /// Create a message
    ///
    /// # Arguments
    /// * `protocol_id` - SCMI protocol (see [`ProtocolId`])
    /// * `message_id` - Command within the protocol
    /// * `input` - Request payload
    /// * `output` - Reply buffer, sized for the largest expected reply
    pub fn new(protocol_id: u8, message_id: u8, input: &'a [u8], output: &'a mut [u8]) -> Self {
        Self {
            protocol_id,
            message_id,
            input,
            output,
            output_len: 0,
        }
    }

    /// Reply capacity in bytes
    pub fn output_capacity(&self) -> usize {
        self.output.len()
    }

    /// Number of reply bytes returned by the platform
    pub fn output_len(&self) -> usize {
        self.output_len
    }

    /// The reply payload
    pub fn response(&self) -> &[u8] {
        &self.output[..self.output_len]
    }

    pub(crate) fn set_output_len(&mut self, len: usize) {
        debug_assert!(len <= self.output.len());
        self.output_len = len;
    }

    /// Read the SCMI status word at the start of the reply
    ///
    /// # Errors
    /// Returns `Protocol` if the reply is shorter than a status word
    pub fn status(&self) -> Result<ScmiStatus> {
        let word: [u8; 4] = self
            .response()
            .get(..4)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(ScmiError::Protocol)?;

        Ok(ScmiStatus::from_word(i32::from_le_bytes(word)))
    }

    /// Fail unless the reply status is `Success`
    ///
    /// # Errors
    /// Returns `Remote(status)` for any other status, `Protocol` for a
    /// truncated reply
    pub fn check_status(&self) -> Result<()> {
        match self.status()? {
            ScmiStatus::Success => Ok(()),
            status => Err(ScmiError::Remote(status)),
        }
    }
}

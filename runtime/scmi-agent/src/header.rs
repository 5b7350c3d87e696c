//! SCMI message header packing
//!
//! The 32-bit message header precedes every payload, in both SMT and MSG
//! framing:
//!
//! ```text
//!  31        18 17        10 9    8 7          0
//! +------------+------------+------+------------+
//! |   token    | protocol   | type | message id |
//! +------------+------------+------+------------+
//! ```
//!
//! Packing works on plain integers and `[u8; 4]` arrays only; the shared
//! memory layer decides where those bytes land.

use static_assertions::const_assert_eq;

/// Size of the packed header on the wire
pub const HEADER_SIZE: usize = 4;

const MESSAGE_ID_MASK: u32 = 0xFF;
const MESSAGE_TYPE_SHIFT: u32 = 8;
const MESSAGE_TYPE_MASK: u32 = 0x3 << MESSAGE_TYPE_SHIFT;
const PROTOCOL_ID_SHIFT: u32 = 10;
const PROTOCOL_ID_MASK: u32 = 0xFF << PROTOCOL_ID_SHIFT;
const TOKEN_SHIFT: u32 = 18;
const TOKEN_MASK: u32 = 0x3FFF << TOKEN_SHIFT;

/// Largest token the header can carry
pub const MAX_TOKEN: u16 = 0x3FFF;

// The four fields tile the word exactly once
const_assert_eq!(
    MESSAGE_ID_MASK | MESSAGE_TYPE_MASK | PROTOCOL_ID_MASK | TOKEN_MASK,
    u32::MAX
);
const_assert_eq!(
    MESSAGE_ID_MASK & MESSAGE_TYPE_MASK & PROTOCOL_ID_MASK & TOKEN_MASK,
    0
);

/// Message type field (bits [9:8])
///
/// The agent only ever sends commands; the other values are decoded so a
/// malformed or unexpected reply header can be reported instead of misread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Command = 0,
    DelayedResponse = 2,
    Notification = 3,
}

impl MessageType {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(MessageType::Command),
            2 => Some(MessageType::DelayedResponse),
            3 => Some(MessageType::Notification),
            _ => None,
        }
    }
}

/// Unpacked SCMI message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_id: u8,
    pub message_type: MessageType,
    pub protocol_id: u8,
    pub token: u16,
}

impl MessageHeader {
    /// Header for a synchronous command with token 0
    pub const fn command(protocol_id: u8, message_id: u8) -> Self {
        Self {
            message_id,
            message_type: MessageType::Command,
            protocol_id,
            token: 0,
        }
    }

    /// Pack into the 32-bit header word
    ///
    /// Tokens wider than 14 bits are truncated to the field width.
    pub const fn pack(&self) -> u32 {
        (((self.token as u32) << TOKEN_SHIFT) & TOKEN_MASK)
            | (((self.protocol_id as u32) << PROTOCOL_ID_SHIFT) & PROTOCOL_ID_MASK)
            | (((self.message_type as u32) << MESSAGE_TYPE_SHIFT) & MESSAGE_TYPE_MASK)
            | (self.message_id as u32 & MESSAGE_ID_MASK)
    }

    /// Unpack a header word
    ///
    /// # Returns
    /// `None` if the message type field holds the reserved value 1
    pub fn unpack(word: u32) -> Option<Self> {
        let message_type =
            MessageType::from_bits(((word & MESSAGE_TYPE_MASK) >> MESSAGE_TYPE_SHIFT) as u8)?;

        Some(Self {
            message_id: (word & MESSAGE_ID_MASK) as u8,
            message_type,
            protocol_id: ((word & PROTOCOL_ID_MASK) >> PROTOCOL_ID_SHIFT) as u8,
            token: ((word & TOKEN_MASK) >> TOKEN_SHIFT) as u16,
        })
    }

    /// Little-endian wire bytes
    pub const fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        self.pack().to_le_bytes()
    }

    /// Parse little-endian wire bytes
    pub fn from_bytes(bytes: [u8; HEADER_SIZE]) -> Option<Self> {
        Self::unpack(u32::from_le_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_header_layout() {
        let header = MessageHeader::command(0x10, 0x03);
        let word = header.pack();

        assert_eq!((word >> 10) & 0xFF, 0x10);
        assert_eq!(word & 0xFF, 0x03);
        assert_eq!((word >> 8) & 0x3, 0);
        assert_eq!(word >> 18, 0);
        assert_eq!(word, 0x0000_4003);
    }

    #[test]
    fn test_fields_do_not_overlap() {
        let header = MessageHeader {
            message_id: 0xFF,
            message_type: MessageType::Notification,
            protocol_id: 0xFF,
            token: MAX_TOKEN,
        };
        assert_eq!(header.pack(), u32::MAX);

        let only_type = MessageHeader {
            message_id: 0,
            message_type: MessageType::DelayedResponse,
            protocol_id: 0,
            token: 0,
        };
        assert_eq!(only_type.pack(), 0x200);
    }

    #[test]
    fn test_token_truncated_to_field() {
        let header = MessageHeader {
            token: 0xFFFF,
            ..MessageHeader::command(0, 0)
        };
        assert_eq!(header.pack() >> 18, MAX_TOKEN as u32);
    }

    #[test]
    fn test_unpack_recovers_fields() {
        let header = MessageHeader {
            message_id: 0x07,
            message_type: MessageType::DelayedResponse,
            protocol_id: 0x14,
            token: 0x155,
        };
        assert_eq!(MessageHeader::unpack(header.pack()), Some(header));
    }

    #[test]
    fn test_unpack_rejects_reserved_type() {
        assert_eq!(MessageHeader::unpack(0x100), None);
    }

    #[test]
    fn test_wire_bytes_little_endian() {
        let bytes = MessageHeader::command(0x14, 0x06).to_bytes();
        assert_eq!(bytes, [0x06, 0x50, 0x00, 0x00]);
        assert_eq!(
            MessageHeader::from_bytes(bytes),
            Some(MessageHeader::command(0x14, 0x06))
        );
    }
}

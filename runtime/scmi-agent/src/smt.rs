//! Shared Memory Transport (SMT) - channel framing and turn-taking
//!
//! # Wire Layout
//! ```text
//! offset  size  field
//!  0      4     reserved
//!  4      4     channel_status   bit 0 FREE, bit 1 ERROR
//!  8      8     reserved
//! 16      4     flags            bit 0 interrupt on completion
//! 20      4     length           payload bytes + 4 (msg_header)
//! 24      4     msg_header
//! 28      ..    payload
//! ```
//! All fields are little-endian. The layout is bit-exact with the platform
//! firmware and must not change unilaterally.
//!
//! # Turn-taking
//! The agent may write while FREE is set; clearing FREE hands the buffer to
//! the platform, which sets FREE again once its reply is in place. The
//! protocol only checks this, it never locks: writing while FREE is clear
//! fails with `Busy` and leaves the buffer untouched.

use alloc::sync::Arc;
use core::sync::atomic::{fence, Ordering};

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::header::{MessageHeader, HEADER_SIZE};
use crate::message::Message;
use crate::shmem::SharedMemory;
use crate::{Result, ScmiError};

const RESERVED0_OFFSET: usize = 0;
const CHANNEL_STATUS_OFFSET: usize = 4;
const RESERVED1_OFFSET: usize = 8;
const FLAGS_OFFSET: usize = 16;
const LENGTH_OFFSET: usize = 20;
const MSG_HEADER_OFFSET: usize = 24;

/// Bytes preceding the payload
pub const SMT_HEADER_SIZE: usize = 28;

/// Offset of the first payload byte
pub const PAYLOAD_OFFSET: usize = SMT_HEADER_SIZE;

/// Bytes of the region that `length` never covers
pub const LENGTH_BASE: usize = MSG_HEADER_OFFSET;

const_assert_eq!(RESERVED0_OFFSET + 4, CHANNEL_STATUS_OFFSET);
const_assert_eq!(CHANNEL_STATUS_OFFSET + 4, RESERVED1_OFFSET);
const_assert_eq!(RESERVED1_OFFSET + 8, FLAGS_OFFSET);
const_assert_eq!(FLAGS_OFFSET + 4, LENGTH_OFFSET);
const_assert_eq!(LENGTH_OFFSET + 4, MSG_HEADER_OFFSET);
const_assert_eq!(MSG_HEADER_OFFSET + HEADER_SIZE, SMT_HEADER_SIZE);

bitflags! {
    /// `channel_status` bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelStatus: u32 {
        /// No transaction in flight; a reply, if any, is ready
        const FREE  = 1 << 0;

        /// The platform rejected the last request
        const ERROR = 1 << 1;
    }
}

bitflags! {
    /// `flags` bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SmtFlags: u32 {
        /// Raise a completion interrupt instead of being polled
        const INTR_ENABLED = 1 << 0;
    }
}

/// Channel state derived from `channel_status`
///
/// FREE clear means the platform owns the buffer regardless of ERROR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Agent owns the buffer, no error pending
    Idle,
    /// Platform owns the buffer
    RequestPending,
    /// Agent owns the buffer, platform flagged the last request
    Error,
}

impl ChannelState {
    pub fn from_status(status: ChannelStatus) -> Self {
        if !status.contains(ChannelStatus::FREE) {
            ChannelState::RequestPending
        } else if status.contains(ChannelStatus::ERROR) {
            ChannelState::Error
        } else {
            ChannelState::Idle
        }
    }
}

/// The fixed SMT header as plain values
///
/// Reserved words are carried through unchanged so a rewrite never disturbs
/// bits the platform may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmtHeader {
    pub reserved0: u32,
    pub channel_status: u32,
    pub reserved1: u64,
    pub flags: u32,
    pub length: u32,
    pub msg_header: u32,
}

impl SmtHeader {
    /// Parse the first [`SMT_HEADER_SIZE`] bytes of a region
    pub fn from_bytes(bytes: &[u8; SMT_HEADER_SIZE]) -> Self {
        let word = |offset: usize| {
            u32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ])
        };

        Self {
            reserved0: word(RESERVED0_OFFSET),
            channel_status: word(CHANNEL_STATUS_OFFSET),
            reserved1: (word(RESERVED1_OFFSET) as u64) | ((word(RESERVED1_OFFSET + 4) as u64) << 32),
            flags: word(FLAGS_OFFSET),
            length: word(LENGTH_OFFSET),
            msg_header: word(MSG_HEADER_OFFSET),
        }
    }

    /// Serialize into wire order
    pub fn to_bytes(&self) -> [u8; SMT_HEADER_SIZE] {
        let mut bytes = [0u8; SMT_HEADER_SIZE];
        bytes[RESERVED0_OFFSET..RESERVED0_OFFSET + 4].copy_from_slice(&self.reserved0.to_le_bytes());
        bytes[CHANNEL_STATUS_OFFSET..CHANNEL_STATUS_OFFSET + 4]
            .copy_from_slice(&self.channel_status.to_le_bytes());
        bytes[RESERVED1_OFFSET..RESERVED1_OFFSET + 8].copy_from_slice(&self.reserved1.to_le_bytes());
        bytes[FLAGS_OFFSET..FLAGS_OFFSET + 4].copy_from_slice(&self.flags.to_le_bytes());
        bytes[LENGTH_OFFSET..LENGTH_OFFSET + 4].copy_from_slice(&self.length.to_le_bytes());
        bytes[MSG_HEADER_OFFSET..MSG_HEADER_OFFSET + 4].copy_from_slice(&self.msg_header.to_le_bytes());
        bytes
    }

    /// Known status bits; unknown bits are dropped
    pub fn status(&self) -> ChannelStatus {
        ChannelStatus::from_bits_truncate(self.channel_status)
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_status(self.status())
    }
}

/// SMT framing over one shared region
#[derive(Clone)]
pub struct Smt {
    region: Arc<dyn SharedMemory>,
}

impl core::fmt::Debug for Smt {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Smt")
            .field("bus_address", &self.region.bus_address())
            .field("size", &self.region.size())
            .finish()
    }
}

impl Smt {
    /// Wrap a mapped region; the region is not modified
    pub fn new(region: Arc<dyn SharedMemory>) -> Self {
        Self { region }
    }

    /// Address handed to the platform with a doorbell
    pub fn bus_address(&self) -> usize {
        self.region.bus_address()
    }

    /// Total region size
    pub fn size(&self) -> usize {
        self.region.size()
    }

    /// Largest request or reply payload the region can carry
    pub fn max_payload(&self) -> usize {
        self.size().saturating_sub(SMT_HEADER_SIZE)
    }

    /// Current channel state
    ///
    /// A region too small to hold the header reads as `RequestPending`,
    /// since nothing in it can be trusted.
    pub fn state(&self) -> ChannelState {
        if self.size() < SMT_HEADER_SIZE {
            return ChannelState::RequestPending;
        }
        ChannelState::from_status(self.read_status())
    }

    fn read_status(&self) -> ChannelStatus {
        ChannelStatus::from_bits_truncate(self.region.read_u32(CHANNEL_STATUS_OFFSET))
    }

    fn read_header(&self) -> SmtHeader {
        let mut bytes = [0u8; SMT_HEADER_SIZE];
        self.region.read(0, &mut bytes);
        SmtHeader::from_bytes(&bytes)
    }

    /// Write a request and hand the buffer to the platform
    ///
    /// # Arguments
    /// * `msg` - Request; only ids and input are used
    ///
    /// # Errors
    /// - `InvalidArgument` if the region cannot hold the SMT header
    /// - `Busy` if FREE is clear; the buffer is left untouched
    /// - `TooSmall` if header plus input exceed the region
    ///
    /// # Implementation Notes
    /// Payload and header are written first; `channel_status` is written
    /// last, behind a release fence, so FREE only drops once the request is
    /// complete in memory.
    pub fn encode_request(&self, msg: &Message<'_>) -> Result<()> {
        if self.size() < SMT_HEADER_SIZE {
            return Err(ScmiError::InvalidArgument);
        }

        let header = self.read_header();
        if header.state() == ChannelState::RequestPending {
            return Err(ScmiError::Busy);
        }

        let needed = SMT_HEADER_SIZE + msg.input.len();
        if needed > self.size() {
            return Err(ScmiError::TooSmall {
                needed,
                available: self.size(),
            });
        }

        let status = ChannelStatus::from_bits_retain(header.channel_status) - ChannelStatus::FREE;
        let flags = SmtFlags::from_bits_retain(header.flags) - SmtFlags::INTR_ENABLED;
        let request = SmtHeader {
            channel_status: status.bits(),
            flags: flags.bits(),
            length: (HEADER_SIZE + msg.input.len()) as u32,
            msg_header: MessageHeader::command(msg.protocol_id, msg.message_id).pack(),
            ..header
        };

        self.region.write(PAYLOAD_OFFSET, msg.input);
        let bytes = request.to_bytes();
        self.region.write(FLAGS_OFFSET, &bytes[FLAGS_OFFSET..SMT_HEADER_SIZE]);
        fence(Ordering::Release);
        self.region.write_u32(CHANNEL_STATUS_OFFSET, request.channel_status);
        fence(Ordering::SeqCst);

        Ok(())
    }

    /// Copy the platform's reply into `msg.output`
    ///
    /// # Returns
    /// Number of reply bytes copied
    ///
    /// # Errors
    /// - `Busy` if FREE is still clear (the platform never finished)
    /// - `CommError` if the platform set ERROR
    /// - `Protocol` if `length` is shorter than the header or runs past
    ///   the region
    /// - `TooSmall` if the reply exceeds the output capacity
    pub fn decode_response(&self, msg: &mut Message<'_>) -> Result<usize> {
        fence(Ordering::Acquire);
        match self.state() {
            ChannelState::RequestPending => return Err(ScmiError::Busy),
            ChannelState::Error => return Err(ScmiError::CommError),
            ChannelState::Idle => {}
        }

        let header = self.read_header();
        let length = header.length as usize;
        if length < HEADER_SIZE || length > self.size() - LENGTH_BASE {
            return Err(ScmiError::Protocol);
        }

        let reply_len = length - HEADER_SIZE;
        if reply_len > msg.output_capacity() {
            return Err(ScmiError::TooSmall {
                needed: reply_len,
                available: msg.output_capacity(),
            });
        }

        self.region.read(PAYLOAD_OFFSET, &mut msg.output[..reply_len]);
        msg.set_output_len(reply_len);

        Ok(reply_len)
    }

    /// Clear ERROR, leaving FREE as it is
    ///
    /// Run after every completed transaction, success or not, so the next
    /// one starts clean. Idempotent.
    pub fn clear_channel(&self) {
        if self.size() < SMT_HEADER_SIZE {
            return;
        }

        let status = self.region.read_u32(CHANNEL_STATUS_OFFSET);
        let cleared = ChannelStatus::from_bits_retain(status) - ChannelStatus::ERROR;
        if cleared.bits() != status {
            self.region.write_u32(CHANNEL_STATUS_OFFSET, cleared.bits());
        }
    }

    /// Take the buffer back after a call/return transport completed
    ///
    /// Only valid when the transport itself guarantees the platform is done
    /// with the buffer (a returned TEE invocation). Sets FREE and clears
    /// ERROR.
    pub fn reclaim(&self) {
        if self.size() < SMT_HEADER_SIZE {
            return;
        }

        let status = ChannelStatus::from_bits_retain(self.region.read_u32(CHANNEL_STATUS_OFFSET));
        let reclaimed = (status | ChannelStatus::FREE) - ChannelStatus::ERROR;
        self.region.write_u32(CHANNEL_STATUS_OFFSET, reclaimed.bits());
    }
}

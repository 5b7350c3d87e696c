//! Emulated SCMI platform
//!
//! Plays the controller side of both framings. Requests are read straight out
//! of the shared regions with the same layout types the agent uses, answered
//! from a small base protocol implementation, and written back the way
//! platform firmware would: payload and `length` first, `channel_status`
//! last.
//!
//! Protocols other than base are answered with a SUCCESS status word
//! followed by the request payload, so callers can check exactly what
//! arrived.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use scmi_agent::header::HEADER_SIZE;
use scmi_agent::smt::{LENGTH_BASE, PAYLOAD_OFFSET, SMT_HEADER_SIZE};
use scmi_agent::{
    ChannelStatus, HeapRegion, MessageHeader, ProtocolId, ScmiStatus, SharedMemory, SmtFlags,
    SmtHeader,
};

/// Base protocol version reported by the sandbox (2.0)
pub const BASE_PROTOCOL_VERSION: u32 = 0x0002_0000;

/// Base protocol message ids
pub const PROTOCOL_VERSION: u8 = 0x0;
pub const PROTOCOL_ATTRIBUTES: u8 = 0x1;
pub const PROTOCOL_MESSAGE_ATTRIBUTES: u8 = 0x2;
pub const BASE_DISCOVER_VENDOR: u8 = 0x3;

/// Protocols reported by PROTOCOL_ATTRIBUTES, base excluded
pub const NUM_PROTOCOLS: u32 = (ProtocolId::VOLTAGE_DOMAIN - ProtocolId::BASE) as u32;
pub const NUM_AGENTS: u32 = 1;

/// Size of the vendor identifier returned by DISCOVER_VENDOR
pub const VENDOR_ID_SIZE: usize = 16;

const CHANNEL_STATUS_OFFSET: usize = 4;
const FLAGS_OFFSET: usize = 16;

/// Misbehaviour injected into the next transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Never answer; FREE stays clear
    DropReply,
    /// Hand the buffer back with ERROR set (MSG framing: report failure)
    ErrorBit,
    /// Answer with a `length` running past the region
    OversizedLength,
    /// Refuse the call at the transport level
    NotSupported,
}

/// A request as the platform saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub header: MessageHeader,
    pub payload: Vec<u8>,
    /// SMT `flags` word; empty for MSG framing
    pub flags: SmtFlags,
}

/// The emulated platform
#[derive(Debug)]
pub struct SandboxController {
    regions: RefCell<BTreeMap<usize, Arc<HeapRegion>>>,
    faults: RefCell<VecDeque<Fault>>,
    requests: RefCell<Vec<Request>>,
    vendor: [u8; VENDOR_ID_SIZE],
}

impl Default for SandboxController {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxController {
    pub fn new() -> Self {
        Self {
            regions: RefCell::new(BTreeMap::new()),
            faults: RefCell::new(VecDeque::new()),
            requests: RefCell::new(Vec::new()),
            vendor: vendor_id("sandbox"),
        }
    }

    /// Controller reporting `vendor` from DISCOVER_VENDOR
    ///
    /// Names longer than 15 bytes are truncated so the identifier stays
    /// NUL-terminated.
    pub fn with_vendor(vendor: &str) -> Self {
        Self {
            vendor: vendor_id(vendor),
            ..Self::new()
        }
    }

    /// Region at `paddr`, created on first use
    ///
    /// A new region starts with FREE set, as the platform leaves it at boot.
    pub fn region(&self, paddr: usize, size: usize) -> Arc<HeapRegion> {
        self.regions
            .borrow_mut()
            .entry(paddr)
            .or_insert_with(|| {
                let region = Arc::new(HeapRegion::new(size, paddr));
                if size >= SMT_HEADER_SIZE {
                    let header = SmtHeader {
                        reserved0: 0,
                        channel_status: ChannelStatus::FREE.bits(),
                        reserved1: 0,
                        flags: 0,
                        length: 0,
                        msg_header: 0,
                    };
                    region.write(0, &header.to_bytes());
                }
                log::debug!("sandbox: region {:#x} ({} bytes)", paddr, size);
                region
            })
            .clone()
    }

    /// Region previously created at `paddr`
    pub fn region_at(&self, paddr: usize) -> Option<Arc<HeapRegion>> {
        self.regions.borrow().get(&paddr).cloned()
    }

    /// Queue a fault for the next transaction that reaches the platform
    pub fn inject(&self, fault: Fault) {
        self.faults.borrow_mut().push_back(fault);
    }

    /// Dequeue the fault for the transaction starting now
    pub fn take_fault(&self) -> Option<Fault> {
        self.faults.borrow_mut().pop_front()
    }

    /// Every request the platform has read, oldest first
    pub fn requests(&self) -> Vec<Request> {
        self.requests.borrow().clone()
    }

    pub fn last_request(&self) -> Option<Request> {
        self.requests.borrow().last().cloned()
    }

    fn record(&self, header: MessageHeader, payload: &[u8], flags: SmtFlags) {
        log::debug!(
            "sandbox: protocol {:#x} message {:#x} ({} bytes)",
            header.protocol_id,
            header.message_id,
            payload.len()
        );
        self.requests.borrow_mut().push(Request {
            header,
            payload: payload.to_vec(),
            flags,
        });
    }

    /// Reply payload (status word first) for one request
    pub fn reply_to(&self, header: &MessageHeader, payload: &[u8]) -> Vec<u8> {
        if header.protocol_id != ProtocolId::BASE {
            let mut reply = status_word(ScmiStatus::Success);
            reply.extend_from_slice(payload);
            return reply;
        }

        match header.message_id {
            PROTOCOL_VERSION => with_status(&BASE_PROTOCOL_VERSION.to_le_bytes()),
            PROTOCOL_ATTRIBUTES => {
                with_status(&((NUM_AGENTS << 8) | NUM_PROTOCOLS).to_le_bytes())
            }
            PROTOCOL_MESSAGE_ATTRIBUTES => match payload.get(..4) {
                Some(&[id, 0, 0, 0]) if id <= BASE_DISCOVER_VENDOR => {
                    with_status(&0u32.to_le_bytes())
                }
                Some(_) => status_word(ScmiStatus::NotFound),
                None => status_word(ScmiStatus::ProtocolError),
            },
            BASE_DISCOVER_VENDOR => with_status(&self.vendor),
            _ => status_word(ScmiStatus::NotSupported),
        }
    }

    /// Process the request pending in the SMT region at `paddr`
    ///
    /// # Returns
    /// `true` if the buffer was handed back to the agent
    pub fn service_smt(&self, paddr: usize, fault: Option<Fault>) -> bool {
        let Some(region) = self.region_at(paddr) else {
            log::warn!("sandbox: no region at {:#x}", paddr);
            return false;
        };
        if region.size() < SMT_HEADER_SIZE {
            return false;
        }

        let mut bytes = [0u8; SMT_HEADER_SIZE];
        region.read(0, &mut bytes);
        let mut header = SmtHeader::from_bytes(&bytes);
        if header.status().contains(ChannelStatus::FREE) {
            log::warn!("sandbox: {:#x} signalled without a pending request", paddr);
            return false;
        }
        if fault == Some(Fault::DropReply) {
            log::debug!("sandbox: dropping request on {:#x}", paddr);
            return false;
        }

        let length = header.length as usize;
        let request = MessageHeader::unpack(header.msg_header)
            .filter(|_| length >= HEADER_SIZE && length <= region.size() - LENGTH_BASE);

        let mut status = ChannelStatus::from_bits_retain(header.channel_status) | ChannelStatus::FREE;
        match request {
            Some(msg_header) if fault != Some(Fault::ErrorBit) => {
                let mut payload = vec![0u8; length - HEADER_SIZE];
                region.read(PAYLOAD_OFFSET, &mut payload);
                self.record(msg_header, &payload, SmtFlags::from_bits_retain(header.flags));

                let mut reply = self.reply_to(&msg_header, &payload);
                reply.truncate(region.size() - SMT_HEADER_SIZE);
                region.write(PAYLOAD_OFFSET, &reply);

                header.length = match fault {
                    Some(Fault::OversizedLength) => region.size() as u32,
                    _ => (HEADER_SIZE + reply.len()) as u32,
                };
                status -= ChannelStatus::ERROR;
            }
            _ => {
                log::debug!("sandbox: rejecting request on {:#x}", paddr);
                status |= ChannelStatus::ERROR;
            }
        }

        // Status word goes last
        let bytes = header.to_bytes();
        region.write(FLAGS_OFFSET, &bytes[FLAGS_OFFSET..SMT_HEADER_SIZE]);
        region.write_u32(CHANNEL_STATUS_OFFSET, status.bits());
        true
    }

    /// Process a MSG-framed request of `in_size` bytes at the start of
    /// `memory`
    ///
    /// # Returns
    /// Size of the reply written back (header included), or 0 when the
    /// request could not be answered
    pub fn service_msg<M: SharedMemory + ?Sized>(
        &self,
        memory: &M,
        in_size: usize,
        fault: Option<Fault>,
    ) -> usize {
        if in_size < HEADER_SIZE || in_size > memory.size() {
            return 0;
        }

        let mut word = [0u8; HEADER_SIZE];
        memory.read(0, &mut word);
        let Some(header) = MessageHeader::from_bytes(word) else {
            return 0;
        };

        let mut payload = vec![0u8; in_size - HEADER_SIZE];
        memory.read(HEADER_SIZE, &mut payload);
        self.record(header, &payload, SmtFlags::empty());

        match fault {
            Some(Fault::DropReply | Fault::ErrorBit) => return 0,
            _ => {}
        }

        let mut reply = self.reply_to(&header, &payload);
        reply.truncate(memory.size() - HEADER_SIZE);
        memory.write(HEADER_SIZE, &reply);

        match fault {
            Some(Fault::OversizedLength) => memory.size() + 1,
            _ => HEADER_SIZE + reply.len(),
        }
    }
}

fn vendor_id(name: &str) -> [u8; VENDOR_ID_SIZE] {
    let mut id = [0u8; VENDOR_ID_SIZE];
    let len = name.len().min(VENDOR_ID_SIZE - 1);
    id[..len].copy_from_slice(&name.as_bytes()[..len]);
    id
}

fn status_word(status: ScmiStatus) -> Vec<u8> {
    status.to_word().to_le_bytes().to_vec()
}

fn with_status(body: &[u8]) -> Vec<u8> {
    let mut reply = status_word(ScmiStatus::Success);
    reply.extend_from_slice(body);
    reply
}

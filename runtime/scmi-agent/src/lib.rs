//! SCMI Agent Transport - Message exchange with a system control processor
//!
//! # Purpose
//! Carries System Control and Management Interface (SCMI) requests from the
//! boot firmware (the agent) to a trusted controller that owns clocks, power
//! domains, resets and sensors. Upper layers hand over a protocol id, a
//! message id and a payload; this crate frames it, delivers it, waits for the
//! reply and hands the reply payload back.
//!
//! # Integration Points
//! - Depends on: a mailbox/doorbell driver, a secure monitor conduit or a
//!   TEE driver (see [`transport`]), and platform description data
//!   ([`config::ResourceDiscovery`])
//! - Provides to: SCMI protocol drivers (clock, power, reset, sensor, ...)
//! - Memory required: one shared memory region per static channel
//!
//! # Architecture
//! ```text
//! caller -> ScmiAgent::process_msg(channel, msg)
//!             -> Channel (base or dedicated, framing + binding)
//!                 -> TransportBackend::process
//!                     mailbox: Smt::encode_request, doorbell, wait, decode
//!                     smccc:   Smt::encode_request, smc, decode
//!                     optee:   session, get channel, SMT or MSG framing, invoke
//! ```
//! Exactly one transaction may be outstanding per channel. The shared memory
//! turn-taking is checked, never locked.
//!
//! # Testing Strategy
//! - Unit tests: header packing, SMT state machine, MSG framing, backends
//!   against inline mock devices
//! - Integration tests: `scmi-sandbox` drives every backend against an
//!   emulated controller
//! - Benchmarks: `benches/codec.rs`

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

pub mod agent;
pub mod channel;
pub mod config;
pub mod header;
pub mod message;
pub mod msg;
pub mod shmem;
pub mod smt;
pub mod transport;

pub use agent::ScmiAgent;
pub use channel::{Binding, Channel, ChannelHealth, ChannelId, ChannelRef, Framing};
pub use config::{
    AgentConfig, ChannelResolution, ChannelResource, RegionDesc, ResourceDiscovery,
    StaticPlatform, SubsystemId, TransportKind, DEFAULT_TIMEOUT,
};
pub use header::{MessageHeader, MessageType};
pub use message::{Message, ProtocolId, ScmiStatus};
pub use shmem::{HeapRegion, IdentityMapper, MappedRegion, RegionMapper, SharedMemory};
pub use smt::{ChannelState, ChannelStatus, Smt, SmtFlags, SmtHeader};
pub use transport::TransportBackend;

use thiserror::Error;

/// Error types for SCMI transactions
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ScmiError {
    #[error("Invalid argument")]
    InvalidArgument,

    #[error("Buffer too small (needed: {needed} bytes, available: {available} bytes)")]
    TooSmall { needed: usize, available: usize },

    #[error("Channel busy")]
    Busy,

    #[error("Channel reported a communication error")]
    CommError,

    #[error("Function not supported by the secure monitor")]
    NotSupported,

    #[error("Timed out waiting for the platform reply")]
    Timeout,

    #[error("No such device")]
    NoDevice,

    #[error("Transport protocol error")]
    Protocol,

    #[error("Channel faulted by an earlier unfinished transaction")]
    Faulted,

    #[error("Platform returned SCMI status {0:?}")]
    Remote(ScmiStatus),
}

pub type Result<T> = core::result::Result<T, ScmiError>;

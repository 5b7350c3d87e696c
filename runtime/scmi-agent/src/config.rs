//! Agent configuration and platform resource discovery
//!
//! The platform description (device tree, board tables) says which transport
//! the agent uses and which resources back the base channel and any
//! dedicated per-subsystem channels. This module holds those descriptions as
//! plain data; [`ResourceDiscovery`] is the seam to whatever parses them.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Result, ScmiError};

/// Mailbox reply deadline unless a channel overrides it
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10);

/// UUID of the OP-TEE pseudo trusted application serving SCMI
pub const OPTEE_SCMI_SERVICE: Uuid = Uuid::from_u128(0xa8cfe406_d4f5_4a2e_9f8d_a25dc754c099);

/// Size of the per-call memory used with MSG framing
pub const DYNAMIC_MSG_SIZE: usize = 128;

/// Delivery mechanism for a whole agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TransportKind {
    /// Doorbell through a mailbox controller, then wait for the reply
    Mailbox,
    /// Synchronous secure monitor call
    Smccc,
    /// Session with the SCMI service in OP-TEE
    Optee,
}

/// Identifier of a subsystem that may own a dedicated channel
///
/// Typically the SCMI protocol id of the driver asking for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SubsystemId(pub u32);

/// Physical description of a shared memory region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RegionDesc {
    pub paddr: usize,
    pub size: usize,
}

/// Resources backing one channel
///
/// Which fields are required depends on the transport:
/// - Mailbox: `shmem`; `doorbell` defaults to 0
/// - SMCCC: `shmem` and `smc_id`
/// - OP-TEE: `tee_channel`; `shmem` is optional (absent means MSG framing)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChannelResource {
    /// Statically shared SMT region
    pub shmem: Option<RegionDesc>,

    /// Mailbox channel used as doorbell
    pub doorbell: Option<u32>,

    /// SMCCC function identifier that makes the platform process the channel
    pub smc_id: Option<u32>,

    /// Channel identifier known to the OP-TEE service
    pub tee_channel: Option<u32>,

    /// Reply deadline override in microseconds (mailbox only)
    pub timeout_us: Option<u64>,
}

impl ChannelResource {
    /// Resource with a static SMT region
    pub fn with_shmem(paddr: usize, size: usize) -> Self {
        Self {
            shmem: Some(RegionDesc { paddr, size }),
            ..Self::default()
        }
    }

    /// Effective reply deadline
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout_us.map(Duration::from_micros).unwrap_or(default)
    }
}

/// Where a subsystem's messages go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelResolution {
    /// Share the agent's base channel
    Base,
    /// Use a channel of its own
    Dedicated(ChannelResource),
}

/// Agent-wide settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AgentConfig {
    /// Transport every channel of this agent uses
    pub transport: TransportKind,

    /// Mailbox reply deadline in microseconds
    pub timeout_us: u64,

    /// OP-TEE service to open sessions with
    pub tee_service: Uuid,

    /// Size of per-call memory for MSG framing
    pub dynamic_msg_size: usize,
}

impl AgentConfig {
    /// Defaults for the given transport
    pub fn new(transport: TransportKind) -> Self {
        Self {
            transport,
            timeout_us: DEFAULT_TIMEOUT.as_micros() as u64,
            tee_service: OPTEE_SCMI_SERVICE,
            dynamic_msg_size: DYNAMIC_MSG_SIZE,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_micros(self.timeout_us)
    }

    /// Reject settings no transport could work with
    ///
    /// # Errors
    /// Returns `InvalidArgument` for a zero timeout or a dynamic message
    /// size that cannot hold a message header
    pub fn validate(&self) -> Result<()> {
        if self.timeout_us == 0 || self.dynamic_msg_size < crate::header::HEADER_SIZE {
            return Err(ScmiError::InvalidArgument);
        }
        Ok(())
    }
}

/// Source of channel resources, typically static platform data
pub trait ResourceDiscovery {
    /// Resources of the base channel shared by all subsystems
    ///
    /// # Errors
    /// Returns `NoDevice` if the platform describes no SCMI agent
    fn base(&self) -> Result<ChannelResource>;

    /// Channel choice for one subsystem
    fn resolve(&self, subsystem: SubsystemId) -> ChannelResolution;

    /// Subsystems known to the platform description
    fn subsystems(&self) -> Vec<SubsystemId>;
}

/// Table-driven platform description
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StaticPlatform {
    pub base: Option<ChannelResource>,
    pub dedicated: BTreeMap<SubsystemId, ChannelResource>,
}

impl StaticPlatform {
    pub fn new(base: ChannelResource) -> Self {
        Self {
            base: Some(base),
            dedicated: BTreeMap::new(),
        }
    }

    /// Give `subsystem` its own channel
    pub fn with_dedicated(mut self, subsystem: SubsystemId, resource: ChannelResource) -> Self {
        self.dedicated.insert(subsystem, resource);
        self
    }
}

impl ResourceDiscovery for StaticPlatform {
    fn base(&self) -> Result<ChannelResource> {
        self.base.ok_or(ScmiError::NoDevice)
    }

    fn resolve(&self, subsystem: SubsystemId) -> ChannelResolution {
        match self.dedicated.get(&subsystem) {
            Some(resource) => ChannelResolution::Dedicated(*resource),
            None => ChannelResolution::Base,
        }
    }

    fn subsystems(&self) -> Vec<SubsystemId> {
        self.dedicated.keys().copied().collect()
    }
}

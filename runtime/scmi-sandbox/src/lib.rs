//! SCMI Sandbox - Host-side platform emulation for scmi-agent
//!
//! # Purpose
//! Stands in for the system control processor and the devices that reach
//! it, so every transport backend of `scmi-agent` can run end to end on a
//! development machine.
//!
//! # Components
//! - [`SandboxController`]: the platform; base protocol replies, echo for
//!   everything else, scripted [`Fault`]s
//! - [`SandboxMailbox`], [`SandboxMonitor`], [`SandboxTee`]: the three
//!   collaborator devices, each driving the controller the way real
//!   hardware or secure firmware would
//! - [`SandboxMapper`]: maps channel regions onto the controller's memory
//!
//! Everything shares one controller through `Rc`, mirroring how agent and
//! platform share one physical buffer. The regions themselves are
//! `Arc<HeapRegion>`, as the agent requires of any shared memory.

pub mod controller;
pub mod mailbox;
pub mod monitor;
pub mod tee;

use std::rc::Rc;
use std::sync::Arc;

use scmi_agent::config::RegionDesc;
use scmi_agent::{RegionMapper, Result, ScmiError, SharedMemory};

pub use controller::{Fault, Request, SandboxController};
pub use mailbox::SandboxMailbox;
pub use monitor::SandboxMonitor;
pub use tee::SandboxTee;

/// Region mapper backed by the controller's memory
#[derive(Debug, Clone)]
pub struct SandboxMapper {
    controller: Rc<SandboxController>,
    mapped: Vec<RegionDesc>,
}

impl SandboxMapper {
    pub fn new(controller: Rc<SandboxController>) -> Self {
        Self {
            controller,
            mapped: Vec::new(),
        }
    }

    /// Regions mapped so far
    pub fn mapped(&self) -> &[RegionDesc] {
        &self.mapped
    }
}

impl RegionMapper for SandboxMapper {
    fn map(&mut self, region: RegionDesc) -> Result<Arc<dyn SharedMemory>> {
        if region.size == 0 {
            return Err(ScmiError::InvalidArgument);
        }

        self.mapped.push(region);
        Ok(self.controller.region(region.paddr, region.size))
    }
}

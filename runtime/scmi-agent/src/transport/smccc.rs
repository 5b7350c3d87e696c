//! Secure monitor call (SMCCC) transport
//!
//! The simplest backend: write the request into the channel's SMT region and
//! issue one SMC with the channel's function identifier. The monitor runs the
//! platform's SCMI server before returning, so the reply is in place when the
//! call comes back. The region address was agreed when the platform was
//! built and never travels with the call.

use crate::channel::{Binding, Channel, ChannelId, Framing};
use crate::config::{ChannelResource, TransportKind};
use crate::message::Message;
use crate::shmem::RegionMapper;
use crate::transport::{complete_smt, map_smt, TransportBackend};
use crate::{Result, ScmiError};

/// SMCCC return value for an unimplemented function
pub const SMCCC_RET_NOT_SUPPORTED: i32 = -1;

/// Registers x0-x3 after an SMC
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SmcResult {
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
}

impl SmcResult {
    /// True if the monitor does not implement the called function
    ///
    /// Only the low 32 bits are significant: SMC32 functions leave the upper
    /// half of x0 unspecified.
    pub fn is_not_supported(&self) -> bool {
        self.a0 as u32 as i32 == SMCCC_RET_NOT_SUPPORTED
    }
}

/// Trap into the secure monitor
pub trait SecureMonitor {
    /// Issue `smc #0` with `function_id` in w0 and `args` in x1-x6
    fn smc(&self, function_id: u32, args: [u64; 6]) -> SmcResult;
}

/// Conduit issuing real `smc #0` instructions
#[cfg(target_arch = "aarch64")]
pub struct SmcConduit {
    _private: (),
}

#[cfg(target_arch = "aarch64")]
impl SmcConduit {
    /// # Safety
    /// The caller must run at an exception level where SMC is permitted and
    /// trust the monitor's handling of every function id passed later.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

#[cfg(target_arch = "aarch64")]
impl SecureMonitor for SmcConduit {
    fn smc(&self, function_id: u32, args: [u64; 6]) -> SmcResult {
        let (a0, a1, a2, a3): (u64, u64, u64, u64);

        // SAFETY: permitted by `SmcConduit::new`; x4-x17 are clobbered per SMCCC
        unsafe {
            core::arch::asm!(
                "smc #0",
                inout("x0") function_id as u64 => a0,
                inout("x1") args[0] => a1,
                inout("x2") args[1] => a2,
                inout("x3") args[2] => a3,
                inlateout("x4") args[3] => _,
                inlateout("x5") args[4] => _,
                inlateout("x6") args[5] => _,
                out("x7") _,
                out("x8") _,
                out("x9") _,
                out("x10") _,
                out("x11") _,
                out("x12") _,
                out("x13") _,
                out("x14") _,
                out("x15") _,
                out("x16") _,
                out("x17") _,
                options(nostack)
            );
        }

        SmcResult { a0, a1, a2, a3 }
    }
}

/// SCMI over SMC-triggered SMT channels
pub struct SmcccTransport<S> {
    monitor: S,
}

impl<S: SecureMonitor> SmcccTransport<S> {
    pub fn new(monitor: S) -> Self {
        Self { monitor }
    }

    pub fn monitor(&self) -> &S {
        &self.monitor
    }
}

impl<S: SecureMonitor> TransportBackend for SmcccTransport<S> {
    fn kind(&self) -> TransportKind {
        TransportKind::Smccc
    }

    fn setup_channel(
        &self,
        id: ChannelId,
        resource: &ChannelResource,
        mapper: &mut dyn RegionMapper,
    ) -> Result<Channel> {
        let function_id = resource.smc_id.ok_or(ScmiError::InvalidArgument)?;
        let smt = map_smt(resource, mapper)?;

        log::debug!(
            "scmi-smccc: channel {:?} function {:#x} shmem {:#x}",
            id,
            function_id,
            smt.bus_address()
        );

        Ok(Channel::new(id, Framing::Smt(smt), Binding::Smccc { function_id }))
    }

    fn process(&self, channel: &mut Channel, msg: &mut Message<'_>) -> Result<()> {
        let Binding::Smccc { function_id } = channel.binding() else {
            return Err(ScmiError::InvalidArgument);
        };
        let smt = channel.smt().cloned().ok_or(ScmiError::InvalidArgument)?;

        smt.encode_request(msg)?;
        log::debug!(
            "scmi-smccc: smc {:#x} protocol {:#x} message {:#x}",
            function_id,
            msg.protocol_id,
            msg.message_id
        );

        let result = self.monitor.smc(function_id, [0; 6]);
        if result.is_not_supported() {
            // Region contents are undefined; do not read or reset them
            log::error!("scmi-smccc: function {:#x} not implemented by monitor", function_id);
            channel.fault(ScmiError::NotSupported);
            return Err(ScmiError::NotSupported);
        }

        complete_smt(&smt, msg)
    }
}

//! TEE driver hosting a sandbox SCMI service
//!
//! Implements the service side of the OP-TEE SCMI commands over
//! [`SandboxController`] and keeps count of every session and allocation so
//! tests can check nothing leaks.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::sync::Arc;

use scmi_agent::config::OPTEE_SCMI_SERVICE;
use scmi_agent::transport::optee::{
    CMD_CAPABILITIES, CMD_GET_CHANNEL, CMD_PROCESS_MSG_CHANNEL, CMD_PROCESS_SMT_CHANNEL,
    TEEC_SUCCESS,
};
use scmi_agent::transport::{InvokeResult, SessionHandle, TeeCapabilities, TeeDevice, TeeParam};
use scmi_agent::{HeapRegion, Result, ScmiError};
use uuid::Uuid;

use crate::controller::{Fault, SandboxController};

pub const TEEC_ERROR_ITEM_NOT_FOUND: u32 = 0xFFFF_0008;
pub const TEEC_ERROR_BAD_PARAMETERS: u32 = 0xFFFF_0006;
pub const TEEC_ERROR_NOT_SUPPORTED: u32 = 0xFFFF_000A;
pub const TEEC_ERROR_COMMUNICATION: u32 = 0xFFFF_000E;

/// Origin code for errors raised by the trusted application
pub const TEEC_ORIGIN_TRUSTED_APP: u32 = 4;

/// Base bus address of per-call allocations
const DYNAMIC_BASE: usize = 0xE000_0000;

#[derive(Debug, Default)]
struct TeeState {
    caps: Cell<u32>,
    available: Cell<bool>,
    next_session: Cell<u32>,
    open: RefCell<BTreeSet<u32>>,
    opened: Cell<u32>,
    closed: Cell<u32>,
    allocated: Cell<u32>,
    freed: Cell<u32>,
    channels: RefCell<BTreeMap<u32, usize>>,
    commands: RefCell<Vec<u32>>,
}

/// TEE driver with the SCMI service loaded
///
/// Clones share the same state.
#[derive(Debug, Clone)]
pub struct SandboxTee {
    controller: Rc<SandboxController>,
    state: Rc<TeeState>,
}

impl SandboxTee {
    /// Service supporting `caps`
    pub fn new(controller: Rc<SandboxController>, caps: TeeCapabilities) -> Self {
        let state = TeeState::default();
        state.caps.set(caps.bits());
        state.available.set(true);
        Self {
            controller,
            state: Rc::new(state),
        }
    }

    /// Serve the SMT region at `paddr` as static channel `channel_id`
    pub fn bind(&self, channel_id: u32, paddr: usize) {
        self.state.channels.borrow_mut().insert(channel_id, paddr);
    }

    /// Make the service unreachable (or reachable again)
    pub fn set_available(&self, available: bool) {
        self.state.available.set(available);
    }

    pub fn sessions_opened(&self) -> u32 {
        self.state.opened.get()
    }

    pub fn sessions_open(&self) -> usize {
        self.state.open.borrow().len()
    }

    pub fn allocations(&self) -> u32 {
        self.state.allocated.get()
    }

    /// Every session closed and every allocation freed
    pub fn is_balanced(&self) -> bool {
        self.state.opened.get() == self.state.closed.get()
            && self.state.allocated.get() == self.state.freed.get()
            && self.state.open.borrow().is_empty()
    }

    /// Service commands invoked so far
    pub fn commands(&self) -> Vec<u32> {
        self.state.commands.borrow().clone()
    }

    fn get_channel(&self, params: &mut [TeeParam<'_, Arc<HeapRegion>>]) -> u32 {
        let Some(TeeParam::ValueInout { a, b, .. }) = params.first_mut() else {
            return TEEC_ERROR_BAD_PARAMETERS;
        };

        let requested = TeeCapabilities::from_bits_truncate(*b as u32);
        let supported = TeeCapabilities::from_bits_truncate(self.state.caps.get());
        if requested.is_empty() || !supported.contains(requested) {
            return TEEC_ERROR_NOT_SUPPORTED;
        }

        let channel_id = *a as u32;
        if requested.contains(TeeCapabilities::SMT_HEADER)
            && !self.state.channels.borrow().contains_key(&channel_id)
        {
            return TEEC_ERROR_ITEM_NOT_FOUND;
        }

        // Handle is the channel id itself
        *a = channel_id as u64;
        *b = 0;
        TEEC_SUCCESS
    }

    fn process_smt(&self, params: &mut [TeeParam<'_, Arc<HeapRegion>>]) -> u32 {
        let Some(&TeeParam::ValueInput { a: handle, .. }) = params.first() else {
            return TEEC_ERROR_BAD_PARAMETERS;
        };
        let Some(paddr) = self.state.channels.borrow().get(&(handle as u32)).copied() else {
            return TEEC_ERROR_ITEM_NOT_FOUND;
        };

        match self.controller.take_fault() {
            Some(Fault::NotSupported) => TEEC_ERROR_NOT_SUPPORTED,
            fault => {
                self.controller.service_smt(paddr, fault);
                TEEC_SUCCESS
            }
        }
    }

    fn process_msg(&self, params: &mut [TeeParam<'_, Arc<HeapRegion>>]) -> u32 {
        let [
            TeeParam::ValueInput { .. },
            TeeParam::MemrefInput { memory, size: in_size },
            TeeParam::MemrefOutput { size: out_size, .. },
        ] = params
        else {
            return TEEC_ERROR_BAD_PARAMETERS;
        };

        let fault = self.controller.take_fault();
        if fault == Some(Fault::NotSupported) {
            return TEEC_ERROR_NOT_SUPPORTED;
        }

        let written = self.controller.service_msg(*memory, *in_size, fault);
        if written == 0 {
            return TEEC_ERROR_COMMUNICATION;
        }
        *out_size = written;
        TEEC_SUCCESS
    }
}

impl TeeDevice for SandboxTee {
    type Memory = Arc<HeapRegion>;

    fn open_session(&self, service: &Uuid) -> Result<SessionHandle> {
        if !self.state.available.get() || *service != OPTEE_SCMI_SERVICE {
            log::warn!("sandbox-tee: no service {}", service);
            return Err(ScmiError::NoDevice);
        }

        let id = self.state.next_session.get() + 1;
        self.state.next_session.set(id);
        self.state.opened.set(self.state.opened.get() + 1);
        self.state.open.borrow_mut().insert(id);
        Ok(SessionHandle(id))
    }

    fn invoke(
        &self,
        session: SessionHandle,
        function_id: u32,
        params: &mut [TeeParam<'_, Self::Memory>],
    ) -> Result<InvokeResult> {
        if !self.state.open.borrow().contains(&session.0) {
            return Err(ScmiError::InvalidArgument);
        }
        self.state.commands.borrow_mut().push(function_id);

        let ret = match function_id {
            CMD_CAPABILITIES => match params.first_mut() {
                Some(TeeParam::ValueOutput { a, .. }) => {
                    *a = self.state.caps.get() as u64;
                    TEEC_SUCCESS
                }
                _ => TEEC_ERROR_BAD_PARAMETERS,
            },
            CMD_GET_CHANNEL => self.get_channel(params),
            CMD_PROCESS_SMT_CHANNEL => self.process_smt(params),
            CMD_PROCESS_MSG_CHANNEL => self.process_msg(params),
            _ => TEEC_ERROR_NOT_SUPPORTED,
        };

        let ret_origin = if ret == TEEC_SUCCESS { 0 } else { TEEC_ORIGIN_TRUSTED_APP };
        Ok(InvokeResult { ret, ret_origin })
    }

    fn close_session(&self, session: SessionHandle) {
        if self.state.open.borrow_mut().remove(&session.0) {
            self.state.closed.set(self.state.closed.get() + 1);
        }
    }

    fn alloc_shared_memory(&self, session: SessionHandle, size: usize) -> Result<Self::Memory> {
        if !self.state.open.borrow().contains(&session.0) {
            return Err(ScmiError::InvalidArgument);
        }

        let index = self.state.allocated.get() as usize;
        self.state.allocated.set(self.state.allocated.get() + 1);
        Ok(Arc::new(HeapRegion::new(size, DYNAMIC_BASE + index * size)))
    }

    fn free_shared_memory(&self, _memory: Self::Memory) {
        self.state.freed.set(self.state.freed.get() + 1);
    }
}

//! Mailbox controller wired to the sandbox platform

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use scmi_agent::transport::MailboxDevice;
use scmi_agent::{Result, ScmiError};

use crate::controller::{Fault, SandboxController};

/// Doorbell mailbox; the platform runs when the agent waits for the reply
///
/// Clones share the same doorbell state.
#[derive(Debug, Clone)]
pub struct SandboxMailbox {
    controller: Rc<SandboxController>,
    pending: Rc<RefCell<BTreeMap<u32, (usize, Option<Fault>)>>>,
    rung: Rc<RefCell<Vec<(u32, usize)>>>,
}

impl SandboxMailbox {
    pub fn new(controller: Rc<SandboxController>) -> Self {
        Self {
            controller,
            pending: Rc::new(RefCell::new(BTreeMap::new())),
            rung: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Doorbells rung so far with the address each one carried
    pub fn rung(&self) -> Vec<(u32, usize)> {
        self.rung.borrow().clone()
    }
}

impl MailboxDevice for SandboxMailbox {
    fn send(&self, doorbell: u32, payload_address: usize) -> Result<()> {
        let fault = self.controller.take_fault();
        if fault == Some(Fault::NotSupported) {
            log::warn!("sandbox-mbox: doorbell {} not wired", doorbell);
            return Err(ScmiError::NoDevice);
        }

        self.rung.borrow_mut().push((doorbell, payload_address));
        self.pending
            .borrow_mut()
            .insert(doorbell, (payload_address, fault));
        Ok(())
    }

    fn receive(&self, doorbell: u32, timeout: Duration) -> Result<()> {
        let pending = self.pending.borrow_mut().remove(&doorbell);
        let answered = match pending {
            Some((address, fault)) => self.controller.service_smt(address, fault),
            None => false,
        };

        if !answered {
            log::debug!("sandbox-mbox: doorbell {} silent for {:?}", doorbell, timeout);
            return Err(ScmiError::Timeout);
        }
        Ok(())
    }
}

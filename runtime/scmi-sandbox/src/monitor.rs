//! Secure monitor running the sandbox platform on every SMC

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use scmi_agent::transport::smccc::SMCCC_RET_NOT_SUPPORTED;
use scmi_agent::transport::{SecureMonitor, SmcResult};

use crate::controller::{Fault, SandboxController};

/// Monitor with a table of SCMI function ids
///
/// Each bound function id serves the SMT region at one address; any other
/// id is answered with NOT_SUPPORTED, as a real monitor would.
#[derive(Debug, Clone)]
pub struct SandboxMonitor {
    controller: Rc<SandboxController>,
    functions: Rc<RefCell<BTreeMap<u32, usize>>>,
    calls: Rc<RefCell<Vec<u32>>>,
}

impl SandboxMonitor {
    pub fn new(controller: Rc<SandboxController>) -> Self {
        Self {
            controller,
            functions: Rc::new(RefCell::new(BTreeMap::new())),
            calls: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Serve the region at `paddr` on `function_id`
    pub fn bind(&self, function_id: u32, paddr: usize) {
        self.functions.borrow_mut().insert(function_id, paddr);
    }

    /// Function ids called so far
    pub fn calls(&self) -> Vec<u32> {
        self.calls.borrow().clone()
    }
}

impl SecureMonitor for SandboxMonitor {
    fn smc(&self, function_id: u32, _args: [u64; 6]) -> SmcResult {
        self.calls.borrow_mut().push(function_id);

        let fault = self.controller.take_fault();
        let paddr = self.functions.borrow().get(&function_id).copied();
        match (paddr, fault) {
            (Some(paddr), fault) if fault != Some(Fault::NotSupported) => {
                self.controller.service_smt(paddr, fault);
                SmcResult::default()
            }
            _ => {
                log::debug!("sandbox-smc: function {:#x} not supported", function_id);
                SmcResult {
                    a0: SMCCC_RET_NOT_SUPPORTED as i64 as u64,
                    ..SmcResult::default()
                }
            }
        }
    }
}

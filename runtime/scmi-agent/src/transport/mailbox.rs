//! Mailbox/doorbell transport
//!
//! # Transaction
//! ```text
//! IDLE --encode--> BUSY --doorbell--> WAITING --receive--> READY --decode--> IDLE
//!                                         \--deadline--> FAULT
//! ```
//! The doorbell carries the region's bus address where the controller wants
//! it; the reply itself always comes back through the SMT region. A missed
//! deadline is reported, never retried, and leaves the channel faulted until
//! the platform hands the buffer back. So does a failed send: the doorbell
//! may have rung before the controller driver reported the error.

use core::time::Duration;

use crate::channel::{Binding, Channel, ChannelId, Framing};
use crate::config::{AgentConfig, ChannelResource, TransportKind, DEFAULT_TIMEOUT};
use crate::message::Message;
use crate::shmem::RegionMapper;
use crate::transport::{complete_smt, map_smt, TransportBackend};
use crate::{Result, ScmiError};

/// Mailbox controller driver consumed by the transport
pub trait MailboxDevice {
    /// Ring `doorbell`, passing the shared region's address
    ///
    /// # Errors
    /// Any error of the controller driver. The platform may or may not have
    /// been notified.
    fn send(&self, doorbell: u32, payload_address: usize) -> Result<()>;

    /// Block until the platform signals completion on `doorbell`
    ///
    /// # Errors
    /// Returns `Timeout` once `timeout` elapses without a signal
    fn receive(&self, doorbell: u32, timeout: Duration) -> Result<()>;
}

/// SCMI over a mailbox controller and SMT regions
pub struct MailboxTransport<M> {
    device: M,
    timeout: Duration,
}

impl<M: MailboxDevice> MailboxTransport<M> {
    /// Transport with the default 10 ms reply deadline
    pub fn new(device: M) -> Self {
        Self {
            device,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Transport configured from agent settings
    ///
    /// # Errors
    /// Returns `InvalidArgument` if `config` is not a valid mailbox config
    pub fn with_config(device: M, config: &AgentConfig) -> Result<Self> {
        config.validate()?;
        if config.transport != TransportKind::Mailbox {
            return Err(ScmiError::InvalidArgument);
        }

        Ok(Self {
            device,
            timeout: config.timeout(),
        })
    }

    pub fn device(&self) -> &M {
        &self.device
    }
}

impl<M: MailboxDevice> TransportBackend for MailboxTransport<M> {
    fn kind(&self) -> TransportKind {
        TransportKind::Mailbox
    }

    fn setup_channel(
        &self,
        id: ChannelId,
        resource: &ChannelResource,
        mapper: &mut dyn RegionMapper,
    ) -> Result<Channel> {
        let smt = map_smt(resource, mapper)?;
        let binding = Binding::Mailbox {
            doorbell: resource.doorbell.unwrap_or(0),
            timeout: resource.timeout_or(self.timeout),
        };

        log::debug!(
            "scmi-mbox: channel {:?} shmem {:#x} ({} bytes), {:?}",
            id,
            smt.bus_address(),
            smt.size(),
            binding
        );

        Ok(Channel::new(id, Framing::Smt(smt), binding))
    }

    fn process(&self, channel: &mut Channel, msg: &mut Message<'_>) -> Result<()> {
        let Binding::Mailbox { doorbell, timeout } = channel.binding() else {
            return Err(ScmiError::InvalidArgument);
        };
        let smt = channel.smt().cloned().ok_or(ScmiError::InvalidArgument)?;

        smt.encode_request(msg)?;
        log::debug!(
            "scmi-mbox: doorbell {} protocol {:#x} message {:#x} ({} bytes)",
            doorbell,
            msg.protocol_id,
            msg.message_id,
            msg.input.len()
        );

        if let Err(err) = self.device.send(doorbell, smt.bus_address()) {
            // Buffer stays handed over until the platform sets FREE
            log::error!("scmi-mbox: doorbell {} send failed: {}", doorbell, err);
            channel.fault(ScmiError::CommError);
            return Err(ScmiError::CommError);
        }

        match self.device.receive(doorbell, timeout) {
            Ok(()) => {}
            Err(ScmiError::Timeout) => {
                log::warn!(
                    "scmi-mbox: no reply on doorbell {} within {:?}",
                    doorbell,
                    timeout
                );
                return Err(ScmiError::Timeout);
            }
            Err(err) => {
                log::error!("scmi-mbox: receive on doorbell {} failed: {}", doorbell, err);
                return Err(ScmiError::CommError);
            }
        }

        complete_smt(&smt, msg)
    }
}

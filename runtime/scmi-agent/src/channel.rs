//! Channels - the unit a caller transacts against
//!
//! A channel binds one framing (a static SMT region, or MSG framing over
//! per-call memory) to the transport-specific identity the backend needs to
//! reach the platform. Channels are built once when the agent is set up and
//! live as long as the agent.
//!
//! # Health
//! A transaction that ends in `Busy` or `Timeout` leaves the buffer's owner
//! unknown. So does a backend failure after the buffer was handed over (a
//! doorbell that may have rung, an SMC the monitor refused). The channel is
//! then marked [`ChannelHealth::Faulted`] and its buffer is not written again
//! until [`Channel::recover`] sees the platform hand it back.
//!
//! # Ownership
//! Channels share no state with each other. A dedicated channel can be taken
//! out of the agent ([`crate::ScmiAgent::take_channel`]) and driven from
//! another thread with [`Channel::process`].

use core::time::Duration;

use crate::config::SubsystemId;
use crate::message::Message;
use crate::smt::{ChannelState, Smt};
use crate::transport::TransportBackend;
use crate::{Result, ScmiError};

/// Which channel of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChannelId {
    Base,
    Dedicated(SubsystemId),
}

/// Handle returned to callers by [`crate::ScmiAgent::get_channel`]
pub type ChannelRef = ChannelId;

/// Wire format the channel uses, fixed at setup
#[derive(Debug, Clone)]
pub enum Framing {
    /// Full SMT header in a statically shared region
    Smt(Smt),
    /// Header-only framing in memory allocated per call
    Msg { max_size: usize },
}

/// Transport-specific identity of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Mailbox { doorbell: u32, timeout: Duration },
    Smccc { function_id: u32 },
    Optee { channel_id: u32 },
}

/// Whether the channel may start a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelHealth {
    Ready,
    /// Last transaction ended with this unresolved error
    Faulted(ScmiError),
}

/// One SCMI channel
#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    framing: Framing,
    binding: Binding,
    health: ChannelHealth,
}

impl Channel {
    pub fn new(id: ChannelId, framing: Framing, binding: Binding) -> Self {
        Self {
            id,
            framing,
            binding,
            health: ChannelHealth::Ready,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn framing(&self) -> &Framing {
        &self.framing
    }

    pub fn binding(&self) -> Binding {
        self.binding
    }

    pub fn health(&self) -> ChannelHealth {
        self.health
    }

    /// The static SMT region, if the channel has one
    pub fn smt(&self) -> Option<&Smt> {
        match &self.framing {
            Framing::Smt(smt) => Some(smt),
            Framing::Msg { .. } => None,
        }
    }

    /// Record the outcome of a transaction
    ///
    /// `Busy` and `Timeout` fault the channel; anything else leaves the
    /// health as it was.
    pub fn record_outcome(&mut self, outcome: &Result<()>) {
        if let Err(err @ (ScmiError::Busy | ScmiError::Timeout)) = outcome {
            self.fault(*err);
        }
    }

    /// Stop using the buffer until the platform releases it
    ///
    /// For backends that lose track of the buffer's owner in ways
    /// `record_outcome` cannot see. The first cause is kept.
    pub fn fault(&mut self, cause: ScmiError) {
        if let ChannelHealth::Faulted(_) = self.health {
            return;
        }
        log::warn!("scmi: channel {:?} faulted: {}", self.id, cause);
        self.health = ChannelHealth::Faulted(cause);
    }

    /// Run one transaction through `backend`
    ///
    /// Recovers a faulted channel first, then records the outcome.
    ///
    /// # Errors
    /// - `Faulted` while the platform still owns the buffer
    /// - any error of the transport (see [`TransportBackend::process`])
    pub fn process(&mut self, backend: &dyn TransportBackend, msg: &mut Message<'_>) -> Result<()> {
        self.recover()?;

        log::debug!(
            "scmi: {:?} protocol {:#x} message {:#x}",
            self.id,
            msg.protocol_id,
            msg.message_id
        );
        let outcome = backend.process(self, msg);
        self.record_outcome(&outcome);

        if let Err(err) = outcome {
            log::debug!("scmi: {:?} transaction failed: {}", self.id, err);
        }
        outcome
    }

    /// Try to bring a faulted channel back
    ///
    /// If the platform has set FREE since the fault, whatever reply it left
    /// is discarded, ERROR is cleared and the channel is ready again.
    ///
    /// # Errors
    /// Returns `Faulted` while the platform still owns the buffer
    pub fn recover(&mut self) -> Result<()> {
        if self.health == ChannelHealth::Ready {
            return Ok(());
        }

        if let Framing::Smt(smt) = &self.framing {
            if smt.state() == ChannelState::RequestPending {
                return Err(ScmiError::Faulted);
            }
            smt.clear_channel();
        }

        log::debug!("scmi: channel {:?} recovered", self.id);
        self.health = ChannelHealth::Ready;
        Ok(())
    }
}

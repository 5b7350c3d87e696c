//! Agent front-end
//!
//! Owns the transport backend and every channel built for this agent. Callers
//! resolve a subsystem to a [`ChannelRef`] once, then run transactions
//! through [`ScmiAgent::process_msg`].
//!
//! A dedicated channel can be lent out with [`ScmiAgent::take_channel`] and
//! driven elsewhere through [`Channel::process`], for example from another
//! thread while this agent keeps serving the base channel.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use crate::channel::{Channel, ChannelHealth, ChannelId, ChannelRef};
use crate::config::{AgentConfig, ChannelResolution, ResourceDiscovery, SubsystemId};
use crate::message::Message;
use crate::shmem::RegionMapper;
use crate::transport::TransportBackend;
use crate::{Result, ScmiError};

/// SCMI agent: one transport, a base channel and optional dedicated channels
pub struct ScmiAgent {
    backend: Box<dyn TransportBackend>,
    base: Channel,
    /// `None` while the channel is lent out
    dedicated: BTreeMap<SubsystemId, Option<Channel>>,
}

impl ScmiAgent {
    /// Build every channel the platform describes
    ///
    /// # Arguments
    /// * `config` - agent settings; its transport must match `backend`
    /// * `backend` - delivery mechanism shared by all channels
    /// * `discovery` - platform description of the channels
    /// * `mapper` - maps static shared memory regions
    ///
    /// # Errors
    /// - `InvalidArgument` if the config is invalid or names another transport
    /// - `NoDevice` if the platform describes no base channel
    /// - any setup error of the base or a dedicated channel
    pub fn new(
        config: &AgentConfig,
        backend: Box<dyn TransportBackend>,
        discovery: &dyn ResourceDiscovery,
        mapper: &mut dyn RegionMapper,
    ) -> Result<Self> {
        config.validate()?;
        if backend.kind() != config.transport {
            log::error!(
                "scmi: agent configured for {:?} but backend is {:?}",
                config.transport,
                backend.kind()
            );
            return Err(ScmiError::InvalidArgument);
        }

        let base = backend.setup_channel(ChannelId::Base, &discovery.base()?, mapper)?;

        let mut dedicated = BTreeMap::new();
        for subsystem in discovery.subsystems() {
            if let ChannelResolution::Dedicated(resource) = discovery.resolve(subsystem) {
                let channel =
                    backend.setup_channel(ChannelId::Dedicated(subsystem), &resource, mapper)?;
                dedicated.insert(subsystem, Some(channel));
            }
        }

        log::debug!(
            "scmi: agent ready on {:?} with {} dedicated channel(s)",
            config.transport,
            dedicated.len()
        );

        Ok(Self {
            backend,
            base,
            dedicated,
        })
    }

    /// Channel serving `subsystem`: its own if it has one, else the base
    pub fn get_channel(&self, subsystem: SubsystemId) -> ChannelRef {
        if self.dedicated.contains_key(&subsystem) {
            ChannelId::Dedicated(subsystem)
        } else {
            ChannelId::Base
        }
    }

    /// Channel behind `channel`, `None` if unknown or lent out
    pub fn channel(&self, channel: ChannelRef) -> Option<&Channel> {
        match channel {
            ChannelId::Base => Some(&self.base),
            ChannelId::Dedicated(subsystem) => self.dedicated.get(&subsystem)?.as_ref(),
        }
    }

    fn channel_mut(&mut self, channel: ChannelRef) -> Option<&mut Channel> {
        match channel {
            ChannelId::Base => Some(&mut self.base),
            ChannelId::Dedicated(subsystem) => self.dedicated.get_mut(&subsystem)?.as_mut(),
        }
    }

    /// Transport shared by every channel of this agent
    pub fn backend(&self) -> &dyn TransportBackend {
        self.backend.as_ref()
    }

    /// Lend out the dedicated channel of `subsystem`
    ///
    /// Until it is restored, `get_channel` still resolves `subsystem` to it
    /// and `process_msg` on it fails with `InvalidArgument`, so its traffic
    /// never falls back to the base channel.
    pub fn take_channel(&mut self, subsystem: SubsystemId) -> Option<Channel> {
        let channel = self.dedicated.get_mut(&subsystem)?.take();
        if channel.is_some() {
            log::debug!("scmi: dedicated channel {:#x} lent out", subsystem.0);
        }
        channel
    }

    /// Return a channel obtained from [`ScmiAgent::take_channel`]
    ///
    /// # Errors
    /// Returns `InvalidArgument` if this agent did not lend out `channel`;
    /// the channel is dropped
    pub fn restore_channel(&mut self, channel: Channel) -> Result<()> {
        let ChannelId::Dedicated(subsystem) = channel.id() else {
            return Err(ScmiError::InvalidArgument);
        };
        match self.dedicated.get_mut(&subsystem) {
            Some(slot) if slot.is_none() => {
                *slot = Some(channel);
                Ok(())
            }
            _ => Err(ScmiError::InvalidArgument),
        }
    }

    /// Health of `channel`, `None` if the agent has no such channel
    pub fn health(&self, channel: ChannelRef) -> Option<ChannelHealth> {
        self.channel(channel).map(Channel::health)
    }

    /// Run one transaction on `channel`
    ///
    /// Blocks until the reply is in `msg.output` or an error is known.
    /// A faulted channel is recovered first if the platform has released
    /// its buffer since.
    ///
    /// # Errors
    /// - `InvalidArgument` if the agent has no such channel, or it is lent out
    /// - `Faulted` if the channel is faulted and its buffer still owned by
    ///   the platform
    /// - any error of the transport (see [`TransportBackend::process`])
    pub fn process_msg(&mut self, channel: ChannelRef, msg: &mut Message<'_>) -> Result<()> {
        let Self {
            backend,
            base,
            dedicated,
        } = self;
        let target = match channel {
            ChannelId::Base => base,
            ChannelId::Dedicated(subsystem) => dedicated
                .get_mut(&subsystem)
                .and_then(Option::as_mut)
                .ok_or(ScmiError::InvalidArgument)?,
        };

        target.process(backend.as_ref(), msg)
    }

    /// Try to bring a faulted channel back without sending anything
    ///
    /// # Errors
    /// - `InvalidArgument` if the agent has no such channel
    /// - `Faulted` while the platform still owns the buffer
    pub fn recover(&mut self, channel: ChannelRef) -> Result<()> {
        self.channel_mut(channel)
            .ok_or(ScmiError::InvalidArgument)?
            .recover()
    }
}

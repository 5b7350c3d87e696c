//! Transport backends - "deliver this request, wait for the reply"
//!
//! Three delivery mechanisms with very different call shapes sit behind one
//! trait:
//! - [`mailbox`]: ring a doorbell, block on a receive event with a deadline
//! - [`smccc`]: one trapping secure monitor call, reply ready on return
//! - [`optee`]: open a session, negotiate a channel, invoke, close
//!
//! Backends are generic over the collaborator device they drive; the agent
//! holds them as `Box<dyn TransportBackend>`, picked once at setup.

use crate::channel::{Channel, ChannelId};
use crate::config::{ChannelResource, TransportKind};
use crate::message::Message;
use crate::shmem::RegionMapper;
use crate::smt::Smt;
use crate::{Result, ScmiError};

pub mod mailbox;
pub mod optee;
pub mod smccc;

pub use mailbox::{MailboxDevice, MailboxTransport};
pub use optee::{
    InvokeResult, OpteeTransport, SessionHandle, TeeCapabilities, TeeDevice, TeeParam,
};
pub use smccc::{SecureMonitor, SmcResult, SmcccTransport};
#[cfg(target_arch = "aarch64")]
pub use smccc::SmcConduit;

/// Common contract of all transports
pub trait TransportBackend {
    /// Which mechanism this backend implements
    fn kind(&self) -> TransportKind;

    /// Build a channel from its platform resources
    ///
    /// Maps the static region (if any) and performs any one-time
    /// negotiation, so `process` never has to.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the resource lacks something this
    /// transport requires, or the error of the mapping/negotiation step
    fn setup_channel(
        &self,
        id: ChannelId,
        resource: &ChannelResource,
        mapper: &mut dyn RegionMapper,
    ) -> Result<Channel>;

    /// Run one transaction on `channel`
    ///
    /// Blocks until the reply is decoded into `msg` or a definitive error
    /// is known. Never retries.
    fn process(&self, channel: &mut Channel, msg: &mut Message<'_>) -> Result<()>;
}

/// Map the static SMT region every SMT-only transport needs
pub(crate) fn map_smt(
    resource: &ChannelResource,
    mapper: &mut dyn RegionMapper,
) -> Result<Smt> {
    let region = resource.shmem.ok_or(ScmiError::InvalidArgument)?;
    let memory = mapper.map(region)?;
    Ok(Smt::new(memory))
}

/// Decode the reply on an SMT channel and reset its framing
///
/// ERROR is cleared after every completed transaction, including failed
/// ones. A `Busy` read-back means the platform still owns the buffer, so it
/// is left alone.
pub(crate) fn complete_smt(smt: &Smt, msg: &mut Message<'_>) -> Result<()> {
    let result = smt.decode_response(msg);
    if result != Err(ScmiError::Busy) {
        smt.clear_channel();
    }
    result.map(|_| ())
}

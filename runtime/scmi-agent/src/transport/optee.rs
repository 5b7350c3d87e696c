//! OP-TEE session transport
//!
//! The SCMI server lives in a pseudo trusted application inside OP-TEE.
//! Every transaction is its own session:
//!
//! ```text
//! CLOSED -> OPENING -> CHANNEL-NEGOTIATED -> [PREPARE-MEMORY] -> INVOKING
//!        -> [RELEASE-MEMORY] -> CLOSED
//! ```
//!
//! Sessions and per-call memory are held by guards whose `Drop` closes or
//! frees them, so every exit path (including `?`) ends in CLOSED with no
//! memory left allocated.
//!
//! # Framing
//! At channel setup the service's capabilities decide the framing once:
//! - a static region and `SMT_HEADER` support: SMT framing in that region
//! - otherwise `MSG_HEADER` support: header-only framing in 128 bytes of
//!   memory allocated for each call
//! - neither: the channel cannot be used (`NoDevice`)

use bitflags::bitflags;
use uuid::Uuid;

use crate::channel::{Binding, Channel, ChannelId, Framing};
use crate::config::{
    AgentConfig, ChannelResource, TransportKind, DYNAMIC_MSG_SIZE, OPTEE_SCMI_SERVICE,
};
use crate::message::Message;
use crate::msg::{decode_response_msg, encode_request_msg};
use crate::shmem::{RegionMapper, SharedMemory};
use crate::smt::Smt;
use crate::transport::{complete_smt, TransportBackend};
use crate::{Result, ScmiError};

/// Report the service's [`TeeCapabilities`] in value a
pub const CMD_CAPABILITIES: u32 = 0;
/// Process the SMT channel whose handle is in value a
pub const CMD_PROCESS_SMT_CHANNEL: u32 = 1;
// 2 passes an SMT message by memory reference; this agent never sends it
/// Resolve a channel id and capability set into a channel handle
pub const CMD_GET_CHANNEL: u32 = 3;
/// Process a MSG-framed message passed as input/output memory references
pub const CMD_PROCESS_MSG_CHANNEL: u32 = 4;

/// TEE client API success code
pub const TEEC_SUCCESS: u32 = 0;

bitflags! {
    /// Framings the SCMI service can handle
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TeeCapabilities: u32 {
        const SMT_HEADER = 1 << 0;
        const MSG_HEADER = 1 << 1;
    }
}

/// Open session with the TEE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle(pub u32);

/// Outcome reported by the TEE for one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvokeResult {
    pub ret: u32,
    pub ret_origin: u32,
}

impl InvokeResult {
    pub fn success() -> Self {
        Self {
            ret: TEEC_SUCCESS,
            ret_origin: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.ret == TEEC_SUCCESS
    }
}

/// Invocation parameter
///
/// Output variants are updated in place by the TEE: values with the
/// service's answer, memory references with the number of bytes produced.
#[derive(Debug)]
pub enum TeeParam<'a, M: ?Sized> {
    None,
    ValueInput { a: u64, b: u64, c: u64 },
    ValueOutput { a: u64, b: u64, c: u64 },
    ValueInout { a: u64, b: u64, c: u64 },
    MemrefInput { memory: &'a M, size: usize },
    MemrefOutput { memory: &'a M, size: usize },
}

/// TEE driver consumed by the transport
pub trait TeeDevice {
    /// Memory shareable with the secure world
    type Memory: SharedMemory;

    /// # Errors
    /// Any error means no session was opened
    fn open_session(&self, service: &Uuid) -> Result<SessionHandle>;

    /// Invoke `function_id` of the session's service
    ///
    /// # Errors
    /// Errors cover the call itself; the service's own verdict is in
    /// [`InvokeResult`]
    fn invoke(
        &self,
        session: SessionHandle,
        function_id: u32,
        params: &mut [TeeParam<'_, Self::Memory>],
    ) -> Result<InvokeResult>;

    fn close_session(&self, session: SessionHandle);

    /// Allocate `size` bytes registered for `session`
    fn alloc_shared_memory(&self, session: SessionHandle, size: usize) -> Result<Self::Memory>;

    fn free_shared_memory(&self, memory: Self::Memory);
}

/// Open session, closed on drop
struct Session<'d, T: TeeDevice> {
    device: &'d T,
    handle: SessionHandle,
}

impl<T: TeeDevice> Drop for Session<'_, T> {
    fn drop(&mut self) {
        self.device.close_session(self.handle);
        log::debug!("scmi-optee: session {:?} closed", self.handle);
    }
}

/// Per-call memory, freed on drop
struct CallMemory<'d, T: TeeDevice> {
    device: &'d T,
    memory: Option<T::Memory>,
}

impl<'d, T: TeeDevice> CallMemory<'d, T> {
    fn alloc(device: &'d T, session: &Session<'_, T>, size: usize) -> Result<Self> {
        let memory = device.alloc_shared_memory(session.handle, size).map_err(|err| {
            log::error!("scmi-optee: cannot allocate {} bytes: {}", size, err);
            err
        })?;

        Ok(Self {
            device,
            memory: Some(memory),
        })
    }

    fn get(&self) -> Result<&T::Memory> {
        self.memory.as_ref().ok_or(ScmiError::InvalidArgument)
    }
}

impl<T: TeeDevice> Drop for CallMemory<'_, T> {
    fn drop(&mut self) {
        if let Some(memory) = self.memory.take() {
            self.device.free_shared_memory(memory);
        }
    }
}

/// SCMI through the OP-TEE SCMI service
pub struct OpteeTransport<T> {
    device: T,
    service: Uuid,
    msg_size: usize,
}

impl<T: TeeDevice> OpteeTransport<T> {
    /// Transport for the standard SCMI service
    pub fn new(device: T) -> Self {
        Self {
            device,
            service: OPTEE_SCMI_SERVICE,
            msg_size: DYNAMIC_MSG_SIZE,
        }
    }

    /// Transport configured from agent settings
    ///
    /// # Errors
    /// Returns `InvalidArgument` if `config` is not a valid OP-TEE config
    pub fn with_config(device: T, config: &AgentConfig) -> Result<Self> {
        config.validate()?;
        if config.transport != TransportKind::Optee {
            return Err(ScmiError::InvalidArgument);
        }

        Ok(Self {
            device,
            service: config.tee_service,
            msg_size: config.dynamic_msg_size,
        })
    }

    pub fn device(&self) -> &T {
        &self.device
    }

    fn open(&self) -> Result<Session<'_, T>> {
        let handle = self.device.open_session(&self.service).map_err(|err| {
            log::error!("scmi-optee: cannot open session with {}: {}", self.service, err);
            ScmiError::NoDevice
        })?;

        log::debug!("scmi-optee: session {:?} opened", handle);
        Ok(Session {
            device: &self.device,
            handle,
        })
    }

    fn invoke(
        &self,
        session: &Session<'_, T>,
        command: u32,
        params: &mut [TeeParam<'_, T::Memory>],
    ) -> Result<()> {
        let result = self
            .device
            .invoke(session.handle, command, params)
            .map_err(|err| {
                log::error!("scmi-optee: command {} failed: {}", command, err);
                ScmiError::Protocol
            })?;

        if !result.is_success() {
            log::error!(
                "scmi-optee: command {} returned {:#x} (origin {})",
                command,
                result.ret,
                result.ret_origin
            );
            return Err(ScmiError::Protocol);
        }

        Ok(())
    }

    /// Ask the service which framings it handles
    ///
    /// # Errors
    /// - `NoDevice` if no session can be opened
    /// - `Protocol` if the service does not answer the query
    pub fn capabilities(&self) -> Result<TeeCapabilities> {
        let session = self.open()?;
        let mut params = [TeeParam::ValueOutput { a: 0, b: 0, c: 0 }];
        self.invoke(&session, CMD_CAPABILITIES, &mut params)?;

        match params[0] {
            TeeParam::ValueOutput { a, .. } => Ok(TeeCapabilities::from_bits_truncate(a as u32)),
            _ => Err(ScmiError::Protocol),
        }
    }

    fn get_channel(
        &self,
        session: &Session<'_, T>,
        channel_id: u32,
        caps: TeeCapabilities,
    ) -> Result<u64> {
        let mut params = [TeeParam::ValueInout {
            a: channel_id as u64,
            b: caps.bits() as u64,
            c: 0,
        }];
        self.invoke(session, CMD_GET_CHANNEL, &mut params)?;

        match params[0] {
            TeeParam::ValueInout { a, .. } => Ok(a),
            _ => Err(ScmiError::Protocol),
        }
    }

    fn process_smt(
        &self,
        session: &Session<'_, T>,
        handle: u64,
        smt: &Smt,
        msg: &mut Message<'_>,
    ) -> Result<()> {
        smt.encode_request(msg)?;

        let mut params = [TeeParam::ValueInput { a: handle, b: 0, c: 0 }];
        if let Err(err) = self.invoke(session, CMD_PROCESS_SMT_CHANNEL, &mut params) {
            // The invocation returned, so the service is done with the region
            smt.reclaim();
            return Err(err);
        }

        complete_smt(smt, msg)
    }

    fn process_msg(
        &self,
        session: &Session<'_, T>,
        handle: u64,
        max_size: usize,
        msg: &mut Message<'_>,
    ) -> Result<()> {
        let call_memory = CallMemory::alloc(&self.device, session, max_size)?;
        let memory = call_memory.get()?;
        let in_size = encode_request_msg(memory, msg)?;

        let mut params = [
            TeeParam::ValueInput { a: handle, b: 0, c: 0 },
            TeeParam::MemrefInput { memory, size: in_size },
            TeeParam::MemrefOutput { memory, size: max_size },
        ];
        self.invoke(session, CMD_PROCESS_MSG_CHANNEL, &mut params)?;

        let out_size = match params[2] {
            TeeParam::MemrefOutput { size, .. } => size,
            _ => return Err(ScmiError::Protocol),
        };
        decode_response_msg(memory, out_size, msg).map(|_| ())
    }
}

impl<T: TeeDevice> TransportBackend for OpteeTransport<T> {
    fn kind(&self) -> TransportKind {
        TransportKind::Optee
    }

    fn setup_channel(
        &self,
        id: ChannelId,
        resource: &ChannelResource,
        mapper: &mut dyn RegionMapper,
    ) -> Result<Channel> {
        let channel_id = resource.tee_channel.ok_or(ScmiError::InvalidArgument)?;
        let caps = self.capabilities()?;

        let framing = match resource.shmem {
            Some(region) if caps.contains(TeeCapabilities::SMT_HEADER) => {
                Framing::Smt(Smt::new(mapper.map(region)?))
            }
            _ if caps.contains(TeeCapabilities::MSG_HEADER) => Framing::Msg {
                max_size: self.msg_size,
            },
            _ => {
                log::error!(
                    "scmi-optee: channel {:?} has no usable framing (caps {:?}, static shmem: {})",
                    id,
                    caps,
                    resource.shmem.is_some()
                );
                return Err(ScmiError::NoDevice);
            }
        };

        log::debug!(
            "scmi-optee: channel {:?} tee channel {} framing {:?}",
            id,
            channel_id,
            framing
        );

        Ok(Channel::new(id, framing, Binding::Optee { channel_id }))
    }

    fn process(&self, channel: &mut Channel, msg: &mut Message<'_>) -> Result<()> {
        let Binding::Optee { channel_id } = channel.binding() else {
            return Err(ScmiError::InvalidArgument);
        };

        let session = self.open()?;
        let caps = match channel.framing() {
            Framing::Smt(_) => TeeCapabilities::SMT_HEADER,
            Framing::Msg { .. } => TeeCapabilities::MSG_HEADER,
        };
        let handle = self.get_channel(&session, channel_id, caps)?;
        log::debug!(
            "scmi-optee: channel {} handle {:#x} protocol {:#x} message {:#x}",
            channel_id,
            handle,
            msg.protocol_id,
            msg.message_id
        );

        match channel.framing() {
            Framing::Smt(smt) => self.process_smt(&session, handle, smt, msg),
            Framing::Msg { max_size } => self.process_msg(&session, handle, *max_size, msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::MessageHeader;
    use crate::shmem::HeapRegion;
    use crate::smt::{ChannelState, ChannelStatus};
    use crate::transport::test_support::{answer, HeapMapper};
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::cell::{Cell, RefCell};

    #[derive(Default)]
    struct MockTee {
        caps: Cell<u32>,
        refuse_open: Cell<bool>,
        refuse_get_channel: Cell<bool>,
        process_status: Cell<u32>,
        region: RefCell<Option<Arc<HeapRegion>>>,
        opened: Cell<u32>,
        closed: Cell<u32>,
        allocated: Cell<u32>,
        freed: Cell<u32>,
        commands: RefCell<Vec<u32>>,
        requested_caps: RefCell<Vec<u64>>,
    }

    impl MockTee {
        fn with_caps(caps: TeeCapabilities) -> Self {
            let tee = Self::default();
            tee.caps.set(caps.bits());
            tee
        }
    }

    impl TeeDevice for MockTee {
        type Memory = Arc<HeapRegion>;

        fn open_session(&self, service: &Uuid) -> Result<SessionHandle> {
            assert_eq!(*service, OPTEE_SCMI_SERVICE);
            if self.refuse_open.get() {
                return Err(ScmiError::NoDevice);
            }
            self.opened.set(self.opened.get() + 1);
            Ok(SessionHandle(self.opened.get()))
        }

        fn invoke(
            &self,
            _session: SessionHandle,
            function_id: u32,
            params: &mut [TeeParam<'_, Self::Memory>],
        ) -> Result<InvokeResult> {
            self.commands.borrow_mut().push(function_id);
            match function_id {
                CMD_CAPABILITIES => {
                    params[0] = TeeParam::ValueOutput { a: self.caps.get() as u64, b: 0, c: 0 };
                }
                CMD_GET_CHANNEL => {
                    if self.refuse_get_channel.get() {
                        return Err(ScmiError::Protocol);
                    }
                    if let TeeParam::ValueInout { a, b, .. } = params[0] {
                        self.requested_caps.borrow_mut().push(b);
                        params[0] = TeeParam::ValueInout { a: a + 0x100, b: 0, c: 0 };
                    }
                }
                CMD_PROCESS_SMT_CHANNEL => {
                    if self.process_status.get() == TEEC_SUCCESS {
                        let region = self.region.borrow();
                        answer(region.as_ref().unwrap(), &[0, 0, 0, 0, 1], ChannelStatus::FREE);
                    }
                }
                CMD_PROCESS_MSG_CHANNEL => {
                    let TeeParam::MemrefInput { memory, size } = params[1] else {
                        return Err(ScmiError::InvalidArgument);
                    };
                    let mut header = [0u8; 4];
                    memory.read(0, &mut header);
                    let header = MessageHeader::from_bytes(header).unwrap();
                    assert_eq!(size, 4 + 2);

                    // Reply: same header, status 0, echo protocol id
                    memory.write(4, &[0, 0, 0, 0, header.protocol_id]);
                    if let TeeParam::MemrefOutput { size, .. } = &mut params[2] {
                        *size = 9;
                    }
                }
                _ => return Err(ScmiError::NotSupported),
            }

            match function_id {
                CMD_PROCESS_SMT_CHANNEL | CMD_PROCESS_MSG_CHANNEL => Ok(InvokeResult {
                    ret: self.process_status.get(),
                    ret_origin: 3,
                }),
                _ => Ok(InvokeResult::success()),
            }
        }

        fn close_session(&self, _session: SessionHandle) {
            self.closed.set(self.closed.get() + 1);
        }

        fn alloc_shared_memory(&self, _session: SessionHandle, size: usize) -> Result<Self::Memory> {
            self.allocated.set(self.allocated.get() + 1);
            Ok(Arc::new(HeapRegion::new(size, 0xA000)))
        }

        fn free_shared_memory(&self, _memory: Self::Memory) {
            self.freed.set(self.freed.get() + 1);
        }
    }

    fn resource(shmem: bool) -> ChannelResource {
        let base = if shmem {
            ChannelResource::with_shmem(0x6000, 128)
        } else {
            ChannelResource::default()
        };
        ChannelResource {
            tee_channel: Some(2),
            ..base
        }
    }

    fn setup(
        caps: TeeCapabilities,
        shmem: bool,
    ) -> (OpteeTransport<MockTee>, Result<Channel>, HeapMapper) {
        let transport = OpteeTransport::new(MockTee::with_caps(caps));
        let mut mapper = HeapMapper::default();
        let channel = transport.setup_channel(ChannelId::Base, &resource(shmem), &mut mapper);
        if let Some(region) = mapper.regions.get(&0x6000) {
            *transport.device().region.borrow_mut() = Some(region.clone());
        }
        (transport, channel, mapper)
    }

    fn balanced(tee: &MockTee) -> bool {
        tee.opened.get() == tee.closed.get() && tee.allocated.get() == tee.freed.get()
    }

    #[test]
    fn test_static_framing_preferred() {
        let caps = TeeCapabilities::SMT_HEADER | TeeCapabilities::MSG_HEADER;
        let (_transport, channel, _mapper) = setup(caps, true);
        assert!(matches!(channel.unwrap().framing(), Framing::Smt(_)));
    }

    #[test]
    fn test_dynamic_framing_without_static_region() {
        let (_transport, channel, mapper) = setup(TeeCapabilities::MSG_HEADER, false);
        assert!(matches!(channel.unwrap().framing(), Framing::Msg { max_size: 128 }));
        assert!(mapper.regions.is_empty());
    }

    #[test]
    fn test_capability_fallback_never_allocates() {
        let (transport, channel, _mapper) = setup(TeeCapabilities::SMT_HEADER, true);
        let mut channel = channel.unwrap();
        assert!(matches!(channel.framing(), Framing::Smt(_)));

        let mut out = [0u8; 8];
        let mut msg = Message::new(0x13, 0x01, &[4, 0, 0, 0], &mut out);
        assert_eq!(transport.process(&mut channel, &mut msg), Ok(()));
        assert_eq!(msg.response(), &[0, 0, 0, 0, 1]);

        let tee = transport.device();
        assert_eq!(tee.allocated.get(), 0);
        assert_eq!(
            *tee.requested_caps.borrow(),
            vec![TeeCapabilities::SMT_HEADER.bits() as u64]
        );
        assert!(balanced(tee));
    }

    #[test]
    fn test_no_usable_framing() {
        let (transport, channel, _mapper) = setup(TeeCapabilities::SMT_HEADER, false);
        assert!(matches!(channel, Err(ScmiError::NoDevice)));
        assert_eq!(transport.device().allocated.get(), 0);
        assert!(balanced(transport.device()));
    }

    #[test]
    fn test_dynamic_transaction() {
        let (transport, channel, _mapper) = setup(TeeCapabilities::MSG_HEADER, false);
        let mut channel = channel.unwrap();
        let mut out = [0u8; 16];
        let mut msg = Message::new(0x14, 0x07, &[0xAA, 0xBB], &mut out);

        assert_eq!(transport.process(&mut channel, &mut msg), Ok(()));
        assert_eq!(msg.response(), &[0, 0, 0, 0, 0x14]);

        let tee = transport.device();
        assert_eq!(tee.allocated.get(), 1);
        assert_eq!(
            *tee.commands.borrow(),
            vec![CMD_CAPABILITIES, CMD_GET_CHANNEL, CMD_PROCESS_MSG_CHANNEL]
        );
        assert_eq!(
            *tee.requested_caps.borrow(),
            vec![TeeCapabilities::MSG_HEADER.bits() as u64]
        );
        assert!(balanced(tee));
    }

    #[test]
    fn test_open_failure_is_no_device() {
        let (transport, channel, _mapper) = setup(TeeCapabilities::MSG_HEADER, false);
        let mut channel = channel.unwrap();
        transport.device().refuse_open.set(true);

        let mut out = [0u8; 16];
        let mut msg = Message::new(0x14, 0x07, &[0xAA, 0xBB], &mut out);
        assert_eq!(transport.process(&mut channel, &mut msg), Err(ScmiError::NoDevice));
        assert!(balanced(transport.device()));
    }

    #[test]
    fn test_get_channel_failure_closes_session() {
        let (transport, channel, _mapper) = setup(TeeCapabilities::MSG_HEADER, false);
        let mut channel = channel.unwrap();
        transport.device().refuse_get_channel.set(true);

        let mut out = [0u8; 16];
        let mut msg = Message::new(0x14, 0x07, &[0xAA, 0xBB], &mut out);
        assert_eq!(transport.process(&mut channel, &mut msg), Err(ScmiError::Protocol));
        assert_eq!(transport.device().opened.get(), 2);
        assert_eq!(transport.device().allocated.get(), 0);
        assert!(balanced(transport.device()));
    }

    #[test]
    fn test_remote_status_failure_releases_everything() {
        let (transport, channel, _mapper) = setup(TeeCapabilities::MSG_HEADER, false);
        let mut channel = channel.unwrap();
        transport.device().process_status.set(0xFFFF_0006);

        let mut out = [0u8; 16];
        let mut msg = Message::new(0x14, 0x07, &[0xAA, 0xBB], &mut out);
        assert_eq!(transport.process(&mut channel, &mut msg), Err(ScmiError::Protocol));
        assert_eq!(transport.device().allocated.get(), 1);
        assert!(balanced(transport.device()));
    }

    #[test]
    fn test_smt_invoke_failure_reclaims_region() {
        let caps = TeeCapabilities::SMT_HEADER;
        let (transport, channel, mapper) = setup(caps, true);
        let mut channel = channel.unwrap();

        // Capabilities and channel lookup succeed, processing fails
        let mut out = [0u8; 16];
        let mut msg = Message::new(0x14, 0x07, &[], &mut out);
        transport.device().process_status.set(0xFFFF_000C);
        let result = transport.process(&mut channel, &mut msg);

        assert_eq!(result, Err(ScmiError::Protocol));
        let region = &mapper.regions[&0x6000];
        let status = ChannelStatus::from_bits_truncate(region.read_u32(4));
        assert_eq!(ChannelState::from_status(status), ChannelState::Idle);
        assert!(balanced(transport.device()));
    }
}

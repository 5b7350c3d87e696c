//! End-to-end tests of the OP-TEE transport against the sandbox service
//!
//! Every test also checks that all sessions were closed and all per-call
//! memory was released, whatever the outcome.

use std::rc::Rc;

use scmi_agent::transport::optee::{
    CMD_CAPABILITIES, CMD_GET_CHANNEL, CMD_PROCESS_MSG_CHANNEL, CMD_PROCESS_SMT_CHANNEL,
};
use scmi_agent::transport::{OpteeTransport, TeeCapabilities};
use scmi_agent::*;
use scmi_sandbox::controller::{BASE_PROTOCOL_VERSION, PROTOCOL_VERSION};
use scmi_sandbox::*;

const SHMEM: usize = 0x6000_0000;
const TEE_CHANNEL: u32 = 0;

fn tee_channel(shmem: bool) -> ChannelResource {
    let resource = if shmem {
        ChannelResource::with_shmem(SHMEM, 128)
    } else {
        ChannelResource::default()
    };
    ChannelResource {
        tee_channel: Some(TEE_CHANNEL),
        ..resource
    }
}

fn setup(
    caps: TeeCapabilities,
    shmem: bool,
) -> (Rc<SandboxController>, SandboxTee, Result<ScmiAgent>) {
    let controller = Rc::new(SandboxController::new());
    let tee = SandboxTee::new(controller.clone(), caps);
    tee.bind(TEE_CHANNEL, SHMEM);

    let agent = ScmiAgent::new(
        &AgentConfig::new(TransportKind::Optee),
        Box::new(OpteeTransport::new(tee.clone())),
        &StaticPlatform::new(tee_channel(shmem)),
        &mut SandboxMapper::new(controller.clone()),
    );

    (controller, tee, agent)
}

fn base_version(agent: &mut ScmiAgent) -> Result<u32> {
    let mut out = [0u8; 8];
    let mut msg = Message::new(ProtocolId::BASE, PROTOCOL_VERSION, &[], &mut out);
    agent.process_msg(ChannelId::Base, &mut msg)?;
    msg.check_status()?;
    Ok(u32::from_le_bytes(msg.response()[4..8].try_into().unwrap()))
}

/// Test the static SMT path when both framings are offered
#[test]
fn test_static_channel_preferred() {
    let both = TeeCapabilities::SMT_HEADER | TeeCapabilities::MSG_HEADER;
    let (controller, tee, agent) = setup(both, true);
    let mut agent = agent.unwrap();

    let channel = agent.channel(ChannelId::Base).unwrap();
    assert!(matches!(channel.framing(), Framing::Smt(_)));

    assert_eq!(base_version(&mut agent), Ok(BASE_PROTOCOL_VERSION));
    assert_eq!(
        tee.commands(),
        vec![CMD_CAPABILITIES, CMD_GET_CHANNEL, CMD_PROCESS_SMT_CHANNEL]
    );
    assert_eq!(tee.allocations(), 0);
    assert_eq!(controller.requests().len(), 1);
    assert!(tee.is_balanced());
}

/// Test the dynamic MSG path when no static region exists
#[test]
fn test_dynamic_channel() {
    let (controller, tee, agent) = setup(TeeCapabilities::MSG_HEADER, false);
    let mut agent = agent.unwrap();

    let channel = agent.channel(ChannelId::Base).unwrap();
    assert!(matches!(channel.framing(), Framing::Msg { max_size: 128 }));
    assert!(controller.region_at(SHMEM).is_none());

    let input = [0x02, 0x00, 0x00, 0x00];
    let mut out = [0u8; 16];
    let mut msg = Message::new(ProtocolId::RESET_DOMAIN, 0x04, &input, &mut out);
    agent.process_msg(ChannelId::Base, &mut msg).unwrap();

    assert_eq!(msg.response(), &[0, 0, 0, 0, 2, 0, 0, 0]);
    assert_eq!(
        tee.commands(),
        vec![CMD_CAPABILITIES, CMD_GET_CHANNEL, CMD_PROCESS_MSG_CHANNEL]
    );
    assert_eq!(tee.allocations(), 1);
    assert!(tee.is_balanced());
}

/// Test a service offering only SMT framing with no static region
#[test]
fn test_no_usable_framing() {
    let (_controller, tee, agent) = setup(TeeCapabilities::SMT_HEADER, false);

    assert!(matches!(agent, Err(ScmiError::NoDevice)));
    assert_eq!(tee.allocations(), 0);
    assert!(tee.is_balanced());
}

/// Test an unreachable service
#[test]
fn test_service_unavailable() {
    let controller = Rc::new(SandboxController::new());
    let tee = SandboxTee::new(controller.clone(), TeeCapabilities::MSG_HEADER);
    tee.set_available(false);

    let agent = ScmiAgent::new(
        &AgentConfig::new(TransportKind::Optee),
        Box::new(OpteeTransport::new(tee.clone())),
        &StaticPlatform::new(tee_channel(false)),
        &mut SandboxMapper::new(controller),
    );

    assert!(matches!(agent, Err(ScmiError::NoDevice)));
    assert_eq!(tee.sessions_opened(), 0);
}

/// Test a session per transaction, every one closed
#[test]
fn test_session_per_transaction() {
    let (_controller, tee, agent) = setup(TeeCapabilities::MSG_HEADER, false);
    let mut agent = agent.unwrap();

    for _ in 0..5 {
        assert_eq!(base_version(&mut agent), Ok(BASE_PROTOCOL_VERSION));
    }

    // One for the capability query at setup
    assert_eq!(tee.sessions_opened(), 6);
    assert_eq!(tee.sessions_open(), 0);
    assert_eq!(tee.allocations(), 5);
    assert!(tee.is_balanced());
}

/// Test a failed invocation on the static path: buffer handed back
#[test]
fn test_static_invoke_failure_reclaims_buffer() {
    let (controller, tee, agent) = setup(TeeCapabilities::SMT_HEADER, true);
    let mut agent = agent.unwrap();
    controller.inject(Fault::NotSupported);

    assert_eq!(base_version(&mut agent), Err(ScmiError::Protocol));
    let region = controller.region_at(SHMEM).unwrap();
    let status = ChannelStatus::from_bits_truncate(region.read_u32(4));
    assert_eq!(ChannelState::from_status(status), ChannelState::Idle);
    assert!(tee.is_balanced());

    assert_eq!(base_version(&mut agent), Ok(BASE_PROTOCOL_VERSION));
}

/// Test ERROR raised by the service on the static path
#[test]
fn test_static_error_bit() {
    let (controller, tee, agent) = setup(TeeCapabilities::SMT_HEADER, true);
    let mut agent = agent.unwrap();
    controller.inject(Fault::ErrorBit);

    assert_eq!(base_version(&mut agent), Err(ScmiError::CommError));
    assert_eq!(base_version(&mut agent), Ok(BASE_PROTOCOL_VERSION));
    assert!(tee.is_balanced());
}

/// Test failures on the dynamic path release the per-call memory
#[test]
fn test_dynamic_failures_release_memory() {
    let (controller, tee, agent) = setup(TeeCapabilities::MSG_HEADER, false);
    let mut agent = agent.unwrap();

    controller.inject(Fault::ErrorBit);
    assert_eq!(base_version(&mut agent), Err(ScmiError::Protocol));

    controller.inject(Fault::OversizedLength);
    assert_eq!(base_version(&mut agent), Err(ScmiError::Protocol));

    controller.inject(Fault::NotSupported);
    assert_eq!(base_version(&mut agent), Err(ScmiError::Protocol));

    assert_eq!(tee.allocations(), 3);
    assert!(tee.is_balanced());
    assert_eq!(agent.health(ChannelId::Base), Some(ChannelHealth::Ready));
    assert_eq!(base_version(&mut agent), Ok(BASE_PROTOCOL_VERSION));
}

/// Test a request larger than the per-call memory
#[test]
fn test_dynamic_request_too_large() {
    let (controller, tee, agent) = setup(TeeCapabilities::MSG_HEADER, false);
    let mut agent = agent.unwrap();
    let input = [0u8; 125];
    let mut out = [0u8; 8];
    let mut msg = Message::new(ProtocolId::SENSOR, 0x06, &input, &mut out);

    assert_eq!(
        agent.process_msg(ChannelId::Base, &mut msg),
        Err(ScmiError::TooSmall { needed: 129, available: 128 })
    );
    assert!(controller.requests().is_empty());
    assert!(tee.is_balanced());
}

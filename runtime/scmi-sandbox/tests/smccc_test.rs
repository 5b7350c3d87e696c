//! End-to-end tests of the SMC transport against the sandbox monitor

use std::rc::Rc;

use scmi_agent::transport::SmcccTransport;
use scmi_agent::*;
use scmi_sandbox::controller::{BASE_DISCOVER_VENDOR, PROTOCOL_ATTRIBUTES, VENDOR_ID_SIZE};
use scmi_sandbox::*;

const BASE_SHMEM: usize = 0x4000_0000;
const BASE_FID: u32 = 0x8200_0010;
const PERF_SHMEM: usize = 0x4000_1000;
const PERF_FID: u32 = 0x8200_0011;
const PERF: SubsystemId = SubsystemId(ProtocolId::PERF as u32);

fn smc_channel(function_id: u32, paddr: usize) -> ChannelResource {
    ChannelResource {
        smc_id: Some(function_id),
        ..ChannelResource::with_shmem(paddr, 128)
    }
}

fn setup() -> (Rc<SandboxController>, SandboxMonitor, ScmiAgent) {
    let controller = Rc::new(SandboxController::with_vendor("kaal-scp"));
    let monitor = SandboxMonitor::new(controller.clone());
    monitor.bind(BASE_FID, BASE_SHMEM);
    monitor.bind(PERF_FID, PERF_SHMEM);

    let platform = StaticPlatform::new(smc_channel(BASE_FID, BASE_SHMEM))
        .with_dedicated(PERF, smc_channel(PERF_FID, PERF_SHMEM));

    let agent = ScmiAgent::new(
        &AgentConfig::new(TransportKind::Smccc),
        Box::new(SmcccTransport::new(monitor.clone())),
        &platform,
        &mut SandboxMapper::new(controller.clone()),
    )
    .expect("smc agent setup");

    (controller, monitor, agent)
}

fn state_at(controller: &SandboxController, paddr: usize) -> ChannelState {
    let region = controller.region_at(paddr).unwrap();
    ChannelState::from_status(ChannelStatus::from_bits_truncate(region.read_u32(4)))
}

/// Test vendor discovery through a single SMC
#[test]
fn test_discover_vendor() {
    let (_controller, monitor, mut agent) = setup();
    let mut out = [0u8; 4 + VENDOR_ID_SIZE];
    let mut msg = Message::new(ProtocolId::BASE, BASE_DISCOVER_VENDOR, &[], &mut out);

    agent.process_msg(ChannelId::Base, &mut msg).unwrap();

    assert_eq!(msg.check_status(), Ok(()));
    assert_eq!(&msg.response()[4..12], b"kaal-scp");
    assert_eq!(monitor.calls(), vec![BASE_FID]);
}

/// Test that a subsystem with its own channel uses its own function id
#[test]
fn test_dedicated_channel_uses_own_function() {
    let (controller, monitor, mut agent) = setup();

    let perf = agent.get_channel(PERF);
    assert_eq!(perf, ChannelId::Dedicated(PERF));
    assert_eq!(agent.get_channel(SubsystemId(0x14)), ChannelId::Base);

    let mut out = [0u8; 8];
    let mut msg = Message::new(ProtocolId::PERF, 0x07, &[3, 0, 0, 0], &mut out);
    agent.process_msg(perf, &mut msg).unwrap();

    assert_eq!(msg.response(), &[0, 0, 0, 0, 3, 0, 0, 0]);
    assert_eq!(monitor.calls(), vec![PERF_FID]);
    assert_eq!(state_at(&controller, PERF_SHMEM), ChannelState::Idle);
    assert_eq!(state_at(&controller, BASE_SHMEM), ChannelState::Idle);
}

/// Test NOT_SUPPORTED from the monitor: buffer left as written, cause kept
#[test]
fn test_not_supported_leaves_buffer_alone() {
    let (controller, monitor, mut agent) = setup();
    controller.inject(Fault::NotSupported);

    let mut out = [0xAAu8; 8];
    let mut msg = Message::new(ProtocolId::BASE, PROTOCOL_ATTRIBUTES, &[], &mut out);
    assert_eq!(agent.process_msg(ChannelId::Base, &mut msg), Err(ScmiError::NotSupported));
    assert_eq!(msg.output_len(), 0);
    assert_eq!(state_at(&controller, BASE_SHMEM), ChannelState::RequestPending);
    assert!(controller.requests().is_empty());
    assert_eq!(
        agent.health(ChannelId::Base),
        Some(ChannelHealth::Faulted(ScmiError::NotSupported))
    );

    // The next request is refused without another SMC
    let mut msg = Message::new(ProtocolId::BASE, PROTOCOL_ATTRIBUTES, &[], &mut out);
    assert_eq!(agent.process_msg(ChannelId::Base, &mut msg), Err(ScmiError::Faulted));
    assert_eq!(monitor.calls(), vec![BASE_FID]);
    assert_eq!(
        agent.health(ChannelId::Base),
        Some(ChannelHealth::Faulted(ScmiError::NotSupported))
    );
}

/// Test a monitor returning before the platform released the buffer
#[test]
fn test_busy_readback_then_recovery() {
    let (controller, monitor, mut agent) = setup();
    controller.inject(Fault::DropReply);

    let mut out = [0u8; 8];
    let mut msg = Message::new(ProtocolId::BASE, PROTOCOL_ATTRIBUTES, &[], &mut out);
    assert_eq!(agent.process_msg(ChannelId::Base, &mut msg), Err(ScmiError::Busy));
    assert_eq!(agent.recover(ChannelId::Base), Err(ScmiError::Faulted));

    // Other channels are unaffected
    let perf = agent.get_channel(PERF);
    let mut msg = Message::new(ProtocolId::PERF, 0x01, &[], &mut out);
    assert_eq!(agent.process_msg(perf, &mut msg), Ok(()));

    assert!(controller.service_smt(BASE_SHMEM, None));
    assert_eq!(agent.recover(ChannelId::Base), Ok(()));

    let mut msg = Message::new(ProtocolId::BASE, PROTOCOL_ATTRIBUTES, &[], &mut out);
    assert_eq!(agent.process_msg(ChannelId::Base, &mut msg), Ok(()));
    assert_eq!(msg.response(), &[0, 0, 0, 0, 7, 1, 0, 0]);
    assert_eq!(monitor.calls(), vec![BASE_FID, PERF_FID, BASE_FID]);
}

/// Test that setup fails without a function id
#[test]
fn test_missing_function_id() {
    let controller = Rc::new(SandboxController::new());
    let platform = StaticPlatform::new(ChannelResource::with_shmem(BASE_SHMEM, 128));

    let result = ScmiAgent::new(
        &AgentConfig::new(TransportKind::Smccc),
        Box::new(SmcccTransport::new(SandboxMonitor::new(controller.clone()))),
        &platform,
        &mut SandboxMapper::new(controller),
    );
    assert!(matches!(result, Err(ScmiError::InvalidArgument)));
}

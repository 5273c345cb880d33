//! Central-role scenarios: connection lifecycle, command queue ordering,
//! retries and bonding, driven through the simulated transport.
//!
//! Run with:
//!   cargo test --test central_orchestration

use std::sync::Arc;
use std::time::Duration;

use gattlink::ble::gatt::{uuid_from_short, CCC_DESCRIPTOR_UUID};
use gattlink::ble::simulated::{SimCall, SimPeer, SimTransport};
use gattlink::ble::status::{BondState, ConnectionState, GattStatus, HciStatus, WriteType};
use gattlink::ble::transport::CentralTransportEvent;
use gattlink::{
    peripheral_channel, AcceptAll, BleError, CentralEvent, CharacteristicId, Command, DeviceId,
    Engine, EngineConfig, EngineEvents, EngineHandle, EventSink, GattCharacteristic, GattService,
    PeripheralEvent, Properties,
};
use tokio::sync::mpsc::UnboundedReceiver;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    sim: Arc<SimTransport>,
    engine: EngineHandle,
    events: EngineEvents,
    sink: EventSink,
}

fn start(config: EngineConfig) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let sim = SimTransport::new();
    let (engine, events) = Engine::start(config, sim.clone(), sim.clone(), Arc::new(AcceptAll));
    let sink = engine.event_sink();
    Harness { sim, engine, events, sink }
}

fn device() -> DeviceId {
    DeviceId::parse("C0:FF:EE:00:00:01").unwrap()
}

fn heart_rate() -> CharacteristicId {
    CharacteristicId::new(uuid_from_short(0x180D), uuid_from_short(0x2A37))
}

fn control_point() -> CharacteristicId {
    CharacteristicId::new(uuid_from_short(0x180D), uuid_from_short(0x2A39))
}

fn body_location() -> CharacteristicId {
    CharacteristicId::new(uuid_from_short(0x180D), uuid_from_short(0x2A38))
}

fn services() -> Vec<GattService> {
    vec![GattService::new(uuid_from_short(0x180D))
        .with_characteristic(
            GattCharacteristic::new(heart_rate().characteristic, Properties::NOTIFY)
                .with_descriptor(CCC_DESCRIPTOR_UUID),
        )
        .with_characteristic(GattCharacteristic::new(
            control_point().characteristic,
            Properties::WRITE | Properties::READ,
        ))
        .with_characteristic(
            GattCharacteristic::new(body_location().characteristic, Properties::READ)
                .with_descriptor(CCC_DESCRIPTOR_UUID),
        )]
}

fn drain<T>(rx: &mut UnboundedReceiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

fn link(device: &DeviceId, status: HciStatus, state: ConnectionState) -> CentralTransportEvent {
    CentralTransportEvent::ConnectionStateChanged { device: device.clone(), status, state }
}

/// Connect `device` by hand and return its listener once discovery is done.
async fn connect(h: &mut Harness, device: &DeviceId) -> UnboundedReceiver<PeripheralEvent> {
    let (listener, mut rx) = peripheral_channel();
    h.engine.connect(device, Some(listener)).await.unwrap();
    h.sink.post(link(device, HciStatus::Success, ConnectionState::Connected));
    h.sink.post(CentralTransportEvent::ServicesDiscovered {
        device: device.clone(),
        status: GattStatus::Success,
        services: services(),
    });
    h.engine.barrier().await.unwrap();
    assert_eq!(drain(&mut h.events.central), vec![CentralEvent::Connected(device.clone())]);
    assert!(matches!(rx.try_recv(), Ok(PeripheralEvent::ServicesDiscovered { .. })));
    h.sim.take_calls();
    rx
}

fn read_done(device: &DeviceId, characteristic: CharacteristicId, value: Vec<u8>, status: GattStatus) -> CentralTransportEvent {
    CentralTransportEvent::CharacteristicRead { device: device.clone(), characteristic, value, status }
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_duplicate_connect_never_reaches_transport() {
    let mut h = start(EngineConfig::default());
    let id = device();

    h.engine.connect(&id, None).await.unwrap();
    assert_eq!(h.engine.connect(&id, None).await, Err(BleError::ConnectionInProgress));
    assert_eq!(h.sim.count(|c| matches!(c, SimCall::Connect { .. })), 1);

    h.sink.post(link(&id, HciStatus::Success, ConnectionState::Connected));
    h.sink.post(CentralTransportEvent::ServicesDiscovered {
        device: id.clone(),
        status: GattStatus::Success,
        services: services(),
    });
    h.engine.barrier().await.unwrap();
    assert_eq!(h.engine.connect(&id, None).await, Err(BleError::AlreadyConnected));
    assert_eq!(h.sim.count(|c| matches!(c, SimCall::Connect { .. })), 1);
    assert_eq!(drain(&mut h.events.central), vec![CentralEvent::Connected(id)]);
}

#[tokio::test]
async fn test_connection_failure_retried_exactly_once() {
    let mut h = start(EngineConfig::default());
    let id = device();

    h.engine.connect(&id, None).await.unwrap();
    h.sink.post(link(&id, HciStatus::RemoteDeviceTerminatedLowResources, ConnectionState::Disconnected));
    h.engine.barrier().await.unwrap();
    assert_eq!(h.sim.count(|c| matches!(c, SimCall::Connect { .. })), 2);
    assert!(drain(&mut h.events.central).is_empty());

    h.sink.post(link(&id, HciStatus::RemoteDeviceTerminatedLowResources, ConnectionState::Disconnected));
    h.engine.barrier().await.unwrap();
    assert_eq!(h.sim.count(|c| matches!(c, SimCall::Connect { .. })), 2);
    assert_eq!(
        drain(&mut h.events.central),
        vec![CentralEvent::ConnectionFailed {
            device: id.clone(),
            status: HciStatus::RemoteDeviceTerminatedLowResources,
        }]
    );
    assert_eq!(h.engine.device(&id).await.unwrap().pool, None);
}

#[tokio::test]
async fn test_establishment_failure_is_not_retried() {
    let mut h = start(EngineConfig::default());
    let id = device();

    h.engine.connect(&id, None).await.unwrap();
    h.sink.post(link(&id, HciStatus::ConnectionFailedEstablishment, ConnectionState::Disconnected));
    h.engine.barrier().await.unwrap();
    assert_eq!(h.sim.count(|c| matches!(c, SimCall::Connect { .. })), 1);
    assert_eq!(
        drain(&mut h.events.central),
        vec![CentralEvent::ConnectionFailed { device: id, status: HciStatus::ConnectionFailedEstablishment }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_connection_timeout_synthesizes_establishment_failure() {
    let mut h = start(EngineConfig::default());
    let id = device();

    h.engine.connect(&id, None).await.unwrap();
    tokio::time::sleep(Duration::from_secs(36)).await;
    h.engine.barrier().await.unwrap();

    assert_eq!(h.sim.count(|c| matches!(c, SimCall::Disconnect(_))), 1);
    assert_eq!(h.sim.count(|c| matches!(c, SimCall::Connect { .. })), 1);
    assert_eq!(
        drain(&mut h.events.central),
        vec![CentralEvent::ConnectionFailed { device: id.clone(), status: HciStatus::ConnectionFailedEstablishment }]
    );
    assert_eq!(h.engine.device(&id).await.unwrap().state, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_late_generic_error_is_reclassified() {
    let config = EngineConfig { establishment_failure_threshold: Duration::from_secs(5), ..Default::default() };
    let mut h = start(config);
    let id = device();

    h.engine.connect(&id, None).await.unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;
    h.sink.post(link(&id, HciStatus::Error, ConnectionState::Disconnected));
    h.engine.barrier().await.unwrap();

    assert_eq!(h.sim.count(|c| matches!(c, SimCall::Connect { .. })), 1);
    assert_eq!(
        drain(&mut h.events.central),
        vec![CentralEvent::ConnectionFailed { device: id, status: HciStatus::ConnectionFailedEstablishment }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_connecting_completes_locally() {
    let mut h = start(EngineConfig::default());
    let id = device();

    h.engine.connect(&id, None).await.unwrap();
    h.engine.cancel_connection(&id).await.unwrap();
    assert_eq!(h.engine.device(&id).await.unwrap().state, ConnectionState::Disconnecting);

    tokio::time::sleep(Duration::from_millis(100)).await;
    h.engine.barrier().await.unwrap();

    assert_eq!(
        drain(&mut h.events.central),
        vec![CentralEvent::Disconnected { device: id.clone(), status: HciStatus::Success }]
    );
    assert_eq!(h.engine.device(&id).await.unwrap().state, ConnectionState::Disconnected);
    assert_eq!(h.sim.count(|c| matches!(c, SimCall::Close(_))), 1);
}

#[tokio::test]
async fn test_discovery_failure_disconnects() {
    let h = start(EngineConfig::default());
    let id = device();

    h.engine.connect(&id, None).await.unwrap();
    h.sink.post(link(&id, HciStatus::Success, ConnectionState::Connected));
    h.sink.post(CentralTransportEvent::ServicesDiscovered {
        device: id.clone(),
        status: GattStatus::Failure,
        services: Vec::new(),
    });
    h.engine.barrier().await.unwrap();
    assert_eq!(h.sim.count(|c| *c == SimCall::Disconnect(id.clone())), 1);
}

// ---------------------------------------------------------------------------
// Command queue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_read_completes_before_write_dispatches() {
    let mut h = start(EngineConfig::default());
    let id = device();
    let mut rx = connect(&mut h, &id).await;

    h.engine.enqueue(&id, Command::Read(control_point())).await.unwrap();
    h.engine
        .enqueue(
            &id,
            Command::Write { characteristic: control_point(), value: vec![0x01], write_type: WriteType::WithResponse },
        )
        .await
        .unwrap();
    assert_eq!(
        h.sim.take_calls(),
        vec![SimCall::ReadCharacteristic { device: id.clone(), characteristic: control_point() }]
    );

    h.sink.post(read_done(&id, control_point(), vec![0x07], GattStatus::Success));
    h.engine.barrier().await.unwrap();
    assert!(matches!(h.sim.take_calls().as_slice(), [SimCall::WriteCharacteristic { .. }]));

    h.sink.post(CentralTransportEvent::CharacteristicWritten {
        device: id.clone(),
        characteristic: control_point(),
        status: GattStatus::Success,
    });
    h.engine.barrier().await.unwrap();

    assert_eq!(
        drain(&mut rx),
        vec![
            PeripheralEvent::CharacteristicRead {
                device: id.clone(),
                characteristic: control_point(),
                value: vec![0x07],
                status: GattStatus::Success,
            },
            PeripheralEvent::CharacteristicWritten {
                device: id,
                characteristic: control_point(),
                value: vec![0x01],
                status: GattStatus::Success,
            },
        ]
    );
}

#[tokio::test]
async fn test_at_most_one_command_in_flight() {
    let mut h = start(EngineConfig::default());
    let id = device();
    let mut rx = connect(&mut h, &id).await;

    for _ in 0..5 {
        h.engine.enqueue(&id, Command::Read(control_point())).await.unwrap();
    }
    assert_eq!(h.sim.count(|c| matches!(c, SimCall::ReadCharacteristic { .. })), 1);
    assert_eq!(h.engine.device(&id).await.unwrap().queued_commands, 5);

    for i in 0..5u8 {
        h.sink.post(read_done(&id, control_point(), vec![i], GattStatus::Success));
        h.engine.barrier().await.unwrap();
        let in_flight = h.sim.count(|c| matches!(c, SimCall::ReadCharacteristic { .. }));
        assert_eq!(in_flight, usize::from(i + 2).min(5));
    }

    let values: Vec<Vec<u8>> = drain(&mut rx)
        .into_iter()
        .map(|e| match e {
            PeripheralEvent::CharacteristicRead { value, .. } => value,
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(values, vec![vec![0], vec![1], vec![2], vec![3], vec![4]]);
}

#[tokio::test]
async fn test_commands_rejected_synchronously() {
    let mut h = start(EngineConfig::default());
    let id = device();

    assert!(matches!(
        h.engine.enqueue(&id, Command::ReadRssi).await,
        Err(BleError::UnknownDevice(_))
    ));
    h.engine.device(&id).await.unwrap();
    assert_eq!(h.engine.enqueue(&id, Command::ReadRssi).await, Err(BleError::NotConnected));

    let _rx = connect(&mut h, &id).await;
    let missing = CharacteristicId::new(uuid_from_short(0x180F), uuid_from_short(0x2A19));
    assert!(matches!(
        h.engine.enqueue(&id, Command::Read(missing)).await,
        Err(BleError::AttributeNotFound(_))
    ));
    assert!(matches!(
        h.engine.enqueue(&id, Command::Read(heart_rate())).await,
        Err(BleError::NotSupported(_))
    ));
    assert_eq!(
        h.engine
            .enqueue(
                &id,
                Command::Write { characteristic: control_point(), value: vec![], write_type: WriteType::WithResponse },
            )
            .await,
        Err(BleError::InvalidLength { len: 0, max: 512 })
    );
    assert!(matches!(
        h.engine
            .enqueue(
                &id,
                Command::Write {
                    characteristic: control_point(),
                    value: vec![1],
                    write_type: WriteType::WithoutResponse,
                },
            )
            .await,
        Err(BleError::NotSupported(_))
    ));
    assert_eq!(h.engine.enqueue(&id, Command::RequestMtu(600)).await, Err(BleError::InvalidMtu(600)));
    assert!(h.sim.calls().is_empty());
    assert_eq!(h.engine.device(&id).await.unwrap().queued_commands, 0);
}

#[tokio::test]
async fn test_recoverable_failure_retried_then_surfaced() {
    let mut h = start(EngineConfig::default());
    let id = device();
    let mut rx = connect(&mut h, &id).await;

    h.engine.enqueue(&id, Command::Read(control_point())).await.unwrap();
    h.sink.post(read_done(&id, control_point(), vec![], GattStatus::InsufficientAuthentication));
    h.engine.barrier().await.unwrap();
    assert_eq!(h.sim.count(|c| matches!(c, SimCall::ReadCharacteristic { .. })), 2);
    assert!(drain(&mut rx).is_empty());

    h.sink.post(read_done(&id, control_point(), vec![], GattStatus::InsufficientAuthentication));
    h.engine.barrier().await.unwrap();
    assert_eq!(h.sim.count(|c| matches!(c, SimCall::ReadCharacteristic { .. })), 2);
    assert_eq!(
        drain(&mut rx),
        vec![PeripheralEvent::CharacteristicRead {
            device: id.clone(),
            characteristic: control_point(),
            value: vec![],
            status: GattStatus::InsufficientAuthentication,
        }]
    );
    assert_eq!(h.engine.device(&id).await.unwrap().queued_commands, 0);
}

#[tokio::test]
async fn test_refused_dispatch_fails_and_queue_continues() {
    let mut h = start(EngineConfig::default());
    let id = device();
    let mut rx = connect(&mut h, &id).await;

    h.sim.refuse_next(|c| matches!(c, SimCall::ReadCharacteristic { .. }));
    h.engine.enqueue(&id, Command::Read(control_point())).await.unwrap();
    h.engine.enqueue(&id, Command::ReadRssi).await.unwrap();

    assert!(matches!(
        drain(&mut rx).as_slice(),
        [PeripheralEvent::CharacteristicRead { status: GattStatus::Failure, .. }]
    ));
    assert_eq!(h.sim.count(|c| matches!(c, SimCall::ReadRssi(_))), 1);
}

#[tokio::test]
async fn test_subscribe_without_capability_rejected() {
    let mut h = start(EngineConfig::default());
    let id = device();
    let _rx = connect(&mut h, &id).await;

    let result = h
        .engine
        .enqueue(&id, Command::SetSubscription { characteristic: body_location(), enable: true })
        .await;
    assert!(matches!(result, Err(BleError::NotSupported(_))));
    assert!(h.engine.device(&id).await.unwrap().subscriptions.is_empty());
    assert!(h.sim.calls().is_empty());
}

#[tokio::test]
async fn test_subscribe_writes_ccc_and_tracks_state() {
    let mut h = start(EngineConfig::default());
    let id = device();
    let mut rx = connect(&mut h, &id).await;

    h.engine
        .enqueue(&id, Command::SetSubscription { characteristic: heart_rate(), enable: true })
        .await
        .unwrap();
    assert_eq!(
        h.sim.take_calls(),
        vec![
            SimCall::SetNotification { device: id.clone(), characteristic: heart_rate(), enable: true },
            SimCall::WriteDescriptor { device: id.clone(), descriptor: heart_rate().ccc(), value: vec![0x01, 0x00] },
        ]
    );

    h.sink.post(CentralTransportEvent::DescriptorWritten {
        device: id.clone(),
        descriptor: heart_rate().ccc(),
        status: GattStatus::Success,
    });
    h.sink.post(CentralTransportEvent::CharacteristicChanged {
        device: id.clone(),
        characteristic: heart_rate(),
        value: vec![0x00, 0x48],
    });
    h.engine.barrier().await.unwrap();

    assert_eq!(
        drain(&mut rx),
        vec![
            PeripheralEvent::NotificationStateUpdate {
                device: id.clone(),
                characteristic: heart_rate(),
                enabled: true,
                status: GattStatus::Success,
            },
            PeripheralEvent::CharacteristicChanged {
                device: id.clone(),
                characteristic: heart_rate(),
                value: vec![0x00, 0x48],
            },
        ]
    );
    assert_eq!(h.engine.device(&id).await.unwrap().subscriptions, vec![heart_rate()]);
}

#[tokio::test]
async fn test_disconnect_fails_queue_and_resets_session() {
    let mut h = start(EngineConfig::default());
    let id = device();
    let mut rx = connect(&mut h, &id).await;

    h.engine.enqueue(&id, Command::RequestMtu(185)).await.unwrap();
    h.sink.post(CentralTransportEvent::MtuChanged { device: id.clone(), mtu: 185, status: GattStatus::Success });
    h.engine.barrier().await.unwrap();
    assert_eq!(h.engine.device(&id).await.unwrap().mtu, 185);
    drain(&mut rx);

    h.engine.enqueue(&id, Command::Read(control_point())).await.unwrap();
    h.engine.enqueue(&id, Command::ReadRssi).await.unwrap();
    h.sink.post(link(&id, HciStatus::RemoteUserTerminatedConnection, ConnectionState::Disconnected));
    h.engine.barrier().await.unwrap();

    let events = drain(&mut rx);
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], PeripheralEvent::CharacteristicRead { status: GattStatus::Failure, .. }));
    assert!(matches!(events[1], PeripheralEvent::RssiRead { status: GattStatus::Failure, .. }));
    assert_eq!(
        drain(&mut h.events.central),
        vec![CentralEvent::Disconnected { device: id.clone(), status: HciStatus::RemoteUserTerminatedConnection }]
    );

    let info = h.engine.device(&id).await.unwrap();
    assert_eq!(info.state, ConnectionState::Disconnected);
    assert_eq!(info.mtu, 23);
    assert_eq!(info.queued_commands, 0);
    assert_eq!(info.pool, None);
}

#[tokio::test]
async fn test_unsolicited_mtu_change_does_not_complete_other_command() {
    let mut h = start(EngineConfig::default());
    let id = device();
    let mut rx = connect(&mut h, &id).await;

    h.engine.enqueue(&id, Command::ReadRssi).await.unwrap();
    h.sink.post(CentralTransportEvent::MtuChanged { device: id.clone(), mtu: 247, status: GattStatus::Success });
    h.engine.barrier().await.unwrap();

    assert_eq!(
        drain(&mut rx),
        vec![PeripheralEvent::MtuChanged { device: id.clone(), mtu: 247, status: GattStatus::Success }]
    );
    assert_eq!(h.engine.device(&id).await.unwrap().queued_commands, 1);
}

#[tokio::test]
async fn test_reported_mtu_is_kept_in_range() {
    let mut h = start(EngineConfig::default());
    let id = device();
    let signed = CharacteristicId::new(uuid_from_short(0x180D), uuid_from_short(0x2A3A));
    let mut table = services();
    table[0].characteristics.push(GattCharacteristic::new(signed.characteristic, Properties::SIGNED_WRITE));

    h.engine.connect(&id, None).await.unwrap();
    h.sink.post(link(&id, HciStatus::Success, ConnectionState::Connected));
    h.sink.post(CentralTransportEvent::ServicesDiscovered { device: id.clone(), status: GattStatus::Success, services: table });
    h.sink.post(CentralTransportEvent::MtuChanged { device: id.clone(), mtu: 10, status: GattStatus::Success });
    h.engine.barrier().await.unwrap();
    assert_eq!(h.engine.device(&id).await.unwrap().mtu, 23);

    // 23 - 15 bytes fit a signed write.
    let write = |len: usize| Command::Write { characteristic: signed, value: vec![0xA5; len], write_type: WriteType::Signed };
    assert_eq!(h.engine.enqueue(&id, write(9)).await, Err(BleError::InvalidLength { len: 9, max: 8 }));
    h.engine.enqueue(&id, write(8)).await.unwrap();

    h.sink.post(CentralTransportEvent::MtuChanged { device: id.clone(), mtu: 1000, status: GattStatus::Success });
    h.engine.barrier().await.unwrap();
    assert_eq!(h.engine.device(&id).await.unwrap().mtu, 517);
    assert!(h.engine.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_connection_priority_completes_after_settle() {
    let mut h = start(EngineConfig::default());
    let id = device();
    let mut rx = connect(&mut h, &id).await;

    h.engine
        .enqueue(&id, Command::RequestConnectionPriority(gattlink::ble::status::ConnectionPriority::High))
        .await
        .unwrap();
    h.engine.enqueue(&id, Command::ReadRssi).await.unwrap();
    assert_eq!(h.sim.count(|c| matches!(c, SimCall::ReadRssi(_))), 0);

    tokio::time::sleep(Duration::from_millis(600)).await;
    h.engine.barrier().await.unwrap();
    assert_eq!(
        drain(&mut rx),
        vec![PeripheralEvent::ConnectionPriorityUpdated { device: id, status: GattStatus::Success }]
    );
    assert_eq!(h.sim.count(|c| matches!(c, SimCall::ReadRssi(_))), 1);
}

#[tokio::test(start_paused = true)]
async fn test_service_change_fails_queue_and_rediscovers() {
    let mut h = start(EngineConfig::default());
    let id = device();
    let mut rx = connect(&mut h, &id).await;

    h.engine.enqueue(&id, Command::Read(control_point())).await.unwrap();
    h.sink.post(CentralTransportEvent::ServiceChanged { device: id.clone() });
    h.engine.barrier().await.unwrap();
    assert!(matches!(
        drain(&mut rx).as_slice(),
        [PeripheralEvent::CharacteristicRead { status: GattStatus::Failure, .. }]
    ));

    tokio::time::sleep(Duration::from_millis(150)).await;
    h.engine.barrier().await.unwrap();
    assert_eq!(h.sim.count(|c| *c == SimCall::DiscoverServices(id.clone())), 1);
}

// ---------------------------------------------------------------------------
// Bonding
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_remote_bonding_pauses_and_resumes_queue() {
    let mut h = start(EngineConfig::default());
    let id = device();
    let mut rx = connect(&mut h, &id).await;

    h.sink.post(CentralTransportEvent::BondStateChanged {
        device: id.clone(),
        state: BondState::Bonding,
        previous: BondState::None,
    });
    h.engine.barrier().await.unwrap();
    h.engine.enqueue(&id, Command::Read(control_point())).await.unwrap();
    assert_eq!(h.sim.count(|c| matches!(c, SimCall::ReadCharacteristic { .. })), 0);

    h.sink.post(CentralTransportEvent::BondStateChanged {
        device: id.clone(),
        state: BondState::Bonded,
        previous: BondState::Bonding,
    });
    h.engine.barrier().await.unwrap();
    assert_eq!(h.sim.count(|c| matches!(c, SimCall::ReadCharacteristic { .. })), 1);
    assert_eq!(
        drain(&mut rx),
        vec![PeripheralEvent::BondingStarted(id.clone()), PeripheralEvent::BondingSucceeded(id)]
    );
}

#[tokio::test]
async fn test_manual_bond_blocks_queue_until_resolved() {
    let mut h = start(EngineConfig::default());
    let id = device();
    let mut rx = connect(&mut h, &id).await;

    h.engine.create_bond(&id, None).await.unwrap();
    h.engine.enqueue(&id, Command::ReadRssi).await.unwrap();
    assert_eq!(h.sim.take_calls(), vec![SimCall::CreateBond(id.clone())]);

    h.sink.post(CentralTransportEvent::BondStateChanged {
        device: id.clone(),
        state: BondState::Bonding,
        previous: BondState::None,
    });
    h.engine.barrier().await.unwrap();
    assert_eq!(h.engine.create_bond(&id, None).await, Err(BleError::BondingInProgress));

    h.sink.post(CentralTransportEvent::BondStateChanged {
        device: id.clone(),
        state: BondState::None,
        previous: BondState::Bonding,
    });
    h.engine.barrier().await.unwrap();
    assert_eq!(h.sim.take_calls(), vec![SimCall::ReadRssi(id.clone())]);
    assert_eq!(
        drain(&mut rx),
        vec![PeripheralEvent::BondingStarted(id.clone()), PeripheralEvent::BondingFailed(id)]
    );
}

#[tokio::test]
async fn test_bond_without_link_goes_straight_to_transport() {
    let h = start(EngineConfig::default());
    let id = device();

    h.engine.create_bond(&id, None).await.unwrap();
    assert_eq!(h.sim.take_calls(), vec![SimCall::CreateBond(id.clone())]);

    // A bond that completes with no link connects.
    h.sink.post(CentralTransportEvent::BondStateChanged {
        device: id.clone(),
        state: BondState::Bonded,
        previous: BondState::Bonding,
    });
    h.engine.barrier().await.unwrap();
    assert_eq!(h.sim.take_calls(), vec![SimCall::Connect { device: id, auto_connect: false }]);
}

#[tokio::test(start_paused = true)]
async fn test_bond_loss_disconnects_and_reports_after_settle() {
    let mut h = start(EngineConfig::default());
    let id = device();
    let mut rx = connect(&mut h, &id).await;

    h.sink.post(CentralTransportEvent::BondStateChanged {
        device: id.clone(),
        state: BondState::None,
        previous: BondState::Bonded,
    });
    tokio::time::sleep(Duration::from_millis(150)).await;
    h.engine.barrier().await.unwrap();
    assert_eq!(drain(&mut rx), vec![PeripheralEvent::BondLost(id.clone())]);
    assert_eq!(h.sim.count(|c| *c == SimCall::Disconnect(id.clone())), 1);

    h.sink.post(link(&id, HciStatus::Success, ConnectionState::Disconnected));
    h.engine.barrier().await.unwrap();
    assert!(drain(&mut h.events.central).is_empty());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    h.engine.barrier().await.unwrap();
    assert_eq!(
        drain(&mut h.events.central),
        vec![CentralEvent::Disconnected { device: id, status: HciStatus::AuthenticationFailure }]
    );
}

// ---------------------------------------------------------------------------
// End to end with an answering peer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_peer_round_trip() -> anyhow::Result<()> {
    let mut h = start(EngineConfig::default());
    let id = device();
    h.sim.attach(h.engine.event_sink());
    h.sim.add_peer(id.clone(), SimPeer::new(services()).with_value(control_point(), vec![0x2A]));

    let (listener, mut rx) = peripheral_channel();
    h.engine.connect(&id, Some(listener)).await?;
    h.engine.barrier().await?;
    h.engine.barrier().await?;
    assert_eq!(drain(&mut h.events.central), vec![CentralEvent::Connected(id.clone())]);

    h.engine.enqueue(&id, Command::Read(control_point())).await?;
    h.engine
        .enqueue(
            &id,
            Command::Write { characteristic: control_point(), value: vec![0x55], write_type: WriteType::WithResponse },
        )
        .await?;
    h.engine.enqueue(&id, Command::Read(control_point())).await?;
    for _ in 0..3 {
        h.engine.barrier().await?;
    }

    let reads: Vec<Vec<u8>> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            PeripheralEvent::CharacteristicRead { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(reads, vec![vec![0x2A], vec![0x55]]);
    assert_eq!(h.sim.peer_value(&id, &control_point()), Some(vec![0x55]));

    h.engine.cancel_connection(&id).await?;
    h.engine.barrier().await?;
    assert_eq!(
        drain(&mut h.events.central),
        vec![CentralEvent::Disconnected { device: id, status: HciStatus::Success }]
    );
    Ok(())
}

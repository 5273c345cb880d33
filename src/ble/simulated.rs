//! In-process transport for tests
//!
//! Records every call the engine makes and lets a test decide what the
//! "radio" answers. Events can be posted by hand through the engine's
//! [`EventSink`], or a registered [`SimPeer`] can answer central-role calls
//! automatically once a sink is attached.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

use super::gatt::{CharacteristicId, DescriptorId, DeviceId, GattService};
use super::status::{
    BondState, ConnectionPriority, ConnectionState, GattStatus, HciStatus, PhyOptions, PhyType, WriteType,
};
use super::transport::{
    AdvertiseData, AdvertiseSettings, CentralTransport, CentralTransportEvent, ScanFilter, ScanKind,
    ServerTransport, ServerTransportEvent, TransportEvent,
};
use super::BleError;
use crate::engine::EventSink;

/// One call made against the simulated transport.
#[derive(Debug, Clone, PartialEq)]
pub enum SimCall {
    StartScan { kind: ScanKind, filters: Vec<ScanFilter> },
    StopScan(ScanKind),
    Connect { device: DeviceId, auto_connect: bool },
    Disconnect(DeviceId),
    Close(DeviceId),
    DiscoverServices(DeviceId),
    ReadCharacteristic { device: DeviceId, characteristic: CharacteristicId },
    WriteCharacteristic {
        device: DeviceId,
        characteristic: CharacteristicId,
        value: Vec<u8>,
        write_type: WriteType,
    },
    ReadDescriptor { device: DeviceId, descriptor: DescriptorId },
    WriteDescriptor { device: DeviceId, descriptor: DescriptorId, value: Vec<u8> },
    SetNotification { device: DeviceId, characteristic: CharacteristicId, enable: bool },
    ReadRssi(DeviceId),
    RequestMtu { device: DeviceId, mtu: u16 },
    SetPreferredPhy { device: DeviceId, tx: PhyType, rx: PhyType, options: PhyOptions },
    ReadPhy(DeviceId),
    RequestConnectionPriority { device: DeviceId, priority: ConnectionPriority },
    CreateBond(DeviceId),
    RemoveBond(DeviceId),
    SetPairingPin { device: DeviceId, pin: String },
    AddService(Uuid),
    RemoveService(Uuid),
    ClearServices,
    SendResponse {
        central: DeviceId,
        request_id: u32,
        status: GattStatus,
        offset: usize,
        value: Vec<u8>,
    },
    Notify { central: DeviceId, characteristic: CharacteristicId, confirm: bool, value: Vec<u8> },
    CancelConnection(DeviceId),
    StartAdvertising,
    StopAdvertising,
    CloseServer,
}

/// A remote device that answers central-role calls by itself.
#[derive(Debug, Clone, Default)]
pub struct SimPeer {
    pub services: Vec<GattService>,
    pub values: HashMap<CharacteristicId, Vec<u8>>,
    pub rssi: i16,
}

impl SimPeer {
    pub fn new(services: Vec<GattService>) -> Self {
        Self { services, values: HashMap::new(), rssi: -60 }
    }

    pub fn with_value(mut self, characteristic: CharacteristicId, value: Vec<u8>) -> Self {
        self.values.insert(characteristic, value);
        self
    }
}

type Refusal = Box<dyn Fn(&SimCall) -> bool + Send>;

#[derive(Default)]
struct SimState {
    calls: Vec<SimCall>,
    cached: HashSet<DeviceId>,
    bonds: HashMap<DeviceId, BondState>,
    refusals: Vec<Refusal>,
    sink: Option<EventSink>,
    peers: HashMap<DeviceId, SimPeer>,
    server_auto_ack: bool,
}

/// Recording, scriptable implementation of both transport traits.
pub struct SimTransport {
    state: Mutex<SimState>,
    enabled: AtomicBool,
}

impl SimTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(SimState::default()), enabled: AtomicBool::new(true) })
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Let registered peers and the server side answer through `sink`.
    pub fn attach(&self, sink: EventSink) {
        self.lock().sink = Some(sink);
    }

    pub fn add_peer(&self, device: DeviceId, peer: SimPeer) {
        let mut state = self.lock();
        state.cached.insert(device.clone());
        state.peers.insert(device, peer);
    }

    /// Current value of a peer characteristic, including values written by the engine.
    pub fn peer_value(&self, device: &DeviceId, characteristic: &CharacteristicId) -> Option<Vec<u8>> {
        self.lock().peers.get(device).and_then(|p| p.values.get(characteristic).cloned())
    }

    /// Acknowledge service additions, advertising and notifications automatically.
    pub fn set_server_auto_ack(&self, enabled: bool) {
        self.lock().server_auto_ack = enabled;
    }

    pub fn set_cached(&self, device: &DeviceId, cached: bool) {
        let mut state = self.lock();
        if cached {
            state.cached.insert(device.clone());
        } else {
            state.cached.remove(device);
        }
    }

    pub fn set_bond_state(&self, device: &DeviceId, bond_state: BondState) {
        self.lock().bonds.insert(device.clone(), bond_state);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Fail the next call matching `predicate` as if the platform refused to start it.
    pub fn refuse_next(&self, predicate: impl Fn(&SimCall) -> bool + Send + 'static) {
        self.lock().refusals.push(Box::new(predicate));
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.lock().calls.clone()
    }

    pub fn take_calls(&self) -> Vec<SimCall> {
        std::mem::take(&mut self.lock().calls)
    }

    pub fn count(&self, predicate: impl Fn(&SimCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    fn record(&self, call: SimCall) -> Result<(), BleError> {
        let mut state = self.lock();
        log::debug!("sim: {:?}", call);
        let refused = state.refusals.iter().position(|refuse| refuse(&call));
        state.calls.push(call);
        match refused {
            Some(index) => {
                state.refusals.remove(index);
                Err(BleError::Transport("refused by simulator".to_string()))
            }
            None => Ok(()),
        }
    }

    fn post(&self, event: impl Into<TransportEvent>) {
        if let Some(sink) = &self.lock().sink {
            sink.post(event);
        }
    }

    /// Run `f` against an attached peer; `None` when nothing should answer.
    fn with_peer<R>(&self, device: &DeviceId, f: impl FnOnce(&mut SimPeer) -> R) -> Option<R> {
        let mut state = self.lock();
        if state.sink.is_none() {
            return None;
        }
        state.peers.get_mut(device).map(f)
    }

    fn server_acks(&self) -> bool {
        let state = self.lock();
        state.server_auto_ack && state.sink.is_some()
    }
}

#[async_trait]
impl CentralTransport for SimTransport {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn is_cached(&self, device: &DeviceId) -> bool {
        self.lock().cached.contains(device)
    }

    fn bond_state(&self, device: &DeviceId) -> BondState {
        self.lock().bonds.get(device).copied().unwrap_or_default()
    }

    async fn start_scan(&self, kind: ScanKind, filters: &[ScanFilter]) -> Result<(), BleError> {
        self.record(SimCall::StartScan { kind, filters: filters.to_vec() })
    }

    async fn stop_scan(&self, kind: ScanKind) -> Result<(), BleError> {
        self.record(SimCall::StopScan(kind))
    }

    async fn connect(&self, device: &DeviceId, auto_connect: bool) -> Result<(), BleError> {
        self.record(SimCall::Connect { device: device.clone(), auto_connect })?;
        if self.with_peer(device, |_| ()).is_some() {
            self.post(CentralTransportEvent::ConnectionStateChanged {
                device: device.clone(),
                status: HciStatus::Success,
                state: ConnectionState::Connected,
            });
        }
        Ok(())
    }

    async fn disconnect(&self, device: &DeviceId) -> Result<(), BleError> {
        self.record(SimCall::Disconnect(device.clone()))?;
        if self.with_peer(device, |_| ()).is_some() {
            self.post(CentralTransportEvent::ConnectionStateChanged {
                device: device.clone(),
                status: HciStatus::Success,
                state: ConnectionState::Disconnected,
            });
        }
        Ok(())
    }

    async fn close(&self, device: &DeviceId) {
        let _ = self.record(SimCall::Close(device.clone()));
    }

    async fn discover_services(&self, device: &DeviceId) -> Result<(), BleError> {
        self.record(SimCall::DiscoverServices(device.clone()))?;
        if let Some(services) = self.with_peer(device, |p| p.services.clone()) {
            self.post(CentralTransportEvent::ServicesDiscovered {
                device: device.clone(),
                status: GattStatus::Success,
                services,
            });
        }
        Ok(())
    }

    async fn read_characteristic(&self, device: &DeviceId, characteristic: &CharacteristicId) -> Result<(), BleError> {
        self.record(SimCall::ReadCharacteristic { device: device.clone(), characteristic: *characteristic })?;
        if let Some(value) = self.with_peer(device, |p| p.values.get(characteristic).cloned()) {
            let (value, status) = match value {
                Some(value) => (value, GattStatus::Success),
                None => (Vec::new(), GattStatus::ReadNotPermitted),
            };
            self.post(CentralTransportEvent::CharacteristicRead {
                device: device.clone(),
                characteristic: *characteristic,
                value,
                status,
            });
        }
        Ok(())
    }

    async fn write_characteristic(
        &self,
        device: &DeviceId,
        characteristic: &CharacteristicId,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), BleError> {
        self.record(SimCall::WriteCharacteristic {
            device: device.clone(),
            characteristic: *characteristic,
            value: value.to_vec(),
            write_type,
        })?;
        if self
            .with_peer(device, |p| p.values.insert(*characteristic, value.to_vec()))
            .is_some()
        {
            self.post(CentralTransportEvent::CharacteristicWritten {
                device: device.clone(),
                characteristic: *characteristic,
                status: GattStatus::Success,
            });
        }
        Ok(())
    }

    async fn read_descriptor(&self, device: &DeviceId, descriptor: &DescriptorId) -> Result<(), BleError> {
        self.record(SimCall::ReadDescriptor { device: device.clone(), descriptor: *descriptor })?;
        if self.with_peer(device, |_| ()).is_some() {
            self.post(CentralTransportEvent::DescriptorRead {
                device: device.clone(),
                descriptor: *descriptor,
                value: Vec::new(),
                status: GattStatus::Success,
            });
        }
        Ok(())
    }

    async fn write_descriptor(&self, device: &DeviceId, descriptor: &DescriptorId, value: &[u8]) -> Result<(), BleError> {
        self.record(SimCall::WriteDescriptor {
            device: device.clone(),
            descriptor: *descriptor,
            value: value.to_vec(),
        })?;
        if self.with_peer(device, |_| ()).is_some() {
            self.post(CentralTransportEvent::DescriptorWritten {
                device: device.clone(),
                descriptor: *descriptor,
                status: GattStatus::Success,
            });
        }
        Ok(())
    }

    async fn set_notification(
        &self,
        device: &DeviceId,
        characteristic: &CharacteristicId,
        enable: bool,
    ) -> Result<(), BleError> {
        self.record(SimCall::SetNotification { device: device.clone(), characteristic: *characteristic, enable })
    }

    async fn read_rssi(&self, device: &DeviceId) -> Result<(), BleError> {
        self.record(SimCall::ReadRssi(device.clone()))?;
        if let Some(rssi) = self.with_peer(device, |p| p.rssi) {
            self.post(CentralTransportEvent::RssiRead { device: device.clone(), rssi, status: GattStatus::Success });
        }
        Ok(())
    }

    async fn request_mtu(&self, device: &DeviceId, mtu: u16) -> Result<(), BleError> {
        self.record(SimCall::RequestMtu { device: device.clone(), mtu })?;
        if self.with_peer(device, |_| ()).is_some() {
            self.post(CentralTransportEvent::MtuChanged { device: device.clone(), mtu, status: GattStatus::Success });
        }
        Ok(())
    }

    async fn set_preferred_phy(
        &self,
        device: &DeviceId,
        tx: PhyType,
        rx: PhyType,
        options: PhyOptions,
    ) -> Result<(), BleError> {
        self.record(SimCall::SetPreferredPhy { device: device.clone(), tx, rx, options })?;
        if self.with_peer(device, |_| ()).is_some() {
            self.post(CentralTransportEvent::PhyUpdated { device: device.clone(), tx, rx, status: GattStatus::Success });
        }
        Ok(())
    }

    async fn read_phy(&self, device: &DeviceId) -> Result<(), BleError> {
        self.record(SimCall::ReadPhy(device.clone()))?;
        if self.with_peer(device, |_| ()).is_some() {
            self.post(CentralTransportEvent::PhyRead {
                device: device.clone(),
                tx: PhyType::Le1M,
                rx: PhyType::Le1M,
                status: GattStatus::Success,
            });
        }
        Ok(())
    }

    async fn request_connection_priority(
        &self,
        device: &DeviceId,
        priority: ConnectionPriority,
    ) -> Result<(), BleError> {
        self.record(SimCall::RequestConnectionPriority { device: device.clone(), priority })
    }

    async fn create_bond(&self, device: &DeviceId) -> Result<(), BleError> {
        self.record(SimCall::CreateBond(device.clone()))?;
        if self.with_peer(device, |_| ()).is_some() {
            self.lock().bonds.insert(device.clone(), BondState::Bonded);
            self.post(CentralTransportEvent::BondStateChanged {
                device: device.clone(),
                state: BondState::Bonding,
                previous: BondState::None,
            });
            self.post(CentralTransportEvent::BondStateChanged {
                device: device.clone(),
                state: BondState::Bonded,
                previous: BondState::Bonding,
            });
        }
        Ok(())
    }

    async fn remove_bond(&self, device: &DeviceId) -> Result<(), BleError> {
        self.record(SimCall::RemoveBond(device.clone()))?;
        self.lock().bonds.remove(device);
        Ok(())
    }

    async fn set_pairing_pin(&self, device: &DeviceId, pin: &str) -> Result<(), BleError> {
        self.record(SimCall::SetPairingPin { device: device.clone(), pin: pin.to_string() })
    }
}

#[async_trait]
impl ServerTransport for SimTransport {
    async fn add_service(&self, service: &GattService) -> Result<(), BleError> {
        self.record(SimCall::AddService(service.uuid))?;
        if self.server_acks() {
            self.post(ServerTransportEvent::ServiceAdded { service: service.uuid, status: GattStatus::Success });
        }
        Ok(())
    }

    async fn remove_service(&self, service: Uuid) -> Result<(), BleError> {
        self.record(SimCall::RemoveService(service))
    }

    async fn clear_services(&self) {
        let _ = self.record(SimCall::ClearServices);
    }

    async fn send_response(
        &self,
        central: &DeviceId,
        request_id: u32,
        status: GattStatus,
        offset: usize,
        value: &[u8],
    ) -> Result<(), BleError> {
        self.record(SimCall::SendResponse {
            central: central.clone(),
            request_id,
            status,
            offset,
            value: value.to_vec(),
        })
    }

    async fn notify(
        &self,
        central: &DeviceId,
        characteristic: &CharacteristicId,
        confirm: bool,
        value: &[u8],
    ) -> Result<(), BleError> {
        self.record(SimCall::Notify {
            central: central.clone(),
            characteristic: *characteristic,
            confirm,
            value: value.to_vec(),
        })?;
        if self.server_acks() {
            self.post(ServerTransportEvent::NotificationSent { central: central.clone(), status: GattStatus::Success });
        }
        Ok(())
    }

    async fn cancel_connection(&self, central: &DeviceId) -> Result<(), BleError> {
        self.record(SimCall::CancelConnection(central.clone()))
    }

    async fn start_advertising(
        &self,
        _settings: &AdvertiseSettings,
        _data: &AdvertiseData,
        _scan_response: &AdvertiseData,
    ) -> Result<(), BleError> {
        self.record(SimCall::StartAdvertising)?;
        if self.server_acks() {
            self.post(ServerTransportEvent::AdvertisingStarted);
        }
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), BleError> {
        self.record(SimCall::StopAdvertising)
    }

    async fn close(&self) {
        let _ = self.record(SimCall::CloseServer);
    }
}

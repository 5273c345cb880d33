//! Transport adapter contract
//!
//! The engine never touches a radio. It drives an implementation of these
//! traits, whose calls only *start* an operation. Every started operation is
//! answered later by exactly one event posted to the engine's event sink.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::gatt::{CharacteristicId, DescriptorId, DeviceId, GattService};
use super::status::{
    AdapterState, BondState, ConnectionPriority, ConnectionState, GattStatus, HciStatus,
    PhyOptions, PhyType, ScanFailure, WriteType,
};
use super::BleError;

/// The two scanners the engine runs independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanKind {
    /// Application-requested discovery scan.
    Foreground,
    /// Address-filtered scan looking for devices awaiting autoconnect.
    AutoConnect,
}

/// A single advertisement seen during a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRecord {
    pub device: DeviceId,
    pub name: Option<String>,
    pub rssi: i16,
    pub service_uuids: Vec<Uuid>,
    /// Raw advertisement bytes.
    pub data: Vec<u8>,
}

/// Platform-level scan filter. A record passes a filter list when the list is
/// empty or any filter matches.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanFilter {
    ServiceUuid(Uuid),
    Address(DeviceId),
    /// Exact advertised name.
    Name(String),
}

impl ScanFilter {
    pub fn matches(&self, record: &ScanRecord) -> bool {
        match self {
            ScanFilter::ServiceUuid(uuid) => record.service_uuids.contains(uuid),
            ScanFilter::Address(id) => record.device == *id,
            ScanFilter::Name(name) => record.name.as_deref() == Some(name.as_str()),
        }
    }

    pub fn any_match(filters: &[ScanFilter], record: &ScanRecord) -> bool {
        filters.is_empty() || filters.iter().any(|f| f.matches(record))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingVariant {
    Pin,
    PasskeyConfirmation,
    Consent,
    Other(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertiseSettings {
    pub connectable: bool,
    /// Stop advertising automatically after this long.
    pub timeout: Option<Duration>,
}

impl Default for AdvertiseSettings {
    fn default() -> Self {
        Self { connectable: true, timeout: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AdvertiseData {
    pub include_device_name: bool,
    pub service_uuids: Vec<Uuid>,
    pub manufacturer_data: Option<(u16, Vec<u8>)>,
}

/// Central-role completions and notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum CentralTransportEvent {
    ConnectionStateChanged {
        device: DeviceId,
        status: HciStatus,
        state: ConnectionState,
    },
    ServicesDiscovered {
        device: DeviceId,
        status: GattStatus,
        services: Vec<GattService>,
    },
    CharacteristicRead {
        device: DeviceId,
        characteristic: CharacteristicId,
        value: Vec<u8>,
        status: GattStatus,
    },
    CharacteristicWritten {
        device: DeviceId,
        characteristic: CharacteristicId,
        status: GattStatus,
    },
    CharacteristicChanged {
        device: DeviceId,
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
    DescriptorRead {
        device: DeviceId,
        descriptor: DescriptorId,
        value: Vec<u8>,
        status: GattStatus,
    },
    DescriptorWritten {
        device: DeviceId,
        descriptor: DescriptorId,
        status: GattStatus,
    },
    RssiRead {
        device: DeviceId,
        rssi: i16,
        status: GattStatus,
    },
    MtuChanged {
        device: DeviceId,
        mtu: u16,
        status: GattStatus,
    },
    PhyUpdated {
        device: DeviceId,
        tx: PhyType,
        rx: PhyType,
        status: GattStatus,
    },
    PhyRead {
        device: DeviceId,
        tx: PhyType,
        rx: PhyType,
        status: GattStatus,
    },
    ServiceChanged {
        device: DeviceId,
    },
    BondStateChanged {
        device: DeviceId,
        state: BondState,
        previous: BondState,
    },
    PairingRequest {
        device: DeviceId,
        variant: PairingVariant,
    },
    ScanResult {
        kind: ScanKind,
        record: ScanRecord,
    },
    ScanFailed {
        kind: ScanKind,
        failure: ScanFailure,
    },
    AdapterStateChanged(AdapterState),
}

/// Server-role requests from remote centrals and completions.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerTransportEvent {
    ConnectionStateChanged {
        central: DeviceId,
        status: HciStatus,
        state: ConnectionState,
    },
    ServiceAdded {
        service: Uuid,
        status: GattStatus,
    },
    CharacteristicReadRequest {
        central: DeviceId,
        request_id: u32,
        offset: usize,
        characteristic: CharacteristicId,
    },
    DescriptorReadRequest {
        central: DeviceId,
        request_id: u32,
        offset: usize,
        descriptor: DescriptorId,
    },
    CharacteristicWriteRequest {
        central: DeviceId,
        request_id: u32,
        characteristic: CharacteristicId,
        prepared: bool,
        response_needed: bool,
        offset: usize,
        value: Vec<u8>,
    },
    DescriptorWriteRequest {
        central: DeviceId,
        request_id: u32,
        descriptor: DescriptorId,
        prepared: bool,
        response_needed: bool,
        offset: usize,
        value: Vec<u8>,
    },
    ExecuteWrite {
        central: DeviceId,
        request_id: u32,
        execute: bool,
    },
    NotificationSent {
        central: DeviceId,
        status: GattStatus,
    },
    MtuChanged {
        central: DeviceId,
        mtu: u16,
    },
    AdvertisingStarted,
    AdvertisingFailed(u8),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Central(CentralTransportEvent),
    Server(ServerTransportEvent),
}

impl From<CentralTransportEvent> for TransportEvent {
    fn from(event: CentralTransportEvent) -> Self {
        TransportEvent::Central(event)
    }
}

impl From<ServerTransportEvent> for TransportEvent {
    fn from(event: ServerTransportEvent) -> Self {
        TransportEvent::Server(event)
    }
}

/// Central role: scanning, connecting and GATT client operations.
///
/// `Err` means the operation could not be started; no event will follow.
#[async_trait]
pub trait CentralTransport: Send + Sync {
    /// Whether the radio is on.
    fn is_enabled(&self) -> bool;

    /// Whether the platform already knows this device well enough to connect
    /// without scanning for it first.
    fn is_cached(&self, device: &DeviceId) -> bool;

    fn bond_state(&self, device: &DeviceId) -> BondState;

    async fn start_scan(&self, kind: ScanKind, filters: &[ScanFilter]) -> Result<(), BleError>;

    async fn stop_scan(&self, kind: ScanKind) -> Result<(), BleError>;

    async fn connect(&self, device: &DeviceId, auto_connect: bool) -> Result<(), BleError>;

    async fn disconnect(&self, device: &DeviceId) -> Result<(), BleError>;

    /// Release the link handle after a disconnect has completed.
    async fn close(&self, device: &DeviceId);

    async fn discover_services(&self, device: &DeviceId) -> Result<(), BleError>;

    async fn read_characteristic(
        &self,
        device: &DeviceId,
        characteristic: &CharacteristicId,
    ) -> Result<(), BleError>;

    async fn write_characteristic(
        &self,
        device: &DeviceId,
        characteristic: &CharacteristicId,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), BleError>;

    async fn read_descriptor(
        &self,
        device: &DeviceId,
        descriptor: &DescriptorId,
    ) -> Result<(), BleError>;

    async fn write_descriptor(
        &self,
        device: &DeviceId,
        descriptor: &DescriptorId,
        value: &[u8],
    ) -> Result<(), BleError>;

    /// Local switch routing incoming notifications for this characteristic.
    /// Completes synchronously; the CCC write that follows produces the event.
    async fn set_notification(
        &self,
        device: &DeviceId,
        characteristic: &CharacteristicId,
        enable: bool,
    ) -> Result<(), BleError>;

    async fn read_rssi(&self, device: &DeviceId) -> Result<(), BleError>;

    async fn request_mtu(&self, device: &DeviceId, mtu: u16) -> Result<(), BleError>;

    async fn set_preferred_phy(
        &self,
        device: &DeviceId,
        tx: PhyType,
        rx: PhyType,
        options: PhyOptions,
    ) -> Result<(), BleError>;

    async fn read_phy(&self, device: &DeviceId) -> Result<(), BleError>;

    /// No completion event follows; the engine completes it after a settle delay.
    async fn request_connection_priority(
        &self,
        device: &DeviceId,
        priority: ConnectionPriority,
    ) -> Result<(), BleError>;

    async fn create_bond(&self, device: &DeviceId) -> Result<(), BleError>;

    async fn remove_bond(&self, device: &DeviceId) -> Result<(), BleError>;

    async fn set_pairing_pin(&self, device: &DeviceId, pin: &str) -> Result<(), BleError>;
}

/// Server role: attribute database, responses, notifications, advertising.
#[async_trait]
pub trait ServerTransport: Send + Sync {
    async fn add_service(&self, service: &GattService) -> Result<(), BleError>;

    async fn remove_service(&self, service: Uuid) -> Result<(), BleError>;

    async fn clear_services(&self);

    async fn send_response(
        &self,
        central: &DeviceId,
        request_id: u32,
        status: GattStatus,
        offset: usize,
        value: &[u8],
    ) -> Result<(), BleError>;

    /// Send a notification, or an indication when `confirm` is set.
    async fn notify(
        &self,
        central: &DeviceId,
        characteristic: &CharacteristicId,
        confirm: bool,
        value: &[u8],
    ) -> Result<(), BleError>;

    async fn cancel_connection(&self, central: &DeviceId) -> Result<(), BleError>;

    async fn start_advertising(
        &self,
        settings: &AdvertiseSettings,
        data: &AdvertiseData,
        scan_response: &AdvertiseData,
    ) -> Result<(), BleError>;

    async fn stop_advertising(&self) -> Result<(), BleError>;

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(address: &str, name: Option<&str>, services: Vec<Uuid>) -> ScanRecord {
        ScanRecord {
            device: DeviceId::parse(address).unwrap(),
            name: name.map(str::to_string),
            rssi: -60,
            service_uuids: services,
            data: vec![0x02, 0x01, 0x06],
        }
    }

    #[test]
    fn test_scan_filter_matching() {
        let hr = crate::ble::gatt::uuid_from_short(0x180D);
        let rec = record("00:11:22:33:44:55", Some("Polar H10"), vec![hr]);

        assert!(ScanFilter::ServiceUuid(hr).matches(&rec));
        assert!(ScanFilter::Name("Polar H10".into()).matches(&rec));
        assert!(!ScanFilter::Name("Polar".into()).matches(&rec));
        assert!(ScanFilter::Address(rec.device.clone()).matches(&rec));
    }

    #[test]
    fn test_empty_filter_list_matches_everything() {
        let rec = record("00:11:22:33:44:55", None, vec![]);
        assert!(ScanFilter::any_match(&[], &rec));
        let other = DeviceId::parse("AA:BB:CC:DD:EE:FF").unwrap();
        assert!(!ScanFilter::any_match(&[ScanFilter::Address(other)], &rec));
    }
}

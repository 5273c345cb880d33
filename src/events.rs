//! Application-visible events
//!
//! Everything the engine reports after the fact arrives as one of these
//! enums on a channel: registry-level events on the central stream, per-device
//! completions on the listener handed to `connect`, and server events on the
//! server stream.

use tokio::sync::mpsc;

use crate::ble::gatt::{CharacteristicId, DescriptorId, DeviceId, GattService};
use crate::ble::status::{AdapterState, GattStatus, HciStatus, PhyType, ScanFailure};
use crate::ble::transport::ScanRecord;

#[derive(Debug, Clone, PartialEq)]
pub enum CentralEvent {
    Discovered(ScanRecord),
    ScanFailed(ScanFailure),
    /// The link is up and the attribute table is known.
    Connected(DeviceId),
    ConnectionFailed { device: DeviceId, status: HciStatus },
    Disconnected { device: DeviceId, status: HciStatus },
    AdapterStateChanged(AdapterState),
}

/// Per-device completions. Each command yields exactly one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralEvent {
    ServicesDiscovered {
        device: DeviceId,
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
        value: Vec<u8>,
        status: GattStatus,
    },
    /// Incoming notification or indication.
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
        value: Vec<u8>,
        status: GattStatus,
    },
    NotificationStateUpdate {
        device: DeviceId,
        characteristic: CharacteristicId,
        enabled: bool,
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
    ConnectionPriorityUpdated {
        device: DeviceId,
        status: GattStatus,
    },
    BondingStarted(DeviceId),
    BondingSucceeded(DeviceId),
    BondingFailed(DeviceId),
    BondLost(DeviceId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    CentralConnected(DeviceId),
    CentralDisconnected(DeviceId),
    ServiceAdded {
        service: GattService,
        status: GattStatus,
    },
    CharacteristicWriteCompleted {
        central: DeviceId,
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
    DescriptorWriteCompleted {
        central: DeviceId,
        descriptor: DescriptorId,
        value: Vec<u8>,
    },
    NotifyingEnabled {
        central: DeviceId,
        characteristic: CharacteristicId,
    },
    NotifyingDisabled {
        central: DeviceId,
        characteristic: CharacteristicId,
    },
    NotificationSent {
        central: DeviceId,
        characteristic: CharacteristicId,
        value: Vec<u8>,
        status: GattStatus,
    },
    AdvertisingStarted,
    AdvertisingFailed(u8),
    AdvertisingStopped,
}

/// Receives a device's completions.
pub type PeripheralListener = mpsc::UnboundedSender<PeripheralEvent>;

/// Convenience constructor for a listener and its receiving end.
pub fn peripheral_channel() -> (PeripheralListener, mpsc::UnboundedReceiver<PeripheralEvent>) {
    mpsc::unbounded_channel()
}

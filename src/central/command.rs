use crate::ble::gatt::{CharacteristicId, DescriptorId, DeviceId};
use crate::ble::status::{ConnectionPriority, GattStatus, PhyOptions, PhyType, WriteType};
use crate::events::PeripheralEvent;

/// One queued operation against a remote device.
///
/// A command is immutable once queued and is identified only by its position
/// in its device's queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Read(CharacteristicId),
    Write {
        characteristic: CharacteristicId,
        value: Vec<u8>,
        write_type: WriteType,
    },
    SetSubscription {
        characteristic: CharacteristicId,
        enable: bool,
    },
    ReadDescriptor(DescriptorId),
    WriteDescriptor {
        descriptor: DescriptorId,
        value: Vec<u8>,
    },
    ReadRssi,
    RequestMtu(u16),
    SetPhy {
        tx: PhyType,
        rx: PhyType,
        options: PhyOptions,
    },
    ReadPhy,
    RequestConnectionPriority(ConnectionPriority),
    CreateBond,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Read(_) => "read",
            Command::Write { .. } => "write",
            Command::SetSubscription { .. } => "set-subscription",
            Command::ReadDescriptor(_) => "read-descriptor",
            Command::WriteDescriptor { .. } => "write-descriptor",
            Command::ReadRssi => "read-rssi",
            Command::RequestMtu(_) => "request-mtu",
            Command::SetPhy { .. } => "set-phy",
            Command::ReadPhy => "read-phy",
            Command::RequestConnectionPriority(_) => "connection-priority",
            Command::CreateBond => "create-bond",
        }
    }

    /// The completion reported when this command ends without a transport
    /// answer (refused to start, retries exhausted, link dropped).
    pub(crate) fn failure_event(&self, device: &DeviceId, mtu: u16, status: GattStatus) -> PeripheralEvent {
        let device = device.clone();
        match self {
            Command::Read(characteristic) => PeripheralEvent::CharacteristicRead {
                device,
                characteristic: *characteristic,
                value: Vec::new(),
                status,
            },
            Command::Write { characteristic, value, .. } => PeripheralEvent::CharacteristicWritten {
                device,
                characteristic: *characteristic,
                value: value.clone(),
                status,
            },
            Command::SetSubscription { characteristic, enable } => {
                PeripheralEvent::NotificationStateUpdate {
                    device,
                    characteristic: *characteristic,
                    enabled: *enable,
                    status,
                }
            }
            Command::ReadDescriptor(descriptor) => PeripheralEvent::DescriptorRead {
                device,
                descriptor: *descriptor,
                value: Vec::new(),
                status,
            },
            Command::WriteDescriptor { descriptor, value } => PeripheralEvent::DescriptorWritten {
                device,
                descriptor: *descriptor,
                value: value.clone(),
                status,
            },
            Command::ReadRssi => PeripheralEvent::RssiRead { device, rssi: 0, status },
            Command::RequestMtu(_) => PeripheralEvent::MtuChanged { device, mtu, status },
            Command::SetPhy { tx, rx, .. } => PeripheralEvent::PhyUpdated {
                device,
                tx: *tx,
                rx: *rx,
                status,
            },
            Command::ReadPhy => PeripheralEvent::PhyRead {
                device,
                tx: PhyType::Le1M,
                rx: PhyType::Le1M,
                status,
            },
            Command::RequestConnectionPriority(_) => {
                PeripheralEvent::ConnectionPriorityUpdated { device, status }
            }
            Command::CreateBond => PeripheralEvent::BondingFailed(device),
        }
    }
}

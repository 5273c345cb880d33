//! Attribute model: device identifiers, services, characteristics, descriptors
//!
//! Attributes are addressed by UUID path (service, characteristic, descriptor)
//! so that both roles can refer to them without holding platform handles.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::BleError;

/// Client Characteristic Configuration descriptor.
pub const CCC_DESCRIPTOR_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCC values, little-endian on the wire.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Bluetooth base UUID with a 16-bit assigned number filled in.
pub const fn uuid_from_short(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_00805f9b34fb | ((short as u128) << 96))
}

/// Platform-stable device address in canonical `AA:BB:CC:DD:EE:FF` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Parse an address. Only upper-case hex in the colon-separated form is
    /// accepted; the identifier is case-significant.
    pub fn parse(address: &str) -> Result<Self, BleError> {
        let bytes = address.as_bytes();
        let well_formed = bytes.len() == 17
            && bytes.iter().enumerate().all(|(i, b)| {
                if i % 3 == 2 {
                    *b == b':'
                } else {
                    b.is_ascii_digit() || (b'A'..=b'F').contains(b)
                }
            });
        if well_formed {
            Ok(Self(address.to_string()))
        } else {
            Err(BleError::InvalidAddress(address.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DeviceId {
    type Err = BleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

bitflags::bitflags! {
    /// Characteristic property bits as advertised in the attribute table.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Properties: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const SIGNED_WRITE = 0x40;
    }
}

/// Path to a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicId {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicId {
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self { service, characteristic }
    }

    pub fn descriptor(self, descriptor: Uuid) -> DescriptorId {
        DescriptorId { characteristic: self, descriptor }
    }

    pub fn ccc(self) -> DescriptorId {
        self.descriptor(CCC_DESCRIPTOR_UUID)
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// Path to a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorId {
    pub characteristic: CharacteristicId,
    pub descriptor: Uuid,
}

impl DescriptorId {
    pub fn is_ccc(&self) -> bool {
        self.descriptor == CCC_DESCRIPTOR_UUID
    }
}

impl fmt::Display for DescriptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.characteristic, self.descriptor)
    }
}

/// Either kind of attribute, used as a key for per-attribute server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeId {
    Characteristic(CharacteristicId),
    Descriptor(DescriptorId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: Properties,
    pub descriptors: Vec<Uuid>,
}

impl GattCharacteristic {
    pub fn new(uuid: Uuid, properties: Properties) -> Self {
        Self { uuid, properties, descriptors: Vec::new() }
    }

    pub fn with_descriptor(mut self, descriptor: Uuid) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn has_descriptor(&self, descriptor: Uuid) -> bool {
        self.descriptors.contains(&descriptor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid, characteristics: Vec::new() }
    }

    pub fn with_characteristic(mut self, characteristic: GattCharacteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }
}

/// Look up a characteristic in an attribute table.
pub fn find_characteristic<'a>(
    services: &'a [GattService],
    id: &CharacteristicId,
) -> Option<&'a GattCharacteristic> {
    services
        .iter()
        .find(|s| s.uuid == id.service)
        .and_then(|s| s.characteristics.iter().find(|c| c.uuid == id.characteristic))
}

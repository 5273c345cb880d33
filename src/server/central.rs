//! State kept per connected remote central

use std::collections::{HashMap, VecDeque};

use crate::ble::gatt::{
    AttributeId, CharacteristicId, GattCharacteristic, Properties, DISABLE_NOTIFICATION_VALUE,
    ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
};
use crate::ble::status::GattStatus;
use crate::central::DEFAULT_MTU;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    Notify,
    Indicate,
}

impl Subscription {
    /// The CCC value a central reads back for this subscription.
    pub fn ccc_value(subscription: Option<Subscription>) -> [u8; 2] {
        match subscription {
            Some(Subscription::Notify) => ENABLE_NOTIFICATION_VALUE,
            Some(Subscription::Indicate) => ENABLE_INDICATION_VALUE,
            None => DISABLE_NOTIFICATION_VALUE,
        }
    }
}

/// Decode a CCC write against what the characteristic can do.
/// `Ok(None)` turns the subscription off.
pub fn parse_ccc_write(
    characteristic: &GattCharacteristic,
    value: &[u8],
) -> Result<Option<Subscription>, GattStatus> {
    if value.len() != 2 {
        return Err(GattStatus::InvalidAttributeValueLength);
    }
    let (wanted, capability) = if value == ENABLE_NOTIFICATION_VALUE {
        (Subscription::Notify, Properties::NOTIFY)
    } else if value == ENABLE_INDICATION_VALUE {
        (Subscription::Indicate, Properties::INDICATE)
    } else if value == DISABLE_NOTIFICATION_VALUE {
        return Ok(None);
    } else {
        return Err(GattStatus::ValueNotAllowed);
    };
    if characteristic.properties.contains(capability) {
        Ok(Some(wanted))
    } else {
        Err(GattStatus::RequestNotSupported)
    }
}

/// Slice of `value` answering a read at `offset`, bounded by the read payload
/// budget for `mtu`.
pub fn read_chunk(value: &[u8], offset: usize, mtu: u16) -> Result<&[u8], GattStatus> {
    if offset > value.len() {
        return Err(GattStatus::InvalidOffset);
    }
    let budget = usize::from(mtu).saturating_sub(1);
    let end = value.len().min(offset + budget);
    Ok(&value[offset..end])
}

#[derive(Debug)]
pub(crate) struct RemoteCentral {
    pub mtu: u16,
    pub subscriptions: HashMap<CharacteristicId, Subscription>,
    /// Prepared-write buffers in the order their first chunk arrived.
    staging: Vec<(AttributeId, Vec<u8>)>,
    read_cache: HashMap<AttributeId, Vec<u8>>,
    pub notify_queue: VecDeque<(CharacteristicId, Vec<u8>)>,
    pub in_flight: bool,
}

impl Default for RemoteCentral {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            subscriptions: HashMap::new(),
            staging: Vec::new(),
            read_cache: HashMap::new(),
            notify_queue: VecDeque::new(),
            in_flight: false,
        }
    }
}

impl RemoteCentral {
    /// Append a prepared-write chunk. Chunks must arrive contiguously; a gap or
    /// overlap leaves the staged buffer untouched.
    pub fn stage(&mut self, attribute: AttributeId, offset: usize, chunk: &[u8]) -> GattStatus {
        match self.staging.iter_mut().find(|(a, _)| *a == attribute) {
            Some((_, buffer)) if offset == buffer.len() => {
                buffer.extend_from_slice(chunk);
                GattStatus::Success
            }
            Some(_) => GattStatus::InvalidOffset,
            None if offset == 0 => {
                self.staging.push((attribute, chunk.to_vec()));
                GattStatus::Success
            }
            None => GattStatus::InvalidOffset,
        }
    }

    #[cfg(test)]
    pub fn staged(&self, attribute: &AttributeId) -> Option<&[u8]> {
        self.staging
            .iter()
            .find(|(a, _)| a == attribute)
            .map(|(_, buffer)| buffer.as_slice())
    }

    pub fn take_staging(&mut self) -> Vec<(AttributeId, Vec<u8>)> {
        std::mem::take(&mut self.staging)
    }

    pub fn cache_read(&mut self, attribute: AttributeId, value: Vec<u8>) {
        self.read_cache.insert(attribute, value);
    }

    pub fn cached_read(&self, attribute: &AttributeId) -> Option<&Vec<u8>> {
        self.read_cache.get(attribute)
    }
}

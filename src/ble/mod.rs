//! BLE layer shared by the central and server roles
//!
//! Provides the error taxonomy, the attribute model, typed status codes,
//! the transport adapter traits, and a scriptable simulated transport.

pub mod gatt;
pub mod simulated;
pub mod status;
pub mod transport;

use thiserror::Error;

use crate::codec::CodecError;
use status::GattStatus;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BleError {
    // Sequencing errors: rejected at call time, nothing is queued.
    #[error("Device is not connected")]
    NotConnected,

    #[error("Device is already connected")]
    AlreadyConnected,

    #[error("Connection attempt already in progress")]
    ConnectionInProgress,

    #[error("Bonding already in progress")]
    BondingInProgress,

    #[error("Bluetooth is off")]
    BluetoothOff,

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    // Protocol violations.
    #[error("Attribute not found: {0}")]
    AttributeNotFound(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Invalid value length {len} (allowed 1..={max})")]
    InvalidLength { len: usize, max: usize },

    #[error("MTU {0} outside 23..=517")]
    InvalidMtu(u16),

    #[error("Invalid device address: {0}")]
    InvalidAddress(String),

    #[error("Pin code must be 6 digits")]
    InvalidPin,

    // Transport failures.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("GATT error: {0}")]
    Gatt(GattStatus),

    #[error("Engine has stopped")]
    EngineStopped,

    #[error("Decode error: {0}")]
    Codec(#[from] CodecError),
}

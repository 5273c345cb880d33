//! Typed status codes reported by the transport
//!
//! Link status follows the HCI error codes, attribute status follows the ATT
//! error codes plus the handful of host-stack codes platforms report. Codes
//! that are not recognised are kept as `Unknown` rather than coerced.

use std::fmt;

/// Link-layer status attached to connection state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HciStatus {
    Success,
    UnknownCommand,
    UnknownConnectionIdentifier,
    HardwareFailure,
    PageTimeout,
    AuthenticationFailure,
    PinOrKeyMissing,
    MemoryCapacityExceeded,
    ConnectionTimeout,
    ConnectionLimitExceeded,
    CommandDisallowed,
    RemoteUserTerminatedConnection,
    RemoteDeviceTerminatedLowResources,
    RemoteDeviceTerminatedPowerOff,
    ConnectionTerminatedByLocalHost,
    RepeatedAttempts,
    PairingNotAllowed,
    UnsupportedRemoteFeature,
    LmpResponseTimeout,
    InstantPassed,
    UnacceptableConnectionParameters,
    /// The link was never established within the platform's window.
    ConnectionFailedEstablishment,
    /// Generic stack error, often reported for what is really a timeout.
    Error,
    Unknown(u8),
}

impl HciStatus {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => Self::Success,
            0x01 => Self::UnknownCommand,
            0x02 => Self::UnknownConnectionIdentifier,
            0x03 => Self::HardwareFailure,
            0x04 => Self::PageTimeout,
            0x05 => Self::AuthenticationFailure,
            0x06 => Self::PinOrKeyMissing,
            0x07 => Self::MemoryCapacityExceeded,
            0x08 => Self::ConnectionTimeout,
            0x09 => Self::ConnectionLimitExceeded,
            0x0C => Self::CommandDisallowed,
            0x13 => Self::RemoteUserTerminatedConnection,
            0x14 => Self::RemoteDeviceTerminatedLowResources,
            0x15 => Self::RemoteDeviceTerminatedPowerOff,
            0x16 => Self::ConnectionTerminatedByLocalHost,
            0x17 => Self::RepeatedAttempts,
            0x18 => Self::PairingNotAllowed,
            0x1A => Self::UnsupportedRemoteFeature,
            0x22 => Self::LmpResponseTimeout,
            0x28 => Self::InstantPassed,
            0x3B => Self::UnacceptableConnectionParameters,
            0x3E => Self::ConnectionFailedEstablishment,
            0x85 => Self::Error,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0x00,
            Self::UnknownCommand => 0x01,
            Self::UnknownConnectionIdentifier => 0x02,
            Self::HardwareFailure => 0x03,
            Self::PageTimeout => 0x04,
            Self::AuthenticationFailure => 0x05,
            Self::PinOrKeyMissing => 0x06,
            Self::MemoryCapacityExceeded => 0x07,
            Self::ConnectionTimeout => 0x08,
            Self::ConnectionLimitExceeded => 0x09,
            Self::CommandDisallowed => 0x0C,
            Self::RemoteUserTerminatedConnection => 0x13,
            Self::RemoteDeviceTerminatedLowResources => 0x14,
            Self::RemoteDeviceTerminatedPowerOff => 0x15,
            Self::ConnectionTerminatedByLocalHost => 0x16,
            Self::RepeatedAttempts => 0x17,
            Self::PairingNotAllowed => 0x18,
            Self::UnsupportedRemoteFeature => 0x1A,
            Self::LmpResponseTimeout => 0x22,
            Self::InstantPassed => 0x28,
            Self::UnacceptableConnectionParameters => 0x3B,
            Self::ConnectionFailedEstablishment => 0x3E,
            Self::Error => 0x85,
            Self::Unknown(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl fmt::Display for HciStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:02X})", self, self.code())
    }
}

/// Attribute-protocol status attached to GATT operation completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GattStatus {
    Success,
    InvalidHandle,
    ReadNotPermitted,
    WriteNotPermitted,
    InvalidPdu,
    InsufficientAuthentication,
    RequestNotSupported,
    InvalidOffset,
    InsufficientAuthorization,
    PrepareQueueFull,
    AttributeNotFound,
    AttributeNotLong,
    InsufficientEncryptionKeySize,
    InvalidAttributeValueLength,
    UnlikelyError,
    InsufficientEncryption,
    UnsupportedGroupType,
    InsufficientResources,
    ValueNotAllowed,
    InternalError,
    Busy,
    Error,
    ConnectionCongested,
    Failure,
    Unknown(u16),
}

impl GattStatus {
    pub fn from_code(code: u16) -> Self {
        match code {
            0x00 => Self::Success,
            0x01 => Self::InvalidHandle,
            0x02 => Self::ReadNotPermitted,
            0x03 => Self::WriteNotPermitted,
            0x04 => Self::InvalidPdu,
            0x05 => Self::InsufficientAuthentication,
            0x06 => Self::RequestNotSupported,
            0x07 => Self::InvalidOffset,
            0x08 => Self::InsufficientAuthorization,
            0x09 => Self::PrepareQueueFull,
            0x0A => Self::AttributeNotFound,
            0x0B => Self::AttributeNotLong,
            0x0C => Self::InsufficientEncryptionKeySize,
            0x0D => Self::InvalidAttributeValueLength,
            0x0E => Self::UnlikelyError,
            0x0F => Self::InsufficientEncryption,
            0x10 => Self::UnsupportedGroupType,
            0x11 => Self::InsufficientResources,
            0x13 => Self::ValueNotAllowed,
            0x81 => Self::InternalError,
            0x84 => Self::Busy,
            0x85 => Self::Error,
            0x8F => Self::ConnectionCongested,
            0x101 => Self::Failure,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Self::Success => 0x00,
            Self::InvalidHandle => 0x01,
            Self::ReadNotPermitted => 0x02,
            Self::WriteNotPermitted => 0x03,
            Self::InvalidPdu => 0x04,
            Self::InsufficientAuthentication => 0x05,
            Self::RequestNotSupported => 0x06,
            Self::InvalidOffset => 0x07,
            Self::InsufficientAuthorization => 0x08,
            Self::PrepareQueueFull => 0x09,
            Self::AttributeNotFound => 0x0A,
            Self::AttributeNotLong => 0x0B,
            Self::InsufficientEncryptionKeySize => 0x0C,
            Self::InvalidAttributeValueLength => 0x0D,
            Self::UnlikelyError => 0x0E,
            Self::InsufficientEncryption => 0x0F,
            Self::UnsupportedGroupType => 0x10,
            Self::InsufficientResources => 0x11,
            Self::ValueNotAllowed => 0x13,
            Self::InternalError => 0x81,
            Self::Busy => 0x84,
            Self::Error => 0x85,
            Self::ConnectionCongested => 0x8F,
            Self::Failure => 0x101,
            Self::Unknown(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Failures that clear up by themselves once the link is secured or
    /// less busy, so the command is worth dispatching again.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::InsufficientAuthentication
                | Self::InsufficientEncryption
                | Self::ConnectionCongested
        )
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:02X})", self, self.code())
    }
}

/// Reasons a platform scan can fail to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFailure {
    AlreadyStarted,
    ApplicationRegistrationFailed,
    InternalError,
    FeatureUnsupported,
    OutOfHardwareResources,
    ScanningTooFrequently,
    Unknown(u8),
}

impl ScanFailure {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::AlreadyStarted,
            2 => Self::ApplicationRegistrationFailed,
            3 => Self::InternalError,
            4 => Self::FeatureUnsupported,
            5 => Self::OutOfHardwareResources,
            6 => Self::ScanningTooFrequently,
            other => Self::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BondState {
    #[default]
    None,
    Bonding,
    Bonded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Off,
    TurningOn,
    On,
    TurningOff,
}

/// How a characteristic value is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
    Signed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhyType {
    Le1M,
    Le2M,
    LeCoded,
}

/// Coding preference when `PhyType::LeCoded` is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PhyOptions {
    #[default]
    NoPreferred,
    S2,
    S8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPriority {
    Balanced,
    High,
    LowPower,
}

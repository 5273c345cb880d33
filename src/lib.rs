// Gattlink - BLE connection and command orchestration engine

pub mod ble;
pub mod central;
pub mod codec;
pub mod config;
pub mod engine;
pub mod events;
pub mod server;

pub use ble::gatt::{
    CharacteristicId, DescriptorId, DeviceId, GattCharacteristic, GattService, Properties,
};
pub use ble::BleError;
pub use central::{Command, DeviceInfo, Pool};
pub use codec::{BytesBuilder, BytesParser, CodecError};
pub use config::EngineConfig;
pub use engine::{Engine, EngineEvents, EngineHandle, EventSink};
pub use events::{peripheral_channel, CentralEvent, PeripheralEvent, PeripheralListener, ServerEvent};
pub use server::{AcceptAll, ReadResponse, ServerHandler};

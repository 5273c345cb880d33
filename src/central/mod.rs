//! Central role: device sessions, their command queues, and the registry
//! that owns them.

pub mod command;
pub(crate) mod registry;
pub mod session;

use std::sync::Arc;

use tokio::sync::mpsc;

pub use command::Command;
pub use session::{DeviceSession, DEFAULT_MTU, MAX_ATTRIBUTE_LEN, MAX_MTU};

use crate::ble::gatt::{CharacteristicId, DeviceId, GattService};
use crate::ble::status::{BondState, ConnectionState};
use crate::ble::transport::CentralTransport;
use crate::config::EngineConfig;
use crate::engine::timer::Timers;
use crate::events::CentralEvent;

/// Stable index of a session in the registry's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SessionKey(pub(crate) usize);

/// Which registry pool a device currently sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    Connected,
    Pending,
    /// Seen in a foreground scan, never connected.
    Transient,
}

/// Point-in-time copy of a session, safe to hand out of the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub state: ConnectionState,
    pub bond_state: BondState,
    pub mtu: u16,
    pub services: Vec<GattService>,
    pub subscriptions: Vec<CharacteristicId>,
    pub queued_commands: usize,
    pub pool: Option<Pool>,
}

/// What a session needs from its surroundings while handling a message.
pub(crate) struct CentralContext {
    pub transport: Arc<dyn CentralTransport>,
    pub config: EngineConfig,
    pub timers: Timers,
    pub events: mpsc::UnboundedSender<CentralEvent>,
}

impl CentralContext {
    pub fn emit(&self, event: CentralEvent) {
        if self.events.send(event).is_err() {
            log::debug!("Central event receiver is gone");
        }
    }
}

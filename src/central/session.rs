//! Per-device connection state machine and command queue
//!
//! A remote device can only process one GATT operation at a time, so every
//! operation is queued here and dispatched only when the previous one has
//! completed. The session also owns the device's bonding bookkeeping, because
//! a bond that starts mid-queue has to pause the queue rather than fail it.

use std::collections::{HashSet, VecDeque};

use tokio::time::Instant;

use super::command::Command;
use super::{CentralContext, DeviceInfo, Pool, SessionKey};
use crate::ble::gatt::{
    find_characteristic, CharacteristicId, DeviceId, GattService, Properties,
    DISABLE_NOTIFICATION_VALUE, ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
};
use crate::ble::status::{BondState, ConnectionState, GattStatus, HciStatus, WriteType};
use crate::ble::transport::CentralTransportEvent;
use crate::ble::BleError;
use crate::codec::to_hex;
use crate::engine::timer::{SessionTimer, Timer, TimerKind, TimerSlot};
use crate::events::{PeripheralEvent, PeripheralListener};

pub const DEFAULT_MTU: u16 = 23;
pub const MAX_MTU: u16 = 517;

/// Bring a transport-reported MTU into the range the ATT layer allows.
pub(crate) fn clamp_mtu(mtu: u16) -> u16 {
    let clamped = mtu.clamp(DEFAULT_MTU, MAX_MTU);
    if clamped != mtu {
        log::warn!("Transport reported MTU {}, using {}", mtu, clamped);
    }
    clamped
}
/// Longest value the attribute protocol allows.
pub const MAX_ATTRIBUTE_LEN: usize = 512;

/// What a session event means for the registry's pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    None,
    /// A connect was started from inside the session (bond completed with no link).
    ConnectStarted,
    /// Link up and attribute table known.
    Connected,
    ConnectFailed(HciStatus),
    Disconnected(HciStatus),
}

pub struct DeviceSession {
    key: SessionKey,
    id: DeviceId,
    state: ConnectionState,
    bond_state: BondState,
    mtu: u16,
    services: Vec<GattService>,
    discovered: bool,
    discovery_started: bool,
    queue: VecDeque<Command>,
    active: bool,
    retrying: bool,
    tries: u32,
    subscriptions: HashSet<CharacteristicId>,
    manually_bonding: bool,
    peripheral_initiated_bonding: bool,
    bond_lost: bool,
    timed_out: bool,
    /// Whether the transport holds a link handle for this device.
    link_open: bool,
    attempt_started: Option<Instant>,
    listener: Option<PeripheralListener>,
    pub(crate) pool: Option<Pool>,
    connect_timer: TimerSlot,
    bond_timer: TimerSlot,
    discovery_timer: TimerSlot,
    command_timer: TimerSlot,
}

impl DeviceSession {
    pub(crate) fn new(key: SessionKey, id: DeviceId, bond_state: BondState) -> Self {
        Self {
            key,
            id,
            state: ConnectionState::Disconnected,
            bond_state,
            mtu: DEFAULT_MTU,
            services: Vec::new(),
            discovered: false,
            discovery_started: false,
            queue: VecDeque::new(),
            active: false,
            retrying: false,
            tries: 0,
            subscriptions: HashSet::new(),
            manually_bonding: false,
            peripheral_initiated_bonding: false,
            bond_lost: false,
            timed_out: false,
            link_open: false,
            attempt_started: None,
            listener: None,
            pool: None,
            connect_timer: TimerSlot::default(),
            bond_timer: TimerSlot::default(),
            discovery_timer: TimerSlot::default(),
            command_timer: TimerSlot::default(),
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn bond_state(&self) -> BondState {
        self.bond_state
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn services(&self) -> &[GattService] {
        &self.services
    }

    pub fn is_notifying(&self, characteristic: &CharacteristicId) -> bool {
        self.subscriptions.contains(characteristic)
    }

    pub fn queued_commands(&self) -> usize {
        self.queue.len()
    }

    /// Largest value accepted by a write of the given type at the current MTU.
    pub fn max_write_length(&self, write_type: WriteType) -> usize {
        let mtu = usize::from(self.mtu);
        match write_type {
            WriteType::WithResponse => MAX_ATTRIBUTE_LEN,
            WriteType::WithoutResponse => mtu.saturating_sub(3).min(MAX_ATTRIBUTE_LEN),
            WriteType::Signed => mtu.saturating_sub(15),
        }
    }

    pub(crate) fn info(&self) -> DeviceInfo {
        let mut subscriptions: Vec<CharacteristicId> = self.subscriptions.iter().copied().collect();
        subscriptions.sort_by_key(|c| (c.service, c.characteristic));
        DeviceInfo {
            id: self.id.clone(),
            state: self.state,
            bond_state: self.bond_state,
            mtu: self.mtu,
            services: self.services.clone(),
            subscriptions,
            queued_commands: self.queue.len(),
            pool: self.pool,
        }
    }

    pub(crate) fn set_listener(&mut self, listener: Option<PeripheralListener>) {
        if listener.is_some() {
            self.listener = listener;
        }
    }

    fn emit(&self, event: PeripheralEvent) {
        if let Some(listener) = &self.listener {
            if listener.send(event).is_err() {
                log::debug!("Listener for {} is gone", self.id);
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            log::info!("{}: {:?} -> {:?}", self.id, self.state, state);
            self.state = state;
        }
    }

    fn timer_kind(&self, which: SessionTimer) -> TimerKind {
        TimerKind::Session(self.key, which)
    }

    // ---------------------------------------------------------------------
    // Connection lifecycle
    // ---------------------------------------------------------------------

    /// Start a connection attempt. Only legal from Disconnected.
    pub(crate) async fn connect(&mut self, ctx: &CentralContext, auto_connect: bool) -> Result<(), BleError> {
        match self.state {
            ConnectionState::Disconnected => {}
            ConnectionState::Connected => return Err(BleError::AlreadyConnected),
            ConnectionState::Connecting | ConnectionState::Disconnecting => {
                return Err(BleError::ConnectionInProgress)
            }
        }
        self.discovered = false;
        self.discovery_started = false;
        self.timed_out = false;
        self.attempt_started = Some(Instant::now());
        self.set_state(ConnectionState::Connecting);
        self.link_open = true;

        if let Err(e) = ctx.transport.connect(&self.id, auto_connect).await {
            log::error!("{}: connect could not be started: {}", self.id, e);
            self.link_open = false;
            self.attempt_started = None;
            self.set_state(ConnectionState::Disconnected);
            return Err(e);
        }
        // Autoconnect waits indefinitely.
        if !auto_connect {
            let kind = self.timer_kind(SessionTimer::ConnectionTimeout);
            self.connect_timer.arm(&ctx.timers, ctx.config.connection_timeout, kind);
        }
        Ok(())
    }

    pub(crate) async fn disconnect(&mut self, ctx: &CentralContext) -> Result<(), BleError> {
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                self.set_state(ConnectionState::Disconnecting);
                ctx.transport.disconnect(&self.id).await
            }
            ConnectionState::Disconnecting => Ok(()),
            ConnectionState::Disconnected => Err(BleError::NotConnected),
        }
    }

    /// Cancel an attempt or tear down a link. A cancelled attempt that the
    /// transport does not confirm is completed locally after a short grace.
    pub(crate) async fn cancel_connection(&mut self, ctx: &CentralContext) -> Result<(), BleError> {
        if self.state == ConnectionState::Connecting {
            self.connect_timer.cancel();
            self.disconnect(ctx).await?;
            let kind = self.timer_kind(SessionTimer::CancelConfirm);
            self.connect_timer.arm(&ctx.timers, ctx.config.cancel_confirm_grace, kind);
            Ok(())
        } else {
            self.disconnect(ctx).await
        }
    }

    /// Drop the link without waiting for the transport, used when the radio
    /// goes away underneath us.
    pub(crate) async fn force_disconnect(&mut self, ctx: &CentralContext) {
        self.complete_disconnect(ctx).await;
    }

    async fn on_connection_state(
        &mut self,
        ctx: &CentralContext,
        status: HciStatus,
        new_state: ConnectionState,
    ) -> Outcome {
        if !self.link_open {
            log::warn!("{}: ignoring {:?} ({}) with no link", self.id, new_state, status);
            return Outcome::None;
        }
        let previous = self.state;
        self.connect_timer.cancel();

        let status = if self.timed_out && new_state == ConnectionState::Disconnected {
            HciStatus::ConnectionFailedEstablishment
        } else {
            status
        };

        if status.is_success() {
            match new_state {
                ConnectionState::Connected => {
                    self.on_link_up(ctx).await;
                    Outcome::None
                }
                ConnectionState::Disconnected => self.on_link_down(ctx, previous).await,
                other => {
                    self.set_state(other);
                    Outcome::None
                }
            }
        } else {
            self.on_link_failure(ctx, status, previous, new_state).await
        }
    }

    async fn on_link_up(&mut self, ctx: &CentralContext) {
        self.set_state(ConnectionState::Connected);
        if let Some(started) = self.attempt_started.take() {
            log::info!("{}: connected after {} ms", self.id, started.elapsed().as_millis());
        }
        if self.bond_state == BondState::Bonding {
            log::info!("{}: bonding in progress, deferring discovery", self.id);
        } else {
            self.start_discovery(ctx).await;
        }
    }

    async fn on_link_down(&mut self, ctx: &CentralContext, previous: ConnectionState) -> Outcome {
        if previous == ConnectionState::Connecting {
            log::info!("{}: connection attempt cancelled", self.id);
        }
        if self.bond_lost {
            // Link loss and bond loss race; let the picture settle first.
            let kind = self.timer_kind(SessionTimer::BondLostSettle);
            self.bond_timer.arm(&ctx.timers, ctx.config.bond_lost_settle_delay, kind);
            return Outcome::None;
        }
        self.complete_disconnect(ctx).await;
        Outcome::Disconnected(HciStatus::Success)
    }

    async fn on_link_failure(
        &mut self,
        ctx: &CentralContext,
        status: HciStatus,
        previous: ConnectionState,
        new_state: ConnectionState,
    ) -> Outcome {
        if previous == ConnectionState::Connecting {
            let status = self.classify_attempt_failure(ctx, status);
            log::error!("{}: connection failed with {}", self.id, status);
            self.complete_disconnect(ctx).await;
            Outcome::ConnectFailed(status)
        } else if new_state == ConnectionState::Disconnected {
            let never_discovered = previous == ConnectionState::Connected && !self.discovered;
            log::info!("{}: disconnected with {}", self.id, status);
            self.complete_disconnect(ctx).await;
            if never_discovered {
                Outcome::ConnectFailed(status)
            } else {
                Outcome::Disconnected(status)
            }
        } else {
            log::warn!("{}: {:?} reported with {}", self.id, new_state, status);
            Outcome::None
        }
    }

    /// A generic error after the platform's establishment window is really a
    /// failed establishment.
    fn classify_attempt_failure(&self, ctx: &CentralContext, status: HciStatus) -> HciStatus {
        let elapsed = self.attempt_started.map(|t| t.elapsed()).unwrap_or_default();
        if status == HciStatus::Error && elapsed > ctx.config.establishment_failure_threshold {
            HciStatus::ConnectionFailedEstablishment
        } else {
            status
        }
    }

    async fn complete_disconnect(&mut self, ctx: &CentralContext) {
        self.connect_timer.cancel();
        self.bond_timer.cancel();
        self.discovery_timer.cancel();
        self.abort_queue(GattStatus::Failure);
        self.subscriptions.clear();
        self.mtu = DEFAULT_MTU;
        self.manually_bonding = false;
        self.peripheral_initiated_bonding = false;
        self.bond_lost = false;
        self.timed_out = false;
        self.discovery_started = false;
        self.attempt_started = None;
        self.set_state(ConnectionState::Disconnected);
        if self.link_open {
            self.link_open = false;
            ctx.transport.close(&self.id).await;
        }
    }

    async fn start_discovery(&mut self, ctx: &CentralContext) {
        self.discovery_started = true;
        if let Err(e) = ctx.transport.discover_services(&self.id).await {
            log::error!("{}: discovery could not be started: {}", self.id, e);
            self.discovery_started = false;
            let _ = self.disconnect(ctx).await;
        }
    }

    async fn on_services_discovered(
        &mut self,
        ctx: &CentralContext,
        status: GattStatus,
        services: Vec<GattService>,
    ) -> Outcome {
        self.discovery_started = false;
        if self.state != ConnectionState::Connected {
            log::warn!("{}: discovery result while {:?}", self.id, self.state);
            return Outcome::None;
        }
        if !status.is_success() {
            log::error!("{}: service discovery failed with {}", self.id, status);
            let _ = self.disconnect(ctx).await;
            return Outcome::None;
        }
        log::info!("{}: discovered {} services", self.id, services.len());
        self.services = services;
        self.discovered = true;
        self.emit(PeripheralEvent::ServicesDiscovered {
            device: self.id.clone(),
            services: self.services.clone(),
        });
        self.next_command(ctx).await;
        Outcome::Connected
    }

    async fn on_service_changed(&mut self, ctx: &CentralContext) {
        log::info!("{}: remote attribute table changed", self.id);
        self.abort_queue(GattStatus::Failure);
        self.discovered = false;
        let kind = self.timer_kind(SessionTimer::Rediscover);
        self.discovery_timer
            .arm(&ctx.timers, ctx.config.service_changed_rediscovery_delay, kind);
    }

    // ---------------------------------------------------------------------
    // Bonding
    // ---------------------------------------------------------------------

    /// Bond with the device. Without a link the transport is asked directly;
    /// on a live link the request waits its turn in the queue.
    pub(crate) async fn create_bond(&mut self, ctx: &CentralContext) -> Result<(), BleError> {
        if self.bond_state == BondState::Bonding {
            return Err(BleError::BondingInProgress);
        }
        if !self.link_open {
            return ctx.transport.create_bond(&self.id).await;
        }
        self.enqueue(ctx, Command::CreateBond).await
    }

    async fn on_bond_state(&mut self, ctx: &CentralContext, state: BondState, previous: BondState) -> Outcome {
        self.bond_state = state;
        let mut outcome = Outcome::None;
        match state {
            BondState::Bonding => {
                log::info!("{}: bonding started", self.id);
                self.emit(PeripheralEvent::BondingStarted(self.id.clone()));
            }
            BondState::Bonded => {
                log::info!("{}: bonded", self.id);
                self.emit(PeripheralEvent::BondingSucceeded(self.id.clone()));
                if !self.link_open {
                    outcome = match self.connect(ctx, false).await {
                        Ok(()) => Outcome::ConnectStarted,
                        Err(_) => Outcome::None,
                    };
                } else {
                    self.resume_after_bonding(ctx).await;
                }
            }
            BondState::None if previous == BondState::Bonding => {
                log::error!("{}: bonding failed", self.id);
                self.emit(PeripheralEvent::BondingFailed(self.id.clone()));
                self.resume_after_bonding(ctx).await;
            }
            BondState::None => {
                log::warn!("{}: bond lost", self.id);
                self.emit(PeripheralEvent::BondLost(self.id.clone()));
                self.bond_lost = true;
                self.discovery_timer.cancel();
                let kind = self.timer_kind(SessionTimer::BondLossDisconnect);
                self.bond_timer
                    .arm(&ctx.timers, ctx.config.bond_loss_disconnect_delay, kind);
            }
        }
        outcome
    }

    async fn resume_after_bonding(&mut self, ctx: &CentralContext) {
        if self.manually_bonding {
            self.manually_bonding = false;
            if self.active && matches!(self.queue.front(), Some(Command::CreateBond)) {
                self.finish_active();
            }
        }
        if self.state == ConnectionState::Connected && !self.discovered && !self.discovery_started {
            self.start_discovery(ctx).await;
        }
        if self.peripheral_initiated_bonding {
            log::info!("{}: resuming queue after remote-initiated bonding", self.id);
            self.peripheral_initiated_bonding = false;
        }
        self.next_command(ctx).await;
    }

    // ---------------------------------------------------------------------
    // Command queue
    // ---------------------------------------------------------------------

    /// Validate and queue a command. Rejections leave the queue untouched.
    pub(crate) async fn enqueue(&mut self, ctx: &CentralContext, command: Command) -> Result<(), BleError> {
        self.validate(&command)?;
        log::debug!("{}: queued {} ({} ahead)", self.id, command.name(), self.queue.len());
        self.queue.push_back(command);
        self.next_command(ctx).await;
        Ok(())
    }

    fn characteristic(&self, id: &CharacteristicId) -> Result<Properties, BleError> {
        find_characteristic(&self.services, id)
            .map(|c| c.properties)
            .ok_or_else(|| BleError::AttributeNotFound(id.to_string()))
    }

    fn validate(&self, command: &Command) -> Result<(), BleError> {
        if let Command::CreateBond = command {
            return match self.bond_state {
                BondState::Bonding => Err(BleError::BondingInProgress),
                _ => Ok(()),
            };
        }
        if self.state != ConnectionState::Connected {
            return Err(BleError::NotConnected);
        }
        match command {
            Command::Read(id) => {
                if !self.characteristic(id)?.contains(Properties::READ) {
                    return Err(BleError::NotSupported(format!("{id} is not readable")));
                }
            }
            Command::Write { characteristic, value, write_type } => {
                let properties = self.characteristic(characteristic)?;
                let required = match write_type {
                    WriteType::WithResponse => Properties::WRITE,
                    WriteType::WithoutResponse => Properties::WRITE_WITHOUT_RESPONSE,
                    WriteType::Signed => Properties::SIGNED_WRITE,
                };
                if !properties.contains(required) {
                    return Err(BleError::NotSupported(format!(
                        "{characteristic} does not support {write_type:?}"
                    )));
                }
                let max = self.max_write_length(*write_type);
                if value.is_empty() || value.len() > max {
                    return Err(BleError::InvalidLength { len: value.len(), max });
                }
            }
            Command::SetSubscription { characteristic, .. } => {
                let properties = self.characteristic(characteristic)?;
                let has_ccc = find_characteristic(&self.services, characteristic)
                    .map(|c| c.has_descriptor(characteristic.ccc().descriptor))
                    .unwrap_or(false);
                if !has_ccc {
                    return Err(BleError::AttributeNotFound(characteristic.ccc().to_string()));
                }
                if !properties.contains(Properties::NOTIFY) && !properties.contains(Properties::INDICATE) {
                    return Err(BleError::NotSupported(format!(
                        "{characteristic} cannot notify or indicate"
                    )));
                }
            }
            Command::ReadDescriptor(descriptor) | Command::WriteDescriptor { descriptor, .. } => {
                let present = find_characteristic(&self.services, &descriptor.characteristic)
                    .map(|c| c.has_descriptor(descriptor.descriptor))
                    .unwrap_or(false);
                if !present {
                    return Err(BleError::AttributeNotFound(descriptor.to_string()));
                }
                if let Command::WriteDescriptor { value, .. } = command {
                    if value.is_empty() || value.len() > MAX_ATTRIBUTE_LEN {
                        return Err(BleError::InvalidLength { len: value.len(), max: MAX_ATTRIBUTE_LEN });
                    }
                }
            }
            Command::RequestMtu(mtu) => {
                if !(DEFAULT_MTU..=MAX_MTU).contains(mtu) {
                    return Err(BleError::InvalidMtu(*mtu));
                }
            }
            Command::ReadRssi
            | Command::SetPhy { .. }
            | Command::ReadPhy
            | Command::RequestConnectionPriority(_)
            | Command::CreateBond => {}
        }
        Ok(())
    }

    /// Dispatch the head of the queue if nothing is in flight and the device
    /// is ready for it.
    async fn next_command(&mut self, ctx: &CentralContext) {
        loop {
            if self.active {
                return;
            }
            let Some(head) = self.queue.front().cloned() else {
                return;
            };
            if !self.link_open {
                log::warn!("{}: no link, dropping {} queued commands", self.id, self.queue.len());
                self.abort_queue(GattStatus::Failure);
                return;
            }
            let is_bond = matches!(head, Command::CreateBond);
            if !is_bond && self.state != ConnectionState::Connected {
                return;
            }
            if !is_bond && self.bond_state == BondState::Bonding {
                log::info!("{}: bonding in progress, holding {} commands", self.id, self.queue.len());
                self.peripheral_initiated_bonding = true;
                return;
            }

            self.active = true;
            if !self.retrying {
                self.tries = 0;
            }
            self.tries += 1;
            log::debug!("{}: dispatching {} (try {})", self.id, head.name(), self.tries);

            match self.dispatch(ctx, &head).await {
                Ok(()) => return,
                Err(e) => {
                    log::error!("{}: {} could not be started: {}", self.id, head.name(), e);
                    self.emit(head.failure_event(&self.id, self.mtu, GattStatus::Failure));
                    self.finish_active();
                }
            }
        }
    }

    async fn dispatch(&mut self, ctx: &CentralContext, command: &Command) -> Result<(), BleError> {
        let transport = &ctx.transport;
        let id = &self.id;
        match command {
            Command::Read(characteristic) => transport.read_characteristic(id, characteristic).await,
            Command::Write { characteristic, value, write_type } => {
                log::debug!("{}: writing <{}> to {}", id, to_hex(value), characteristic);
                transport
                    .write_characteristic(id, characteristic, value, *write_type)
                    .await
            }
            Command::SetSubscription { characteristic, enable } => {
                let properties = self.characteristic(characteristic)?;
                let value = if !enable {
                    DISABLE_NOTIFICATION_VALUE
                } else if properties.contains(Properties::NOTIFY) {
                    ENABLE_NOTIFICATION_VALUE
                } else {
                    ENABLE_INDICATION_VALUE
                };
                transport.set_notification(id, characteristic, *enable).await?;
                transport.write_descriptor(id, &characteristic.ccc(), &value).await
            }
            Command::ReadDescriptor(descriptor) => transport.read_descriptor(id, descriptor).await,
            Command::WriteDescriptor { descriptor, value } => {
                transport.write_descriptor(id, descriptor, value).await
            }
            Command::ReadRssi => transport.read_rssi(id).await,
            Command::RequestMtu(mtu) => transport.request_mtu(id, *mtu).await,
            Command::SetPhy { tx, rx, options } => {
                transport.set_preferred_phy(id, *tx, *rx, *options).await
            }
            Command::ReadPhy => transport.read_phy(id).await,
            Command::RequestConnectionPriority(priority) => {
                transport.request_connection_priority(id, *priority).await?;
                let kind = self.timer_kind(SessionTimer::CommandSettle);
                self.command_timer
                    .arm(&ctx.timers, ctx.config.connection_priority_settle, kind);
                Ok(())
            }
            Command::CreateBond => {
                self.manually_bonding = true;
                let result = transport.create_bond(id).await;
                if result.is_err() {
                    self.manually_bonding = false;
                }
                result
            }
        }
    }

    fn finish_active(&mut self) {
        self.queue.pop_front();
        self.active = false;
        self.retrying = false;
    }

    /// Fail every queued command, the active one included.
    fn abort_queue(&mut self, status: GattStatus) {
        self.command_timer.cancel();
        let dropped: Vec<Command> = self.queue.drain(..).collect();
        for command in &dropped {
            self.emit(command.failure_event(&self.id, self.mtu, status));
        }
        self.active = false;
        self.retrying = false;
    }

    /// The active command's transport answer arrived.
    async fn complete_active(&mut self, ctx: &CentralContext, status: GattStatus, event: PeripheralEvent) {
        if status.is_success() || !status.is_recoverable() {
            if !status.is_success() {
                log::error!("{}: command failed with {}", self.id, status);
            }
            self.emit(event);
            self.finish_active();
        } else if self.tries >= ctx.config.max_command_tries {
            log::error!("{}: giving up after {} tries ({})", self.id, self.tries, status);
            self.emit(event);
            self.finish_active();
        } else {
            log::warn!("{}: retrying after {}", self.id, status);
            self.active = false;
            self.retrying = true;
        }
        self.next_command(ctx).await;
    }

    fn active_command(&self) -> Option<&Command> {
        if self.active {
            self.queue.front()
        } else {
            None
        }
    }

    // ---------------------------------------------------------------------
    // Event and timer dispatch
    // ---------------------------------------------------------------------

    pub(crate) async fn handle_event(&mut self, ctx: &CentralContext, event: CentralTransportEvent) -> Outcome {
        use CentralTransportEvent as E;
        let device = self.id.clone();
        match event {
            E::ConnectionStateChanged { status, state, .. } => {
                return self.on_connection_state(ctx, status, state).await;
            }
            E::ServicesDiscovered { status, services, .. } => {
                return self.on_services_discovered(ctx, status, services).await;
            }
            E::BondStateChanged { state, previous, .. } => {
                return self.on_bond_state(ctx, state, previous).await;
            }
            E::ServiceChanged { .. } => self.on_service_changed(ctx).await,
            E::CharacteristicChanged { characteristic, value, .. } => {
                self.emit(PeripheralEvent::CharacteristicChanged { device, characteristic, value });
            }
            E::CharacteristicRead { characteristic, value, status, .. } => {
                let event = PeripheralEvent::CharacteristicRead { device, characteristic, value, status };
                if matches!(self.active_command(), Some(Command::Read(c)) if *c == characteristic) {
                    self.complete_active(ctx, status, event).await;
                } else {
                    log::warn!("{}: unsolicited read of {}", self.id, characteristic);
                    self.emit(event);
                }
            }
            E::CharacteristicWritten { characteristic, status, .. } => {
                match self.active_command() {
                    Some(Command::Write { characteristic: c, value, .. }) if *c == characteristic => {
                        let value = value.clone();
                        let event = PeripheralEvent::CharacteristicWritten { device, characteristic, value, status };
                        self.complete_active(ctx, status, event).await;
                    }
                    _ => log::warn!("{}: unsolicited write completion for {}", self.id, characteristic),
                }
            }
            E::DescriptorRead { descriptor, value, status, .. } => {
                let event = PeripheralEvent::DescriptorRead { device, descriptor, value, status };
                if matches!(self.active_command(), Some(Command::ReadDescriptor(d)) if *d == descriptor) {
                    self.complete_active(ctx, status, event).await;
                } else {
                    log::warn!("{}: unsolicited descriptor read of {}", self.id, descriptor);
                    self.emit(event);
                }
            }
            E::DescriptorWritten { descriptor, status, .. } => match self.active_command() {
                Some(Command::SetSubscription { characteristic, enable })
                    if descriptor.is_ccc() && *characteristic == descriptor.characteristic =>
                {
                    let (characteristic, enabled) = (*characteristic, *enable);
                    if status.is_success() {
                        if enabled {
                            self.subscriptions.insert(characteristic);
                        } else {
                            self.subscriptions.remove(&characteristic);
                        }
                    }
                    let event = PeripheralEvent::NotificationStateUpdate { device, characteristic, enabled, status };
                    self.complete_active(ctx, status, event).await;
                }
                Some(Command::WriteDescriptor { descriptor: d, value }) if *d == descriptor => {
                    let value = value.clone();
                    let event = PeripheralEvent::DescriptorWritten { device, descriptor, value, status };
                    self.complete_active(ctx, status, event).await;
                }
                _ => log::warn!("{}: unsolicited descriptor write completion for {}", self.id, descriptor),
            },
            E::RssiRead { rssi, status, .. } => {
                let event = PeripheralEvent::RssiRead { device, rssi, status };
                if matches!(self.active_command(), Some(Command::ReadRssi)) {
                    self.complete_active(ctx, status, event).await;
                } else {
                    self.emit(event);
                }
            }
            E::MtuChanged { mtu, status, .. } => {
                if status.is_success() {
                    self.mtu = clamp_mtu(mtu);
                }
                let event = PeripheralEvent::MtuChanged { device, mtu: self.mtu, status };
                // The remote side may renegotiate on its own; only our own request completes.
                if matches!(self.active_command(), Some(Command::RequestMtu(_))) {
                    self.complete_active(ctx, status, event).await;
                } else {
                    self.emit(event);
                }
            }
            E::PhyUpdated { tx, rx, status, .. } => {
                let event = PeripheralEvent::PhyUpdated { device, tx, rx, status };
                if matches!(self.active_command(), Some(Command::SetPhy { .. })) {
                    self.complete_active(ctx, status, event).await;
                } else {
                    self.emit(event);
                }
            }
            E::PhyRead { tx, rx, status, .. } => {
                let event = PeripheralEvent::PhyRead { device, tx, rx, status };
                if matches!(self.active_command(), Some(Command::ReadPhy)) {
                    self.complete_active(ctx, status, event).await;
                } else {
                    self.emit(event);
                }
            }
            E::PairingRequest { .. }
            | E::ScanResult { .. }
            | E::ScanFailed { .. }
            | E::AdapterStateChanged(_) => {}
        }
        Outcome::None
    }

    pub(crate) async fn handle_timer(
        &mut self,
        ctx: &CentralContext,
        which: SessionTimer,
        timer: &Timer,
    ) -> Outcome {
        let slot = match which {
            SessionTimer::ConnectionTimeout | SessionTimer::CancelConfirm => &mut self.connect_timer,
            SessionTimer::BondLossDisconnect | SessionTimer::BondLostSettle => &mut self.bond_timer,
            SessionTimer::Rediscover => &mut self.discovery_timer,
            SessionTimer::CommandSettle => &mut self.command_timer,
        };
        if !slot.fire(timer) {
            log::debug!("{}: stale {:?} timer", self.id, which);
            return Outcome::None;
        }

        match which {
            SessionTimer::ConnectionTimeout => {
                log::error!("{}: connection timed out", self.id);
                self.timed_out = true;
                if let Err(e) = ctx.transport.disconnect(&self.id).await {
                    log::warn!("{}: disconnect after timeout failed: {}", self.id, e);
                }
                let kind = self.timer_kind(SessionTimer::CancelConfirm);
                self.connect_timer.arm(&ctx.timers, ctx.config.cancel_confirm_grace, kind);
                Outcome::None
            }
            SessionTimer::CancelConfirm => {
                log::info!("{}: no disconnect confirmation, completing locally", self.id);
                self.on_connection_state(ctx, HciStatus::Success, ConnectionState::Disconnected)
                    .await
            }
            SessionTimer::BondLossDisconnect => {
                if self.state == ConnectionState::Connected {
                    let _ = self.disconnect(ctx).await;
                }
                Outcome::None
            }
            SessionTimer::BondLostSettle => {
                let outcome = if self.discovered {
                    Outcome::Disconnected(HciStatus::AuthenticationFailure)
                } else {
                    Outcome::ConnectFailed(HciStatus::AuthenticationFailure)
                };
                self.complete_disconnect(ctx).await;
                outcome
            }
            SessionTimer::Rediscover => {
                if self.state == ConnectionState::Connected {
                    self.start_discovery(ctx).await;
                }
                Outcome::None
            }
            SessionTimer::CommandSettle => {
                if matches!(self.active_command(), Some(Command::RequestConnectionPriority(_))) {
                    let event = PeripheralEvent::ConnectionPriorityUpdated {
                        device: self.id.clone(),
                        status: GattStatus::Success,
                    };
                    self.complete_active(ctx, GattStatus::Success, event).await;
                }
                Outcome::None
            }
        }
    }
}

//! Device registry and scan coordinator
//!
//! Owns every [`DeviceSession`] in an arena and sorts devices into three
//! disjoint pools: connected, pending connection, and transiently discovered.
//! It also runs the two independent scanners: the application's foreground
//! scan and the address-filtered scan that finds devices awaiting autoconnect.

use std::collections::{BTreeMap, HashMap};

use super::command::Command;
use super::session::{DeviceSession, Outcome};
use super::{CentralContext, DeviceInfo, Pool, SessionKey};
use crate::ble::gatt::DeviceId;
use crate::ble::status::{AdapterState, ConnectionState, HciStatus};
use crate::ble::transport::{CentralTransportEvent, ScanFilter, ScanKind, ScanRecord};
use crate::ble::BleError;
use crate::engine::timer::{ScanTimer, Timer, TimerKind, TimerSlot};
use crate::events::{CentralEvent, PeripheralListener};

/// A running scan and what it was started with, so a periodic restart can
/// resume it unchanged.
struct ScanSession {
    filters: Vec<ScanFilter>,
    /// Name substrings matched on our side; the platform only filters exact names.
    names: Vec<String>,
    running: bool,
    timer: TimerSlot,
}

impl ScanSession {
    fn accepts(&self, record: &ScanRecord) -> bool {
        let name_ok = self.names.is_empty()
            || record
                .name
                .as_deref()
                .map(|name| self.names.iter().any(|n| name.contains(n.as_str())))
                .unwrap_or(false);
        name_ok && ScanFilter::any_match(&self.filters, record)
    }
}

pub(crate) struct Registry {
    ctx: CentralContext,
    sessions: Vec<DeviceSession>,
    index: HashMap<DeviceId, SessionKey>,
    connection_retries: HashMap<SessionKey, u32>,
    pending_autoconnect: BTreeMap<DeviceId, SessionKey>,
    pin_codes: HashMap<DeviceId, String>,
    foreground: Option<ScanSession>,
    autoconnect_scan: Option<ScanSession>,
}

impl Registry {
    pub fn new(ctx: CentralContext) -> Self {
        Self {
            ctx,
            sessions: Vec::new(),
            index: HashMap::new(),
            connection_retries: HashMap::new(),
            pending_autoconnect: BTreeMap::new(),
            pin_codes: HashMap::new(),
            foreground: None,
            autoconnect_scan: None,
        }
    }

    fn get_or_create(&mut self, id: &DeviceId) -> SessionKey {
        if let Some(key) = self.index.get(id) {
            return *key;
        }
        let key = SessionKey(self.sessions.len());
        let bond_state = self.ctx.transport.bond_state(id);
        log::debug!("New session for {} ({:?})", id, bond_state);
        self.sessions.push(DeviceSession::new(key, id.clone(), bond_state));
        self.index.insert(id.clone(), key);
        key
    }

    fn lookup(&self, id: &DeviceId) -> Result<SessionKey, BleError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| BleError::UnknownDevice(id.to_string()))
    }

    fn ensure_enabled(&self) -> Result<(), BleError> {
        if self.ctx.transport.is_enabled() {
            Ok(())
        } else {
            Err(BleError::BluetoothOff)
        }
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Snapshot of a device, creating its session on first reference.
    pub fn device(&mut self, id: &DeviceId) -> DeviceInfo {
        let key = self.get_or_create(id);
        self.sessions[key.0].info()
    }

    pub fn devices_in(&self, pool: Pool) -> Vec<DeviceInfo> {
        self.sessions
            .iter()
            .filter(|s| s.pool == Some(pool))
            .map(DeviceSession::info)
            .collect()
    }

    pub fn is_scanning(&self) -> bool {
        self.foreground.is_some()
    }

    pub fn pending_autoconnects(&self) -> Vec<DeviceId> {
        self.pending_autoconnect.keys().cloned().collect()
    }

    // ---------------------------------------------------------------------
    // Connections
    // ---------------------------------------------------------------------

    pub async fn connect(&mut self, id: &DeviceId, listener: Option<PeripheralListener>) -> Result<(), BleError> {
        self.ensure_enabled()?;
        if self.pending_autoconnect.contains_key(id) {
            return Err(BleError::ConnectionInProgress);
        }
        let key = self.get_or_create(id);
        let session = &mut self.sessions[key.0];
        session.connect(&self.ctx, false).await?;
        session.set_listener(listener);
        session.pool = Some(Pool::Pending);
        self.connection_retries.insert(key, 0);
        Ok(())
    }

    /// Connect whenever the device shows up. Devices the platform cannot
    /// resolve are found with an address-filtered scan first.
    pub async fn autoconnect(&mut self, id: &DeviceId, listener: Option<PeripheralListener>) -> Result<(), BleError> {
        self.ensure_enabled()?;
        let resolvable = self.start_autoconnect(id, listener).await?;
        if !resolvable {
            self.refresh_autoconnect_scan().await;
        }
        Ok(())
    }

    /// Partition a batch into directly connectable devices and devices that
    /// need the autoconnect scan, so the scan is restarted once.
    pub async fn autoconnect_batch(
        &mut self,
        devices: Vec<(DeviceId, Option<PeripheralListener>)>,
    ) -> Result<(), BleError> {
        self.ensure_enabled()?;
        let mut needs_scan = false;
        for (id, listener) in devices {
            match self.start_autoconnect(&id, listener).await {
                Ok(resolvable) => needs_scan |= !resolvable,
                Err(e) => log::warn!("Skipping autoconnect for {}: {}", id, e),
            }
        }
        if needs_scan {
            self.refresh_autoconnect_scan().await;
        }
        Ok(())
    }

    /// Returns whether the device was connected directly.
    async fn start_autoconnect(&mut self, id: &DeviceId, listener: Option<PeripheralListener>) -> Result<bool, BleError> {
        if self.pending_autoconnect.contains_key(id) {
            return Err(BleError::ConnectionInProgress);
        }
        let key = self.get_or_create(id);
        let session = &mut self.sessions[key.0];
        match session.state() {
            ConnectionState::Disconnected => {}
            ConnectionState::Connected => return Err(BleError::AlreadyConnected),
            _ => return Err(BleError::ConnectionInProgress),
        }
        if self.ctx.transport.is_cached(id) {
            session.connect(&self.ctx, true).await?;
            session.set_listener(listener);
            session.pool = Some(Pool::Pending);
            self.connection_retries.insert(key, 0);
            Ok(true)
        } else {
            log::info!("{} is not cached, scanning for it", id);
            session.set_listener(listener);
            session.pool = Some(Pool::Pending);
            self.pending_autoconnect.insert(id.clone(), key);
            Ok(false)
        }
    }

    pub async fn cancel_connection(&mut self, id: &DeviceId) -> Result<(), BleError> {
        if let Some(key) = self.pending_autoconnect.remove(id) {
            log::info!("Cancelled autoconnect for {}", id);
            self.sessions[key.0].pool = None;
            self.ctx.emit(CentralEvent::Disconnected { device: id.clone(), status: HciStatus::Success });
            self.refresh_autoconnect_scan().await;
            return Ok(());
        }
        let key = self.lookup(id)?;
        self.sessions[key.0].cancel_connection(&self.ctx).await
    }

    pub async fn enqueue(&mut self, id: &DeviceId, command: Command) -> Result<(), BleError> {
        let key = self.lookup(id)?;
        self.sessions[key.0].enqueue(&self.ctx, command).await
    }

    pub async fn create_bond(&mut self, id: &DeviceId, listener: Option<PeripheralListener>) -> Result<(), BleError> {
        self.ensure_enabled()?;
        let key = self.get_or_create(id);
        let session = &mut self.sessions[key.0];
        session.set_listener(listener);
        session.create_bond(&self.ctx).await
    }

    pub async fn remove_bond(&mut self, id: &DeviceId) -> Result<(), BleError> {
        self.ctx.transport.remove_bond(id).await
    }

    /// Store a pin to answer the next pairing request from this device.
    pub fn set_pin_code(&mut self, id: &DeviceId, pin: &str) -> Result<(), BleError> {
        if pin.len() != 6 || !pin.bytes().all(|b| b.is_ascii_digit()) {
            return Err(BleError::InvalidPin);
        }
        self.pin_codes.insert(id.clone(), pin.to_string());
        Ok(())
    }

    fn apply_outcome(&mut self, key: SessionKey, outcome: Outcome) -> Option<SessionKey> {
        let session = &mut self.sessions[key.0];
        let device = session.id().clone();
        match outcome {
            Outcome::None => {}
            Outcome::ConnectStarted => {
                session.pool = Some(Pool::Pending);
                self.connection_retries.insert(key, 0);
            }
            Outcome::Connected => {
                session.pool = Some(Pool::Connected);
                self.connection_retries.remove(&key);
                self.ctx.emit(CentralEvent::Connected(device));
            }
            Outcome::ConnectFailed(status) => {
                let retries = self.connection_retries.get(&key).copied().unwrap_or(0);
                if status != HciStatus::ConnectionFailedEstablishment
                    && retries < self.ctx.config.max_connection_retries
                {
                    self.connection_retries.insert(key, retries + 1);
                    return Some(key);
                }
                session.pool = None;
                self.connection_retries.remove(&key);
                self.ctx.emit(CentralEvent::ConnectionFailed { device, status });
            }
            Outcome::Disconnected(status) => {
                session.pool = None;
                self.connection_retries.remove(&key);
                self.ctx.emit(CentralEvent::Disconnected { device, status });
            }
        }
        None
    }

    /// Settle a session outcome, re-issuing the connect when a retry is due.
    async fn settle(&mut self, key: SessionKey, outcome: Outcome) {
        let Some(key) = self.apply_outcome(key, outcome) else {
            return;
        };
        let session = &mut self.sessions[key.0];
        log::info!("Retrying connection to {}", session.id());
        if let Err(e) = session.connect(&self.ctx, false).await {
            log::error!("Retry for {} could not be started: {}", session.id(), e);
            let device = session.id().clone();
            session.pool = None;
            self.connection_retries.remove(&key);
            self.ctx.emit(CentralEvent::ConnectionFailed { device, status: HciStatus::Error });
        }
    }

    // ---------------------------------------------------------------------
    // Scanning
    // ---------------------------------------------------------------------

    pub async fn scan_for_services(&mut self, services: Vec<uuid::Uuid>) -> Result<(), BleError> {
        let filters = services.into_iter().map(ScanFilter::ServiceUuid).collect();
        self.start_foreground(filters, Vec::new()).await
    }

    pub async fn scan_for_names(&mut self, names: Vec<String>) -> Result<(), BleError> {
        self.start_foreground(Vec::new(), names).await
    }

    pub async fn scan_for_addresses(&mut self, devices: Vec<DeviceId>) -> Result<(), BleError> {
        let filters = devices.into_iter().map(ScanFilter::Address).collect();
        self.start_foreground(filters, Vec::new()).await
    }

    pub async fn scan_with_filters(&mut self, filters: Vec<ScanFilter>) -> Result<(), BleError> {
        self.start_foreground(filters, Vec::new()).await
    }

    pub async fn scan_unfiltered(&mut self) -> Result<(), BleError> {
        self.start_foreground(Vec::new(), Vec::new()).await
    }

    pub async fn stop_scan(&mut self) {
        self.stop_scan_session(ScanKind::Foreground).await;
        for session in self.sessions.iter_mut().filter(|s| s.pool == Some(Pool::Transient)) {
            session.pool = None;
        }
    }

    async fn start_foreground(&mut self, filters: Vec<ScanFilter>, names: Vec<String>) -> Result<(), BleError> {
        self.ensure_enabled()?;
        self.start_scan_session(ScanKind::Foreground, filters, names).await
    }

    fn scan_slot(&mut self, kind: ScanKind) -> &mut Option<ScanSession> {
        match kind {
            ScanKind::Foreground => &mut self.foreground,
            ScanKind::AutoConnect => &mut self.autoconnect_scan,
        }
    }

    async fn start_scan_session(
        &mut self,
        kind: ScanKind,
        filters: Vec<ScanFilter>,
        names: Vec<String>,
    ) -> Result<(), BleError> {
        self.stop_scan_session(kind).await;
        self.ctx.transport.start_scan(kind, &filters).await?;
        log::info!("{:?} scan started with {} filters", kind, filters.len() + names.len());
        let mut session = ScanSession { filters, names, running: true, timer: TimerSlot::default() };
        session.timer.arm(
            &self.ctx.timers,
            self.ctx.config.scan_restart_period,
            TimerKind::Scan(kind, ScanTimer::Restart),
        );
        *self.scan_slot(kind) = Some(session);
        Ok(())
    }

    async fn stop_scan_session(&mut self, kind: ScanKind) {
        let Some(mut session) = self.scan_slot(kind).take() else {
            return;
        };
        session.timer.cancel();
        if session.running {
            if let Err(e) = self.ctx.transport.stop_scan(kind).await {
                log::warn!("Stopping {:?} scan failed: {}", kind, e);
            }
            log::info!("{:?} scan stopped", kind);
        }
    }

    /// Start, narrow or stop the autoconnect scan to match the pending set.
    async fn refresh_autoconnect_scan(&mut self) {
        if self.pending_autoconnect.is_empty() {
            self.stop_scan_session(ScanKind::AutoConnect).await;
            return;
        }
        let filters = self.pending_autoconnect.keys().cloned().map(ScanFilter::Address).collect();
        if let Err(e) = self.start_scan_session(ScanKind::AutoConnect, filters, Vec::new()).await {
            log::error!("Autoconnect scan could not be started: {}", e);
            self.fail_pending_autoconnects(HciStatus::Error);
        }
    }

    /// Give up on every device still waiting for the autoconnect scan.
    fn fail_pending_autoconnects(&mut self, status: HciStatus) {
        for (device, key) in std::mem::take(&mut self.pending_autoconnect) {
            log::warn!("Autoconnect for {} abandoned", device);
            self.sessions[key.0].pool = None;
            self.ctx.emit(CentralEvent::ConnectionFailed { device, status });
        }
    }

    async fn on_scan_result(&mut self, kind: ScanKind, record: ScanRecord) {
        match kind {
            ScanKind::Foreground => {
                let accepted = self.foreground.as_ref().map(|s| s.accepts(&record)).unwrap_or(false);
                if !accepted {
                    return;
                }
                let key = self.get_or_create(&record.device);
                let session = &mut self.sessions[key.0];
                if session.pool.is_none() {
                    session.pool = Some(Pool::Transient);
                }
                self.ctx.emit(CentralEvent::Discovered(record));
            }
            ScanKind::AutoConnect => {
                let Some(key) = self.pending_autoconnect.remove(&record.device) else {
                    return;
                };
                log::info!("Found {} for autoconnect", record.device);
                self.stop_scan_session(ScanKind::AutoConnect).await;
                let session = &mut self.sessions[key.0];
                match session.connect(&self.ctx, false).await {
                    Ok(()) => {
                        self.connection_retries.insert(key, 0);
                    }
                    Err(e) => {
                        log::error!("Connect to {} failed to start: {}", record.device, e);
                        session.pool = None;
                        self.ctx.emit(CentralEvent::ConnectionFailed {
                            device: record.device,
                            status: HciStatus::Error,
                        });
                    }
                }
                self.refresh_autoconnect_scan().await;
            }
        }
    }

    async fn on_scan_timer(&mut self, kind: ScanKind, which: ScanTimer, timer: &Timer) {
        let ctx = &self.ctx;
        let slot = match kind {
            ScanKind::Foreground => &mut self.foreground,
            ScanKind::AutoConnect => &mut self.autoconnect_scan,
        };
        let Some(session) = slot.as_mut() else {
            return;
        };
        if !session.timer.fire(timer) {
            log::debug!("Stale {:?} scan timer", kind);
            return;
        }
        match which {
            ScanTimer::Restart => {
                log::debug!("Restarting {:?} scan", kind);
                session.running = false;
                if let Err(e) = ctx.transport.stop_scan(kind).await {
                    log::warn!("Stopping {:?} scan failed: {}", kind, e);
                }
                session
                    .timer
                    .arm(&ctx.timers, ctx.config.scan_restart_delay, TimerKind::Scan(kind, ScanTimer::Resume));
            }
            ScanTimer::Resume => {
                let resumed = ctx.transport.start_scan(kind, &session.filters).await;
                match resumed {
                    Ok(()) => {
                        session.running = true;
                        session.timer.arm(
                            &ctx.timers,
                            ctx.config.scan_restart_period,
                            TimerKind::Scan(kind, ScanTimer::Restart),
                        );
                    }
                    Err(e) => {
                        log::error!("{:?} scan could not be resumed: {}", kind, e);
                        *slot = None;
                    }
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Adapter
    // ---------------------------------------------------------------------

    async fn on_adapter_state(&mut self, state: AdapterState) {
        log::info!("Adapter is {:?}", state);
        match state {
            AdapterState::TurningOff => {
                for session in self.sessions.iter_mut().filter(|s| s.pool.is_some()) {
                    if session.pool == Some(Pool::Transient) {
                        continue;
                    }
                    if let Err(e) = session.cancel_connection(&self.ctx).await {
                        log::debug!("{}: {}", session.id(), e);
                    }
                }
            }
            AdapterState::Off => self.release_all().await,
            AdapterState::On | AdapterState::TurningOn => {}
        }
        self.ctx.emit(CentralEvent::AdapterStateChanged(state));
    }

    /// Drop every link, pool and scan without waiting on the transport.
    async fn release_all(&mut self) {
        self.stop_scan_session(ScanKind::Foreground).await;
        self.stop_scan_session(ScanKind::AutoConnect).await;
        self.fail_pending_autoconnects(HciStatus::ConnectionTerminatedByLocalHost);
        self.connection_retries.clear();
        for session in self.sessions.iter_mut() {
            match session.pool.take() {
                Some(Pool::Connected) | Some(Pool::Pending) => {
                    let device = session.id().clone();
                    let was_linked = session.state() != ConnectionState::Disconnected;
                    session.force_disconnect(&self.ctx).await;
                    if was_linked {
                        self.ctx.emit(CentralEvent::Disconnected { device, status: HciStatus::Success });
                    }
                }
                Some(Pool::Transient) | None => {}
            }
        }
    }

    pub async fn shutdown(&mut self) {
        self.release_all().await;
        self.pin_codes.clear();
    }

    // ---------------------------------------------------------------------
    // Dispatch
    // ---------------------------------------------------------------------

    pub async fn handle_event(&mut self, event: CentralTransportEvent) {
        use CentralTransportEvent as E;
        let device = match &event {
            E::ScanResult { .. } | E::ScanFailed { .. } | E::AdapterStateChanged(_) | E::PairingRequest { .. } => None,
            E::ConnectionStateChanged { device, .. }
            | E::ServicesDiscovered { device, .. }
            | E::CharacteristicRead { device, .. }
            | E::CharacteristicWritten { device, .. }
            | E::CharacteristicChanged { device, .. }
            | E::DescriptorRead { device, .. }
            | E::DescriptorWritten { device, .. }
            | E::RssiRead { device, .. }
            | E::MtuChanged { device, .. }
            | E::PhyUpdated { device, .. }
            | E::PhyRead { device, .. }
            | E::ServiceChanged { device }
            | E::BondStateChanged { device, .. } => Some(device.clone()),
        };

        let Some(device) = device else {
            match event {
                E::ScanResult { kind, record } => self.on_scan_result(kind, record).await,
                E::ScanFailed { kind, failure } => {
                    log::error!("{:?} scan failed: {:?}", kind, failure);
                    if let Some(mut session) = self.scan_slot(kind).take() {
                        session.timer.cancel();
                    }
                    self.ctx.emit(CentralEvent::ScanFailed(failure));
                    if kind == ScanKind::AutoConnect {
                        self.fail_pending_autoconnects(HciStatus::Error);
                    }
                }
                E::AdapterStateChanged(state) => self.on_adapter_state(state).await,
                E::PairingRequest { device, variant } => {
                    log::info!("Pairing request from {} ({:?})", device, variant);
                    if let Some(pin) = self.pin_codes.get(&device) {
                        if let Err(e) = self.ctx.transport.set_pairing_pin(&device, pin).await {
                            log::error!("Supplying pin to {} failed: {}", device, e);
                        }
                    }
                }
                _ => {}
            }
            return;
        };

        let Some(key) = self.index.get(&device).copied() else {
            log::warn!("Event for unknown device {}", device);
            return;
        };
        let outcome = self.sessions[key.0].handle_event(&self.ctx, event).await;
        self.settle(key, outcome).await;
    }

    pub async fn handle_timer(&mut self, timer: Timer) {
        match timer.kind {
            TimerKind::Session(key, which) => {
                let Some(session) = self.sessions.get_mut(key.0) else {
                    return;
                };
                let outcome = session.handle_timer(&self.ctx, which, &timer).await;
                self.settle(key, outcome).await;
            }
            TimerKind::Scan(kind, which) => self.on_scan_timer(kind, which, &timer).await,
        }
    }
}

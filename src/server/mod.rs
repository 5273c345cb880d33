//! Peripheral role: serve local attributes to remote centrals
//!
//! Tracks every connected central with its MTU, subscriptions, prepared-write
//! staging and outbound notification queue. Attribute values belong to the
//! application and are fetched and validated through [`ServerHandler`].

pub mod central;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use self::central::{parse_ccc_write, read_chunk, RemoteCentral, Subscription};
use crate::ble::gatt::{
    find_characteristic, AttributeId, CharacteristicId, DescriptorId, DeviceId, GattService, Properties,
};
use crate::ble::status::{ConnectionState, GattStatus};
use crate::ble::transport::{AdvertiseData, AdvertiseSettings, ServerTransport, ServerTransportEvent};
use crate::ble::BleError;
use crate::central::session::clamp_mtu;
use crate::codec::to_hex;
use crate::events::ServerEvent;

/// Status and value answering a read request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    pub status: GattStatus,
    pub value: Vec<u8>,
}

impl ReadResponse {
    pub fn ok(value: Vec<u8>) -> Self {
        Self { status: GattStatus::Success, value }
    }

    pub fn error(status: GattStatus) -> Self {
        Self { status, value: Vec::new() }
    }
}

/// Application hooks for the server role. Called on the dispatch task, so
/// implementations must not block.
pub trait ServerHandler: Send + Sync {
    fn on_characteristic_read(&self, _central: &DeviceId, _characteristic: &CharacteristicId) -> ReadResponse {
        ReadResponse::ok(Vec::new())
    }

    /// Accept or reject a complete value. Prepared writes are validated here
    /// once, when they are executed.
    fn on_characteristic_write(
        &self,
        _central: &DeviceId,
        _characteristic: &CharacteristicId,
        _value: &[u8],
    ) -> GattStatus {
        GattStatus::Success
    }

    fn on_descriptor_read(&self, _central: &DeviceId, _descriptor: &DescriptorId) -> ReadResponse {
        ReadResponse::ok(Vec::new())
    }

    fn on_descriptor_write(&self, _central: &DeviceId, _descriptor: &DescriptorId, _value: &[u8]) -> GattStatus {
        GattStatus::Success
    }
}

/// Handler that accepts everything and serves empty values.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl ServerHandler for AcceptAll {}

/// Snapshot of a connected central.
#[derive(Debug, Clone, PartialEq)]
pub struct CentralInfo {
    pub id: DeviceId,
    pub mtu: u16,
    pub subscriptions: Vec<(CharacteristicId, Subscription)>,
    pub queued_notifications: usize,
}

pub(crate) struct ServerDispatch {
    transport: Arc<dyn ServerTransport>,
    handler: Arc<dyn ServerHandler>,
    events: mpsc::UnboundedSender<ServerEvent>,
    services: Vec<GattService>,
    /// Services waiting to be added; the head is in flight when `adding` is set.
    pending_services: VecDeque<GattService>,
    adding: bool,
    centrals: HashMap<DeviceId, RemoteCentral>,
    advertising: bool,
}

impl ServerDispatch {
    pub fn new(
        transport: Arc<dyn ServerTransport>,
        handler: Arc<dyn ServerHandler>,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        Self {
            transport,
            handler,
            events,
            services: Vec::new(),
            pending_services: VecDeque::new(),
            adding: false,
            centrals: HashMap::new(),
            advertising: false,
        }
    }

    fn emit(&self, event: ServerEvent) {
        if self.events.send(event).is_err() {
            log::debug!("Server event receiver is gone");
        }
    }

    async fn respond(&self, central: &DeviceId, request_id: u32, status: GattStatus, offset: usize, value: &[u8]) {
        if let Err(e) = self
            .transport
            .send_response(central, request_id, status, offset, value)
            .await
        {
            log::error!("Response {} to {} failed: {}", request_id, central, e);
        }
    }

    // ---------------------------------------------------------------------
    // Attribute database
    // ---------------------------------------------------------------------

    pub fn services(&self) -> Vec<GattService> {
        self.services.clone()
    }

    pub fn connected_centrals(&self) -> Vec<CentralInfo> {
        let mut centrals: Vec<CentralInfo> = self
            .centrals
            .iter()
            .map(|(id, c)| CentralInfo {
                id: id.clone(),
                mtu: c.mtu,
                subscriptions: c.subscriptions.iter().map(|(k, v)| (*k, *v)).collect(),
                queued_notifications: c.notify_queue.len(),
            })
            .collect();
        centrals.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        centrals
    }

    /// Queue a service; the transport adds them one at a time.
    pub async fn add_service(&mut self, service: GattService) {
        log::debug!("Queueing service {}", service.uuid);
        self.pending_services.push_back(service);
        self.add_next_service().await;
    }

    async fn add_next_service(&mut self) {
        while !self.adding {
            let Some(service) = self.pending_services.front() else {
                return;
            };
            match self.transport.add_service(service).await {
                Ok(()) => self.adding = true,
                Err(e) => {
                    log::error!("Adding service {} failed: {}", service.uuid, e);
                    if let Some(service) = self.pending_services.pop_front() {
                        self.emit(ServerEvent::ServiceAdded { service, status: GattStatus::Failure });
                    }
                }
            }
        }
    }

    async fn on_service_added(&mut self, uuid: Uuid, status: GattStatus) {
        let matches_head = self.adding && self.pending_services.front().map(|s| s.uuid) == Some(uuid);
        if !matches_head {
            log::warn!("Unexpected service-added event for {}", uuid);
            return;
        }
        self.adding = false;
        if let Some(service) = self.pending_services.pop_front() {
            if status.is_success() {
                log::info!("Service {} added", uuid);
                self.services.push(service.clone());
            } else {
                log::error!("Service {} was not added: {}", uuid, status);
            }
            self.emit(ServerEvent::ServiceAdded { service, status });
        }
        self.add_next_service().await;
    }

    pub async fn remove_service(&mut self, uuid: Uuid) -> Result<(), BleError> {
        if !self.services.iter().any(|s| s.uuid == uuid) {
            return Err(BleError::AttributeNotFound(uuid.to_string()));
        }
        self.transport.remove_service(uuid).await?;
        self.services.retain(|s| s.uuid != uuid);
        Ok(())
    }

    pub async fn remove_all_services(&mut self) {
        self.transport.clear_services().await;
        self.services.clear();
    }

    // ---------------------------------------------------------------------
    // Advertising and connections
    // ---------------------------------------------------------------------

    pub async fn start_advertising(
        &mut self,
        settings: &AdvertiseSettings,
        data: &AdvertiseData,
        scan_response: &AdvertiseData,
    ) -> Result<(), BleError> {
        self.transport.start_advertising(settings, data, scan_response).await
    }

    pub async fn stop_advertising(&mut self) -> Result<(), BleError> {
        self.transport.stop_advertising().await?;
        if self.advertising {
            self.advertising = false;
            self.emit(ServerEvent::AdvertisingStopped);
        }
        Ok(())
    }

    pub async fn cancel_central_connection(&mut self, central: &DeviceId) -> Result<(), BleError> {
        if !self.centrals.contains_key(central) {
            return Err(BleError::UnknownDevice(central.to_string()));
        }
        self.transport.cancel_connection(central).await
    }

    /// Stop advertising and drop every service and central.
    pub async fn close(&mut self) {
        if self.advertising {
            let _ = self.stop_advertising().await;
        }
        let ids: Vec<DeviceId> = self.centrals.keys().cloned().collect();
        for id in ids {
            self.drop_central(&id);
        }
        self.pending_services.clear();
        self.adding = false;
        self.services.clear();
        self.transport.clear_services().await;
        self.transport.close().await;
    }

    fn drop_central(&mut self, id: &DeviceId) {
        let Some(mut central) = self.centrals.remove(id) else {
            return;
        };
        for (characteristic, value) in central.notify_queue.drain(..) {
            self.emit(ServerEvent::NotificationSent {
                central: id.clone(),
                characteristic,
                value,
                status: GattStatus::Failure,
            });
        }
        self.emit(ServerEvent::CentralDisconnected(id.clone()));
    }

    fn on_connection_state(&mut self, central: DeviceId, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                log::info!("Central {} connected", central);
                self.centrals.insert(central.clone(), RemoteCentral::default());
                self.emit(ServerEvent::CentralConnected(central));
            }
            ConnectionState::Disconnected => {
                log::info!("Central {} disconnected", central);
                self.drop_central(&central);
            }
            ConnectionState::Connecting | ConnectionState::Disconnecting => {}
        }
    }

    // ---------------------------------------------------------------------
    // Notifications
    // ---------------------------------------------------------------------

    /// Send a value to every central subscribed to `characteristic`. Returns
    /// false when nobody is listening.
    pub async fn notify(&mut self, characteristic: CharacteristicId, value: Vec<u8>) -> Result<bool, BleError> {
        let properties = find_characteristic(&self.services, &characteristic)
            .map(|c| c.properties)
            .ok_or_else(|| BleError::AttributeNotFound(characteristic.to_string()))?;
        if !properties.contains(Properties::NOTIFY) && !properties.contains(Properties::INDICATE) {
            return Ok(false);
        }
        let subscribers: Vec<DeviceId> = self
            .centrals
            .iter()
            .filter(|(_, c)| c.subscriptions.contains_key(&characteristic))
            .map(|(id, _)| id.clone())
            .collect();
        if subscribers.is_empty() {
            return Ok(false);
        }
        log::debug!("Notifying {} centrals of <{}>", subscribers.len(), to_hex(&value));
        for id in subscribers {
            if let Some(central) = self.centrals.get_mut(&id) {
                central.notify_queue.push_back((characteristic, value.clone()));
            }
            self.pump_notifications(&id).await;
        }
        Ok(true)
    }

    /// Send the next queued notification for one central, one at a time.
    async fn pump_notifications(&mut self, id: &DeviceId) {
        loop {
            let Some(central) = self.centrals.get_mut(id) else {
                return;
            };
            if central.in_flight {
                return;
            }
            let Some((characteristic, value)) = central.notify_queue.front().cloned() else {
                return;
            };
            let confirm = match central.subscriptions.get(&characteristic) {
                Some(subscription) => *subscription == Subscription::Indicate,
                None => {
                    central.notify_queue.pop_front();
                    self.emit(ServerEvent::NotificationSent {
                        central: id.clone(),
                        characteristic,
                        value,
                        status: GattStatus::Failure,
                    });
                    continue;
                }
            };
            central.in_flight = true;
            if let Err(e) = self.transport.notify(id, &characteristic, confirm, &value).await {
                log::error!("Notification to {} failed: {}", id, e);
                if let Some(central) = self.centrals.get_mut(id) {
                    central.in_flight = false;
                    central.notify_queue.pop_front();
                }
                self.emit(ServerEvent::NotificationSent {
                    central: id.clone(),
                    characteristic,
                    value,
                    status: GattStatus::Failure,
                });
            }
        }
    }

    async fn on_notification_sent(&mut self, id: DeviceId, status: GattStatus) {
        let Some(central) = self.centrals.get_mut(&id) else {
            log::warn!("Notification ack from unknown central {}", id);
            return;
        };
        if !central.in_flight {
            log::warn!("Unexpected notification ack from {}", id);
            return;
        }
        central.in_flight = false;
        if let Some((characteristic, value)) = central.notify_queue.pop_front() {
            self.emit(ServerEvent::NotificationSent { central: id.clone(), characteristic, value, status });
        }
        self.pump_notifications(&id).await;
    }

    // ---------------------------------------------------------------------
    // Requests from centrals
    // ---------------------------------------------------------------------

    async fn on_read(&mut self, id: DeviceId, request_id: u32, offset: usize, attribute: AttributeId) {
        let Some(central) = self.centrals.get(&id) else {
            log::warn!("Read from unknown central {}", id);
            self.respond(&id, request_id, GattStatus::Failure, offset, &[]).await;
            return;
        };
        let mtu = central.mtu;

        let value = match attribute {
            AttributeId::Descriptor(descriptor) if descriptor.is_ccc() => {
                let subscription = central.subscriptions.get(&descriptor.characteristic).copied();
                Subscription::ccc_value(subscription).to_vec()
            }
            _ => {
                let cached = if offset == 0 { None } else { central.cached_read(&attribute).cloned() };
                match cached {
                    Some(value) => value,
                    None => {
                        let response = match &attribute {
                            AttributeId::Characteristic(c) => self.handler.on_characteristic_read(&id, c),
                            AttributeId::Descriptor(d) => self.handler.on_descriptor_read(&id, d),
                        };
                        if !response.status.is_success() {
                            self.respond(&id, request_id, response.status, offset, &[]).await;
                            return;
                        }
                        if let Some(central) = self.centrals.get_mut(&id) {
                            central.cache_read(attribute, response.value.clone());
                        }
                        response.value
                    }
                }
            }
        };

        match read_chunk(&value, offset, mtu) {
            Ok(chunk) => self.respond(&id, request_id, GattStatus::Success, offset, chunk).await,
            Err(status) => self.respond(&id, request_id, status, offset, &[]).await,
        }
    }

    async fn on_write(
        &mut self,
        id: DeviceId,
        request_id: u32,
        attribute: AttributeId,
        prepared: bool,
        response_needed: bool,
        offset: usize,
        value: Vec<u8>,
    ) {
        let Some(central) = self.centrals.get_mut(&id) else {
            log::warn!("Write from unknown central {}", id);
            if response_needed {
                self.respond(&id, request_id, GattStatus::Failure, offset, &value).await;
            }
            return;
        };

        let status = if prepared {
            let status = central.stage(attribute, offset, &value);
            if !status.is_success() {
                log::warn!("{}: prepared write at offset {} rejected", id, offset);
            }
            status
        } else {
            self.commit(&id, attribute, value.clone())
        };

        if response_needed {
            self.respond(&id, request_id, status, offset, &value).await;
        }
    }

    /// Validate a complete value with the handler and report it on success.
    /// CCC values update the subscription table instead.
    fn commit(&mut self, id: &DeviceId, attribute: AttributeId, value: Vec<u8>) -> GattStatus {
        match attribute {
            AttributeId::Descriptor(descriptor) if descriptor.is_ccc() => self.write_ccc(id, descriptor, &value),
            AttributeId::Characteristic(characteristic) => {
                let status = self.handler.on_characteristic_write(id, &characteristic, &value);
                if status.is_success() {
                    self.emit(ServerEvent::CharacteristicWriteCompleted { central: id.clone(), characteristic, value });
                }
                status
            }
            AttributeId::Descriptor(descriptor) => {
                let status = self.handler.on_descriptor_write(id, &descriptor, &value);
                if status.is_success() {
                    self.emit(ServerEvent::DescriptorWriteCompleted { central: id.clone(), descriptor, value });
                }
                status
            }
        }
    }

    fn write_ccc(&mut self, id: &DeviceId, descriptor: DescriptorId, value: &[u8]) -> GattStatus {
        let characteristic = descriptor.characteristic;
        let Some(definition) = find_characteristic(&self.services, &characteristic) else {
            return GattStatus::AttributeNotFound;
        };
        let subscription = match parse_ccc_write(definition, value) {
            Ok(subscription) => subscription,
            Err(status) => {
                log::warn!("{}: CCC write <{}> on {} rejected: {}", id, to_hex(value), characteristic, status);
                return status;
            }
        };
        let Some(central) = self.centrals.get_mut(id) else {
            return GattStatus::Failure;
        };
        match subscription {
            Some(subscription) => {
                central.subscriptions.insert(characteristic, subscription);
                self.emit(ServerEvent::NotifyingEnabled { central: id.clone(), characteristic });
            }
            None => {
                if central.subscriptions.remove(&characteristic).is_some() {
                    self.emit(ServerEvent::NotifyingDisabled { central: id.clone(), characteristic });
                }
            }
        }
        GattStatus::Success
    }

    async fn on_execute_write(&mut self, id: DeviceId, request_id: u32, execute: bool) {
        let staged = match self.centrals.get_mut(&id) {
            Some(central) => central.take_staging(),
            None => Vec::new(),
        };
        let mut status = GattStatus::Success;
        if execute {
            for (attribute, value) in staged {
                status = self.commit(&id, attribute, value);
                if !status.is_success() {
                    log::warn!("{}: executing prepared write failed: {}", id, status);
                    break;
                }
            }
        } else {
            log::debug!("{}: discarded {} prepared writes", id, staged.len());
        }
        self.respond(&id, request_id, status, 0, &[]).await;
    }

    pub async fn handle_event(&mut self, event: ServerTransportEvent) {
        use ServerTransportEvent as E;
        match event {
            E::ConnectionStateChanged { central, status, state } => {
                if !status.is_success() {
                    log::warn!("Central {} reported {:?} with {}", central, state, status);
                }
                self.on_connection_state(central, state);
            }
            E::ServiceAdded { service, status } => self.on_service_added(service, status).await,
            E::CharacteristicReadRequest { central, request_id, offset, characteristic } => {
                self.on_read(central, request_id, offset, AttributeId::Characteristic(characteristic))
                    .await
            }
            E::DescriptorReadRequest { central, request_id, offset, descriptor } => {
                self.on_read(central, request_id, offset, AttributeId::Descriptor(descriptor))
                    .await
            }
            E::CharacteristicWriteRequest {
                central,
                request_id,
                characteristic,
                prepared,
                response_needed,
                offset,
                value,
            } => {
                let attribute = AttributeId::Characteristic(characteristic);
                self.on_write(central, request_id, attribute, prepared, response_needed, offset, value)
                    .await
            }
            E::DescriptorWriteRequest {
                central,
                request_id,
                descriptor,
                prepared,
                response_needed,
                offset,
                value,
            } => {
                let attribute = AttributeId::Descriptor(descriptor);
                self.on_write(central, request_id, attribute, prepared, response_needed, offset, value)
                    .await
            }
            E::ExecuteWrite { central, request_id, execute } => {
                self.on_execute_write(central, request_id, execute).await
            }
            E::NotificationSent { central, status } => self.on_notification_sent(central, status).await,
            E::MtuChanged { central, mtu } => match self.centrals.get_mut(&central) {
                Some(remote) => {
                    log::debug!("Central {} MTU {}", central, mtu);
                    remote.mtu = clamp_mtu(mtu);
                }
                None => log::warn!("MTU change for unknown central {}", central),
            },
            E::AdvertisingStarted => {
                log::info!("Advertising started");
                self.advertising = true;
                self.emit(ServerEvent::AdvertisingStarted);
            }
            E::AdvertisingFailed(code) => {
                log::error!("Advertising failed with code {}", code);
                self.advertising = false;
                self.emit(ServerEvent::AdvertisingFailed(code));
            }
        }
    }
}

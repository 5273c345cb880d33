//! Single-consumer dispatch loop
//!
//! One tokio task owns the registry, every device session and the server
//! state. Application calls, transport events and timers all arrive as
//! messages on one inbox and each is handled to completion before the next,
//! so no handler ever sees a half-updated session.

pub(crate) mod message;
pub(crate) mod timer;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use self::message::{Message, Reply, Request, ScanRequest};
use self::timer::Timers;
use crate::ble::gatt::{CharacteristicId, DeviceId, GattService};
use crate::ble::transport::{
    AdvertiseData, AdvertiseSettings, CentralTransport, ScanFilter, ServerTransport, TransportEvent,
};
use crate::ble::BleError;
use crate::central::registry::Registry;
use crate::central::{CentralContext, Command, DeviceInfo, Pool};
use crate::config::EngineConfig;
use crate::events::{CentralEvent, PeripheralListener, ServerEvent};
use crate::server::{CentralInfo, ServerDispatch, ServerHandler};

/// Application-facing event streams.
pub struct EngineEvents {
    pub central: mpsc::UnboundedReceiver<CentralEvent>,
    pub server: mpsc::UnboundedReceiver<ServerEvent>,
}

/// Where transports post their completions and notifications.
///
/// A sink does not keep the engine running; once every [`EngineHandle`] is
/// dropped, posts are refused.
#[derive(Clone)]
pub struct EventSink {
    inbox: mpsc::WeakUnboundedSender<Message>,
}

impl EventSink {
    /// Returns false once the engine has stopped.
    pub fn post(&self, event: impl Into<TransportEvent>) -> bool {
        match self.inbox.upgrade() {
            Some(inbox) => inbox.send(Message::Event(event.into())).is_ok(),
            None => false,
        }
    }
}

pub struct Engine {
    registry: Registry,
    server: ServerDispatch,
    inbox: mpsc::UnboundedReceiver<Message>,
}

impl Engine {
    /// Spawn the dispatch loop. Must be called inside a tokio runtime.
    pub fn start(
        config: EngineConfig,
        central: Arc<dyn CentralTransport>,
        server: Arc<dyn ServerTransport>,
        handler: Arc<dyn ServerHandler>,
    ) -> (EngineHandle, EngineEvents) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (central_tx, central_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();

        let ctx = CentralContext {
            transport: central,
            config,
            timers: Timers::new(inbox_tx.downgrade()),
            events: central_tx,
        };
        let engine = Engine {
            registry: Registry::new(ctx),
            server: ServerDispatch::new(server, handler, server_tx),
            inbox: inbox_rx,
        };
        let task = tokio::spawn(engine.run());
        log::info!("Engine started");

        let handle = EngineHandle { inbox: inbox_tx, task: Arc::new(task) };
        (handle, EngineEvents { central: central_rx, server: server_rx })
    }

    async fn run(mut self) {
        while let Some(message) = self.inbox.recv().await {
            match message {
                Message::Request(request) => self.handle_request(request).await,
                Message::Event(TransportEvent::Central(event)) => self.registry.handle_event(event).await,
                Message::Event(TransportEvent::Server(event)) => self.server.handle_event(event).await,
                Message::Timer(timer) => self.registry.handle_timer(timer).await,
                Message::Barrier(reply) => {
                    let _ = reply.send(());
                }
                Message::Shutdown(reply) => {
                    log::info!("Engine shutting down");
                    self.stop().await;
                    let _ = reply.send(());
                    return;
                }
            }
        }
        log::info!("Every engine handle dropped, shutting down");
        self.stop().await;
    }

    async fn stop(&mut self) {
        self.registry.shutdown().await;
        self.server.close().await;
    }

    async fn handle_request(&mut self, request: Request) {
        let registry = &mut self.registry;
        let server = &mut self.server;
        match request {
            Request::Connect { device, listener, reply } => {
                let _ = reply.send(registry.connect(&device, listener).await);
            }
            Request::AutoConnect { device, listener, reply } => {
                let _ = reply.send(registry.autoconnect(&device, listener).await);
            }
            Request::AutoConnectBatch { devices, reply } => {
                let _ = reply.send(registry.autoconnect_batch(devices).await);
            }
            Request::CancelConnection { device, reply } => {
                let _ = reply.send(registry.cancel_connection(&device).await);
            }
            Request::Enqueue { device, command, reply } => {
                let _ = reply.send(registry.enqueue(&device, command).await);
            }
            Request::CreateBond { device, listener, reply } => {
                let _ = reply.send(registry.create_bond(&device, listener).await);
            }
            Request::RemoveBond { device, reply } => {
                let _ = reply.send(registry.remove_bond(&device).await);
            }
            Request::SetPinCode { device, pin, reply } => {
                let _ = reply.send(registry.set_pin_code(&device, &pin));
            }
            Request::Scan { scan, reply } => {
                let result = match scan {
                    ScanRequest::Services(uuids) => registry.scan_for_services(uuids).await,
                    ScanRequest::Names(names) => registry.scan_for_names(names).await,
                    ScanRequest::Addresses(devices) => registry.scan_for_addresses(devices).await,
                    ScanRequest::Filters(filters) => registry.scan_with_filters(filters).await,
                    ScanRequest::Unfiltered => registry.scan_unfiltered().await,
                };
                let _ = reply.send(result);
            }
            Request::StopScan(reply) => {
                registry.stop_scan().await;
                let _ = reply.send(());
            }
            Request::Device { device, reply } => {
                let _ = reply.send(registry.device(&device));
            }
            Request::DevicesIn { pool, reply } => {
                let _ = reply.send(registry.devices_in(pool));
            }
            Request::IsScanning(reply) => {
                let _ = reply.send(registry.is_scanning());
            }
            Request::PendingAutoconnects(reply) => {
                let _ = reply.send(registry.pending_autoconnects());
            }
            Request::AddService { service, reply } => {
                server.add_service(service).await;
                let _ = reply.send(());
            }
            Request::RemoveService { service, reply } => {
                let _ = reply.send(server.remove_service(service).await);
            }
            Request::RemoveAllServices(reply) => {
                server.remove_all_services().await;
                let _ = reply.send(());
            }
            Request::Services(reply) => {
                let _ = reply.send(server.services());
            }
            Request::ConnectedCentrals(reply) => {
                let _ = reply.send(server.connected_centrals());
            }
            Request::Notify { characteristic, value, reply } => {
                let _ = reply.send(server.notify(characteristic, value).await);
            }
            Request::StartAdvertising { settings, data, scan_response, reply } => {
                let _ = reply.send(server.start_advertising(&settings, &data, &scan_response).await);
            }
            Request::StopAdvertising(reply) => {
                let _ = reply.send(server.stop_advertising().await);
            }
            Request::CancelCentralConnection { central, reply } => {
                let _ = reply.send(server.cancel_central_connection(&central).await);
            }
            Request::CloseServer(reply) => {
                server.close().await;
                let _ = reply.send(());
            }
        }
    }
}

/// Cloneable front door to a running engine.
///
/// Every call returns as soon as the engine has accepted or rejected the
/// request. Completions arrive later as events.
#[derive(Clone)]
pub struct EngineHandle {
    inbox: mpsc::UnboundedSender<Message>,
    task: Arc<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn event_sink(&self) -> EventSink {
        EventSink { inbox: self.inbox.downgrade() }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T, BleError> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Message::Request(make(tx)))
            .map_err(|_| BleError::EngineStopped)?;
        rx.await.map_err(|_| BleError::EngineStopped)
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Result<T, BleError> {
        self.ask(make).await?
    }

    /// Resolves once every message queued before it has been handled.
    pub async fn barrier(&self) -> Result<(), BleError> {
        let (tx, rx) = oneshot::channel();
        self.inbox.send(Message::Barrier(tx)).map_err(|_| BleError::EngineStopped)?;
        rx.await.map_err(|_| BleError::EngineStopped)
    }

    /// Stop the loop after disconnecting every device and closing the server.
    pub async fn shutdown(&self) -> Result<(), BleError> {
        let (tx, rx) = oneshot::channel();
        self.inbox.send(Message::Shutdown(tx)).map_err(|_| BleError::EngineStopped)?;
        rx.await.map_err(|_| BleError::EngineStopped)
    }

    // ---------------------------------------------------------------------
    // Central role
    // ---------------------------------------------------------------------

    pub async fn connect(&self, device: &DeviceId, listener: Option<PeripheralListener>) -> Result<(), BleError> {
        let device = device.clone();
        self.call(|reply| Request::Connect { device, listener, reply }).await
    }

    pub async fn autoconnect(&self, device: &DeviceId, listener: Option<PeripheralListener>) -> Result<(), BleError> {
        let device = device.clone();
        self.call(|reply| Request::AutoConnect { device, listener, reply }).await
    }

    pub async fn autoconnect_batch(
        &self,
        devices: Vec<(DeviceId, Option<PeripheralListener>)>,
    ) -> Result<(), BleError> {
        self.call(|reply| Request::AutoConnectBatch { devices, reply }).await
    }

    pub async fn cancel_connection(&self, device: &DeviceId) -> Result<(), BleError> {
        let device = device.clone();
        self.call(|reply| Request::CancelConnection { device, reply }).await
    }

    /// Queue a command for a device. Its completion arrives on the device's
    /// listener.
    pub async fn enqueue(&self, device: &DeviceId, command: Command) -> Result<(), BleError> {
        let device = device.clone();
        self.call(|reply| Request::Enqueue { device, command, reply }).await
    }

    pub async fn create_bond(&self, device: &DeviceId, listener: Option<PeripheralListener>) -> Result<(), BleError> {
        let device = device.clone();
        self.call(|reply| Request::CreateBond { device, listener, reply }).await
    }

    pub async fn remove_bond(&self, device: &DeviceId) -> Result<(), BleError> {
        let device = device.clone();
        self.call(|reply| Request::RemoveBond { device, reply }).await
    }

    pub async fn set_pin_code(&self, device: &DeviceId, pin: &str) -> Result<(), BleError> {
        let (device, pin) = (device.clone(), pin.to_string());
        self.call(|reply| Request::SetPinCode { device, pin, reply }).await
    }

    pub async fn scan_for_services(&self, services: Vec<Uuid>) -> Result<(), BleError> {
        self.call(|reply| Request::Scan { scan: ScanRequest::Services(services), reply }).await
    }

    /// Scan for devices whose advertised name contains any of `names`.
    pub async fn scan_for_names(&self, names: Vec<String>) -> Result<(), BleError> {
        self.call(|reply| Request::Scan { scan: ScanRequest::Names(names), reply }).await
    }

    pub async fn scan_for_addresses(&self, devices: Vec<DeviceId>) -> Result<(), BleError> {
        self.call(|reply| Request::Scan { scan: ScanRequest::Addresses(devices), reply }).await
    }

    pub async fn scan_with_filters(&self, filters: Vec<ScanFilter>) -> Result<(), BleError> {
        self.call(|reply| Request::Scan { scan: ScanRequest::Filters(filters), reply }).await
    }

    pub async fn scan_unfiltered(&self) -> Result<(), BleError> {
        self.call(|reply| Request::Scan { scan: ScanRequest::Unfiltered, reply }).await
    }

    pub async fn stop_scan(&self) -> Result<(), BleError> {
        self.ask(Request::StopScan).await
    }

    /// Snapshot of a device; the first reference creates its session.
    pub async fn device(&self, device: &DeviceId) -> Result<DeviceInfo, BleError> {
        let device = device.clone();
        self.ask(|reply| Request::Device { device, reply }).await
    }

    pub async fn connected_devices(&self) -> Result<Vec<DeviceInfo>, BleError> {
        self.ask(|reply| Request::DevicesIn { pool: Pool::Connected, reply }).await
    }

    pub async fn devices_in(&self, pool: Pool) -> Result<Vec<DeviceInfo>, BleError> {
        self.ask(|reply| Request::DevicesIn { pool, reply }).await
    }

    pub async fn is_scanning(&self) -> Result<bool, BleError> {
        self.ask(Request::IsScanning).await
    }

    pub async fn pending_autoconnects(&self) -> Result<Vec<DeviceId>, BleError> {
        self.ask(Request::PendingAutoconnects).await
    }

    // ---------------------------------------------------------------------
    // Server role
    // ---------------------------------------------------------------------

    /// Queue a service. `ServerEvent::ServiceAdded` reports the outcome.
    pub async fn add_service(&self, service: GattService) -> Result<(), BleError> {
        self.ask(|reply| Request::AddService { service, reply }).await
    }

    pub async fn remove_service(&self, service: Uuid) -> Result<(), BleError> {
        self.call(|reply| Request::RemoveService { service, reply }).await
    }

    pub async fn remove_all_services(&self) -> Result<(), BleError> {
        self.ask(Request::RemoveAllServices).await
    }

    pub async fn services(&self) -> Result<Vec<GattService>, BleError> {
        self.ask(Request::Services).await
    }

    pub async fn connected_centrals(&self) -> Result<Vec<CentralInfo>, BleError> {
        self.ask(Request::ConnectedCentrals).await
    }

    /// Notify every subscribed central. `Ok(false)` means nobody is subscribed.
    pub async fn notify(&self, characteristic: CharacteristicId, value: Vec<u8>) -> Result<bool, BleError> {
        self.call(|reply| Request::Notify { characteristic, value, reply }).await
    }

    pub async fn start_advertising(
        &self,
        settings: AdvertiseSettings,
        data: AdvertiseData,
        scan_response: AdvertiseData,
    ) -> Result<(), BleError> {
        self.call(|reply| Request::StartAdvertising { settings, data, scan_response, reply })
            .await
    }

    pub async fn stop_advertising(&self) -> Result<(), BleError> {
        self.call(Request::StopAdvertising).await
    }

    pub async fn cancel_central_connection(&self, central: &DeviceId) -> Result<(), BleError> {
        let central = central.clone();
        self.call(|reply| Request::CancelCentralConnection { central, reply }).await
    }

    pub async fn close_server(&self) -> Result<(), BleError> {
        self.ask(Request::CloseServer).await
    }
}

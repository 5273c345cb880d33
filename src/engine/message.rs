use tokio::sync::oneshot;
use uuid::Uuid;

use super::timer::Timer;
use crate::ble::gatt::{CharacteristicId, DeviceId, GattService};
use crate::ble::transport::{AdvertiseData, AdvertiseSettings, ScanFilter, TransportEvent};
use crate::ble::BleError;
use crate::central::{Command, DeviceInfo, Pool};
use crate::events::PeripheralListener;
use crate::server::CentralInfo;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, BleError>>;

/// Everything the dispatch loop consumes, in arrival order.
pub(crate) enum Message {
    Request(Request),
    Event(TransportEvent),
    Timer(Timer),
    /// Answered once everything queued before it has been handled.
    Barrier(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug)]
pub(crate) enum ScanRequest {
    Services(Vec<Uuid>),
    Names(Vec<String>),
    Addresses(Vec<DeviceId>),
    Filters(Vec<ScanFilter>),
    Unfiltered,
}

pub(crate) enum Request {
    // Central role
    Connect {
        device: DeviceId,
        listener: Option<PeripheralListener>,
        reply: Reply<()>,
    },
    AutoConnect {
        device: DeviceId,
        listener: Option<PeripheralListener>,
        reply: Reply<()>,
    },
    AutoConnectBatch {
        devices: Vec<(DeviceId, Option<PeripheralListener>)>,
        reply: Reply<()>,
    },
    CancelConnection {
        device: DeviceId,
        reply: Reply<()>,
    },
    Enqueue {
        device: DeviceId,
        command: Command,
        reply: Reply<()>,
    },
    CreateBond {
        device: DeviceId,
        listener: Option<PeripheralListener>,
        reply: Reply<()>,
    },
    RemoveBond {
        device: DeviceId,
        reply: Reply<()>,
    },
    SetPinCode {
        device: DeviceId,
        pin: String,
        reply: Reply<()>,
    },
    Scan {
        scan: ScanRequest,
        reply: Reply<()>,
    },
    StopScan(oneshot::Sender<()>),
    Device {
        device: DeviceId,
        reply: oneshot::Sender<DeviceInfo>,
    },
    DevicesIn {
        pool: Pool,
        reply: oneshot::Sender<Vec<DeviceInfo>>,
    },
    IsScanning(oneshot::Sender<bool>),
    PendingAutoconnects(oneshot::Sender<Vec<DeviceId>>),

    // Server role
    AddService {
        service: GattService,
        reply: oneshot::Sender<()>,
    },
    RemoveService {
        service: Uuid,
        reply: Reply<()>,
    },
    RemoveAllServices(oneshot::Sender<()>),
    Services(oneshot::Sender<Vec<GattService>>),
    ConnectedCentrals(oneshot::Sender<Vec<CentralInfo>>),
    Notify {
        characteristic: CharacteristicId,
        value: Vec<u8>,
        reply: Reply<bool>,
    },
    StartAdvertising {
        settings: AdvertiseSettings,
        data: AdvertiseData,
        scan_response: AdvertiseData,
        reply: Reply<()>,
    },
    StopAdvertising(Reply<()>),
    CancelCentralConnection {
        central: DeviceId,
        reply: Reply<()>,
    },
    CloseServer(oneshot::Sender<()>),
}

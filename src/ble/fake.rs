//! Scripted in-memory radio for unit tests.

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ble::adapter::AdapterState;
use crate::ble::platform::{
    Advertisement, BlePlatform, CharacteristicProperties, GattCharacteristic, GattService,
    Notification, PlatformEvent, ScanFilter,
};
use crate::data::DeviceId;
use crate::error::{ConnectError, Error, Result};

/// How a scripted device answers `connect`.
#[derive(Debug, Clone)]
pub(crate) enum ConnectBehavior {
    /// Succeed after the given delay.
    Succeed(Duration),
    /// Never answer.
    Hang,
    /// Fail immediately.
    Fail(Error),
}

struct FakeDevice {
    connect: ConnectBehavior,
    services: Vec<GattService>,
    discover_error: Option<Error>,
    subscribe_error: Option<Error>,
    read_value: Vec<u8>,
    notify_tx: broadcast::Sender<Notification>,
}

#[derive(Default)]
struct Calls {
    connect: HashMap<DeviceId, usize>,
    disconnect: HashMap<DeviceId, usize>,
    subscribe: HashMap<DeviceId, usize>,
    unsubscribe: HashMap<DeviceId, usize>,
}

pub(crate) struct FakePlatform {
    state: Mutex<AdapterState>,
    events_tx: broadcast::Sender<PlatformEvent>,
    devices: Mutex<HashMap<DeviceId, FakeDevice>>,
    calls: Mutex<Calls>,
    scan_starts: AtomicUsize,
    scan_stops: AtomicUsize,
    active_scans: AtomicUsize,
    max_concurrent_scans: AtomicUsize,
}

pub(crate) fn notify_characteristic(service: u16, characteristic: u16) -> GattCharacteristic {
    GattCharacteristic {
        uuid: crate::ble::uuids::uuid_from_u16(characteristic),
        service_uuid: crate::ble::uuids::uuid_from_u16(service),
        properties: CharacteristicProperties {
            read: true,
            notify: true,
            ..Default::default()
        },
    }
}

pub(crate) fn read_only_characteristic(service: u16, characteristic: u16) -> GattCharacteristic {
    GattCharacteristic {
        properties: CharacteristicProperties {
            read: true,
            ..Default::default()
        },
        ..notify_characteristic(service, characteristic)
    }
}

/// One primary service `0x00ff` holding a readable characteristic `0x0001`
/// and a notifiable characteristic `0x1234`.
pub(crate) fn sensor_services() -> Vec<GattService> {
    vec![GattService {
        uuid: crate::ble::uuids::uuid_from_u16(0x00ff),
        primary: true,
        characteristics: vec![
            read_only_characteristic(0x00ff, 0x0001),
            notify_characteristic(0x00ff, 0x1234),
        ],
    }]
}

impl FakePlatform {
    pub(crate) fn new() -> Self {
        let (events_tx, _) = broadcast::channel(64);

        Self {
            state: Mutex::new(AdapterState::PoweredOn),
            events_tx,
            devices: Mutex::new(HashMap::new()),
            calls: Mutex::new(Calls::default()),
            scan_starts: AtomicUsize::new(0),
            scan_stops: AtomicUsize::new(0),
            active_scans: AtomicUsize::new(0),
            max_concurrent_scans: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_state(state: AdapterState) -> Self {
        let platform = Self::new();
        *platform.state.lock() = state;
        platform
    }

    /// Register a reachable device exposing [`sensor_services`].
    pub(crate) fn add_device(&self, id: &str) {
        self.add_device_with(id, ConnectBehavior::Succeed(Duration::ZERO), sensor_services());
    }

    pub(crate) fn add_device_with(
        &self,
        id: &str,
        connect: ConnectBehavior,
        services: Vec<GattService>,
    ) {
        let (notify_tx, _) = broadcast::channel(64);
        self.devices.lock().insert(
            DeviceId::new(id),
            FakeDevice {
                connect,
                services,
                discover_error: None,
                subscribe_error: None,
                read_value: b"300".to_vec(),
                notify_tx,
            },
        );
    }

    pub(crate) fn fail_discovery(&self, id: &str, error: Error) {
        if let Some(device) = self.devices.lock().get_mut(&DeviceId::new(id)) {
            device.discover_error = Some(error);
        }
    }

    pub(crate) fn fail_subscribe(&self, id: &str, error: Error) {
        if let Some(device) = self.devices.lock().get_mut(&DeviceId::new(id)) {
            device.subscribe_error = Some(error);
        }
    }

    pub(crate) fn emit(&self, event: PlatformEvent) {
        let _ = self.events_tx.send(event);
    }

    pub(crate) fn set_state(&self, state: AdapterState) {
        *self.state.lock() = state;
        self.emit(PlatformEvent::StateChanged(state));
    }

    pub(crate) fn advertise(&self, id: &str, name: Option<&str>, rssi: i16) {
        self.emit(PlatformEvent::Advertisement(Advertisement {
            id: DeviceId::new(id),
            local_name: name.map(str::to_string),
            rssi: Some(rssi),
            services: vec![],
        }));
    }

    /// Push a notification from `id` on the characteristic with short UUID `characteristic`.
    pub(crate) fn notify(&self, id: &str, characteristic: u16, value: &[u8]) {
        if let Some(device) = self.devices.lock().get(&DeviceId::new(id)) {
            let _ = device.notify_tx.send(Notification {
                characteristic_uuid: crate::ble::uuids::uuid_from_u16(characteristic),
                value: value.to_vec(),
            });
        }
    }

    pub(crate) fn scan_starts(&self) -> usize {
        self.scan_starts.load(Ordering::SeqCst)
    }

    pub(crate) fn scan_stops(&self) -> usize {
        self.scan_stops.load(Ordering::SeqCst)
    }

    pub(crate) fn max_concurrent_scans(&self) -> usize {
        self.max_concurrent_scans.load(Ordering::SeqCst)
    }

    pub(crate) fn connect_calls(&self, id: &str) -> usize {
        self.calls.lock().connect.get(&DeviceId::new(id)).copied().unwrap_or(0)
    }

    pub(crate) fn disconnect_calls(&self, id: &str) -> usize {
        self.calls.lock().disconnect.get(&DeviceId::new(id)).copied().unwrap_or(0)
    }

    pub(crate) fn subscribe_calls(&self, id: &str) -> usize {
        self.calls.lock().subscribe.get(&DeviceId::new(id)).copied().unwrap_or(0)
    }

    pub(crate) fn unsubscribe_calls(&self, id: &str) -> usize {
        self.calls.lock().unsubscribe.get(&DeviceId::new(id)).copied().unwrap_or(0)
    }

    fn unreachable(device: &DeviceId) -> Error {
        Error::Connect(ConnectError::Unreachable {
            reason: format!("no such device {}", device),
        })
    }

    fn ensure_powered(&self) -> Result<()> {
        let state = *self.state.lock();
        if state.is_powered_on() {
            Ok(())
        } else {
            Err(Error::Bluetooth(format!("radio is {}", state)))
        }
    }
}

#[async_trait]
impl BlePlatform for FakePlatform {
    async fn adapter_state(&self) -> Result<AdapterState> {
        Ok(*self.state.lock())
    }

    async fn events(&self) -> Result<BoxStream<'static, PlatformEvent>> {
        Ok(crate::utils::broadcast_stream(self.events_tx.subscribe()))
    }

    async fn start_scan(&self, _filter: &ScanFilter) -> Result<()> {
        self.ensure_powered()?;
        self.scan_starts.fetch_add(1, Ordering::SeqCst);
        let active = self.active_scans.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_scans.fetch_max(active, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.scan_stops.fetch_add(1, Ordering::SeqCst);
        let _ = self
            .active_scans
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        Ok(())
    }

    async fn connect(&self, device: &DeviceId) -> Result<()> {
        *self.calls.lock().connect.entry(device.clone()).or_default() += 1;

        let behavior = self
            .devices
            .lock()
            .get(device)
            .map(|d| d.connect.clone())
            .ok_or_else(|| Self::unreachable(device))?;

        match behavior {
            ConnectBehavior::Succeed(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            ConnectBehavior::Hang => futures::future::pending().await,
            ConnectBehavior::Fail(error) => Err(error),
        }
    }

    async fn disconnect(&self, device: &DeviceId) -> Result<()> {
        *self.calls.lock().disconnect.entry(device.clone()).or_default() += 1;
        Ok(())
    }

    async fn discover_services(&self, device: &DeviceId) -> Result<Vec<GattService>> {
        let devices = self.devices.lock();
        let fake = devices.get(device).ok_or_else(|| Self::unreachable(device))?;
        match &fake.discover_error {
            Some(error) => Err(error.clone()),
            None => Ok(fake.services.clone()),
        }
    }

    async fn notifications(&self, device: &DeviceId) -> Result<BoxStream<'static, Notification>> {
        let rx = self
            .devices
            .lock()
            .get(device)
            .map(|d| d.notify_tx.subscribe())
            .ok_or_else(|| Self::unreachable(device))?;
        Ok(crate::utils::broadcast_stream(rx))
    }

    async fn subscribe(
        &self,
        device: &DeviceId,
        _characteristic: &GattCharacteristic,
    ) -> Result<()> {
        *self.calls.lock().subscribe.entry(device.clone()).or_default() += 1;
        let error = self
            .devices
            .lock()
            .get(device)
            .and_then(|d| d.subscribe_error.clone());
        match error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn unsubscribe(
        &self,
        device: &DeviceId,
        _characteristic: &GattCharacteristic,
    ) -> Result<()> {
        *self.calls.lock().unsubscribe.entry(device.clone()).or_default() += 1;
        Ok(())
    }

    async fn read(
        &self,
        device: &DeviceId,
        characteristic: &GattCharacteristic,
    ) -> Result<Vec<u8>> {
        let devices = self.devices.lock();
        let fake = devices.get(device).ok_or_else(|| Self::unreachable(device))?;
        if !characteristic.properties.read {
            return Err(Error::Bluetooth("characteristic not readable".to_string()));
        }
        Ok(fake.read_value.clone())
    }
}

#[test]
fn test_sensor_services_layout() {
    let services = sensor_services();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].characteristics.len(), 2);
    assert!(!services[0].characteristics[0].properties.can_notify());
    assert!(services[0].characteristics[1].properties.can_notify());
    assert_eq!(
        services[0].characteristics[1].uuid,
        Uuid::from_u128(0x0000_1234_0000_1000_8000_00805f9b34fb)
    );
}

//! [`BlePlatform`] backed by `btleplug`.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter as NativeScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::{BoxStream, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::ble::adapter::AdapterState;
use crate::ble::platform::{
    Advertisement, BlePlatform, CharacteristicProperties, GattCharacteristic, GattService,
    Notification, PlatformEvent, ScanFilter,
};
use crate::data::DeviceId;
use crate::error::{ConnectError, Error, Result};

impl From<btleplug::Error> for Error {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::PermissionDenied => Error::PermissionDenied,
            btleplug::Error::DeviceNotFound | btleplug::Error::NotConnected => {
                Error::Connect(ConnectError::Unreachable {
                    reason: e.to_string(),
                })
            }
            btleplug::Error::TimedOut(_) => Error::Connect(ConnectError::Timeout),
            other => Error::Bluetooth(other.to_string()),
        }
    }
}

impl From<CentralState> for AdapterState {
    fn from(state: CentralState) -> Self {
        match state {
            CentralState::PoweredOn => AdapterState::PoweredOn,
            CentralState::PoweredOff => AdapterState::PoweredOff,
            _ => AdapterState::Unknown,
        }
    }
}

impl From<CharPropFlags> for CharacteristicProperties {
    fn from(flags: CharPropFlags) -> Self {
        Self {
            read: flags.contains(CharPropFlags::READ),
            write: flags.contains(CharPropFlags::WRITE),
            write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
            notify: flags.contains(CharPropFlags::NOTIFY),
            indicate: flags.contains(CharPropFlags::INDICATE),
        }
    }
}

impl From<&Characteristic> for GattCharacteristic {
    fn from(c: &Characteristic) -> Self {
        Self {
            uuid: c.uuid,
            service_uuid: c.service_uuid,
            properties: c.properties.into(),
        }
    }
}

type PeripheralCache = Arc<RwLock<HashMap<DeviceId, Peripheral>>>;

/// Radio access through the first adapter reported by `btleplug`.
pub struct BtleplugPlatform {
    /// The BLE adapter.
    adapter: Adapter,
    /// Peripherals seen so far, by identifier.
    peripherals: PeripheralCache,
}

impl BtleplugPlatform {
    /// Open the first available Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdapterUnavailable`] if there is no Bluetooth adapter.
    pub async fn new() -> Result<Self> {
        let unsupported = || Error::AdapterUnavailable {
            state: AdapterState::Unsupported,
        };

        let manager = Manager::new().await.map_err(|_e| unsupported())?;
        let adapters = manager.adapters().await?;
        let adapter = adapters.into_iter().next().ok_or_else(unsupported)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Use a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn peripheral(&self, device: &DeviceId) -> Result<Peripheral> {
        let cached = self.peripherals.read().get(device).cloned();
        if let Some(peripheral) = cached {
            return Ok(peripheral);
        }

        for peripheral in self.adapter.peripherals().await? {
            if peripheral.id().to_string() == device.as_str() {
                self.peripherals
                    .write()
                    .insert(device.clone(), peripheral.clone());
                return Ok(peripheral);
            }
        }

        Err(Error::Connect(ConnectError::Unreachable {
            reason: format!("unknown device {}", device),
        }))
    }

    fn native_characteristic(
        peripheral: &Peripheral,
        characteristic: &GattCharacteristic,
    ) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service_uuid)
            .ok_or_else(|| Error::CharacteristicNotFound {
                target: characteristic.uuid.to_string(),
            })
    }

    async fn map_event(
        adapter: &Adapter,
        peripherals: &PeripheralCache,
        event: CentralEvent,
    ) -> Option<PlatformEvent> {
        match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. }
            | CentralEvent::ServiceDataAdvertisement { id, .. }
            | CentralEvent::ServicesAdvertisement { id, .. } => {
                Self::advertisement(adapter, peripherals, id)
                    .await
                    .map(PlatformEvent::Advertisement)
            }
            CentralEvent::DeviceDisconnected(id) => {
                debug!("Device disconnected: {:?}", id);
                Some(PlatformEvent::Disconnected(DeviceId::new(id.to_string())))
            }
            CentralEvent::StateUpdate(state) => Some(PlatformEvent::StateChanged(state.into())),
            _ => None,
        }
    }

    async fn advertisement(
        adapter: &Adapter,
        peripherals: &PeripheralCache,
        id: PeripheralId,
    ) -> Option<Advertisement> {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return None;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return None,
        };

        let device_id = DeviceId::new(id.to_string());
        peripherals.write().insert(device_id.clone(), peripheral);

        Some(Advertisement {
            id: device_id,
            local_name: properties.local_name,
            rssi: properties.rssi,
            services: properties.services,
        })
    }
}

#[async_trait]
impl BlePlatform for BtleplugPlatform {
    async fn adapter_state(&self) -> Result<AdapterState> {
        Ok(self.adapter.adapter_state().await?.into())
    }

    async fn events(&self) -> Result<BoxStream<'static, PlatformEvent>> {
        let events = self.adapter.events().await?;
        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();

        Ok(events
            .filter_map(move |event| {
                let adapter = adapter.clone();
                let peripherals = peripherals.clone();
                async move { Self::map_event(&adapter, &peripherals, event).await }
            })
            .boxed())
    }

    async fn start_scan(&self, filter: &ScanFilter) -> Result<()> {
        let native = NativeScanFilter {
            services: filter.services.clone(),
        };

        self.adapter.start_scan(native).await.map_err(|e| match Error::from(e) {
            Error::PermissionDenied => Error::PermissionDenied,
            other => Error::Scan {
                reason: other.to_string(),
            },
        })
    }

    async fn stop_scan(&self) -> Result<()> {
        Ok(self.adapter.stop_scan().await?)
    }

    async fn connect(&self, device: &DeviceId) -> Result<()> {
        let peripheral = self.peripheral(device).await?;

        if peripheral.is_connected().await.unwrap_or(false) {
            debug!("Peripheral {} already connected at BLE level", device);
            return Ok(());
        }

        Ok(peripheral.connect().await?)
    }

    async fn disconnect(&self, device: &DeviceId) -> Result<()> {
        let peripheral = self.peripheral(device).await?;
        Ok(peripheral.disconnect().await?)
    }

    async fn discover_services(&self, device: &DeviceId) -> Result<Vec<GattService>> {
        let peripheral = self.peripheral(device).await?;
        peripheral.discover_services().await?;

        Ok(peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                primary: service.primary,
                characteristics: service.characteristics.iter().map(Into::into).collect(),
            })
            .collect())
    }

    async fn notifications(&self, device: &DeviceId) -> Result<BoxStream<'static, Notification>> {
        let peripheral = self.peripheral(device).await?;
        let notifications = peripheral.notifications().await?;

        Ok(notifications
            .map(|n| Notification {
                characteristic_uuid: n.uuid,
                value: n.value,
            })
            .boxed())
    }

    async fn subscribe(
        &self,
        device: &DeviceId,
        characteristic: &GattCharacteristic,
    ) -> Result<()> {
        let peripheral = self.peripheral(device).await?;
        let native = Self::native_characteristic(&peripheral, characteristic)?;
        Ok(peripheral.subscribe(&native).await?)
    }

    async fn unsubscribe(
        &self,
        device: &DeviceId,
        characteristic: &GattCharacteristic,
    ) -> Result<()> {
        let peripheral = self.peripheral(device).await?;
        let native = Self::native_characteristic(&peripheral, characteristic)?;
        Ok(peripheral.unsubscribe(&native).await?)
    }

    async fn read(
        &self,
        device: &DeviceId,
        characteristic: &GattCharacteristic,
    ) -> Result<Vec<u8>> {
        let peripheral = self.peripheral(device).await?;
        let native = Self::native_characteristic(&peripheral, characteristic)?;
        Ok(peripheral.read(&native).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            AdapterState::from(CentralState::PoweredOn),
            AdapterState::PoweredOn
        );
        assert_eq!(
            AdapterState::from(CentralState::PoweredOff),
            AdapterState::PoweredOff
        );
        assert_eq!(
            AdapterState::from(CentralState::Unknown),
            AdapterState::Unknown
        );
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            Error::from(btleplug::Error::PermissionDenied),
            Error::PermissionDenied
        );
        assert!(matches!(
            Error::from(btleplug::Error::DeviceNotFound),
            Error::Connect(ConnectError::Unreachable { .. })
        ));
        assert_eq!(
            Error::from(btleplug::Error::TimedOut(std::time::Duration::from_secs(1))),
            Error::Connect(ConnectError::Timeout)
        );
    }

    #[test]
    fn test_property_mapping() {
        let props = CharacteristicProperties::from(CharPropFlags::READ | CharPropFlags::NOTIFY);
        assert!(props.read);
        assert!(props.notify);
        assert!(!props.write);
        assert!(props.can_notify());
    }
}

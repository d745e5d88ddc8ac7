//! The radio seam.
//!
//! Everything the manager needs from the native BLE stack goes through
//! [`BlePlatform`]. The production implementation is
//! [`BtleplugPlatform`](crate::ble::btleplug_platform::BtleplugPlatform);
//! tests drive the manager with a scripted fake.

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::ble::adapter::AdapterState;
use crate::data::DeviceId;
use crate::error::Result;

/// Capabilities advertised by a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicProperties {
    /// Value can be read.
    pub read: bool,
    /// Value can be written with response.
    pub write: bool,
    /// Value can be written without response.
    pub write_without_response: bool,
    /// Value changes are pushed as notifications.
    pub notify: bool,
    /// Value changes are pushed as indications.
    pub indicate: bool,
}

impl CharacteristicProperties {
    /// Check whether value changes can be subscribed to.
    pub fn can_notify(&self) -> bool {
        self.notify || self.indicate
    }
}

/// A characteristic exposed by a connected peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GattCharacteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// UUID of the owning service.
    pub service_uuid: Uuid,
    /// Capabilities.
    pub properties: CharacteristicProperties,
}

/// A service exposed by a connected peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Whether this is a primary service.
    pub primary: bool,
    /// Characteristics in discovery order.
    pub characteristics: Vec<GattCharacteristic>,
}

/// Filter applied to a scan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanFilter {
    /// Only report devices advertising at least one of these services.
    /// Empty means no service filter. Passed down to the radio.
    pub services: Vec<Uuid>,
    /// Only report devices whose advertised name starts with this prefix.
    pub name_prefix: Option<String>,
}

impl ScanFilter {
    /// Filter on an advertised service.
    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.services.push(uuid);
        self
    }

    /// Filter on an advertised name prefix.
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    /// Check whether an advertisement passes this filter.
    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        if !self.services.is_empty()
            && !advertisement.services.is_empty()
            && !self
                .services
                .iter()
                .any(|s| advertisement.services.contains(s))
        {
            return false;
        }

        match &self.name_prefix {
            Some(prefix) => advertisement
                .local_name
                .as_deref()
                .map(|name| name.starts_with(prefix.as_str()))
                .unwrap_or(false),
            None => true,
        }
    }
}

/// One scan callback from the radio.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    /// The peripheral that advertised.
    pub id: DeviceId,
    /// Advertised local name.
    pub local_name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
}

/// A value-change push from a subscribed characteristic.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// UUID of the characteristic that changed.
    pub characteristic_uuid: Uuid,
    /// The new value.
    pub value: Vec<u8>,
}

/// Events delivered by the radio.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    /// The adapter changed power/authorization state.
    StateChanged(AdapterState),
    /// A scan callback.
    Advertisement(Advertisement),
    /// The link to a peripheral dropped.
    Disconnected(DeviceId),
}

/// Native BLE central operations.
///
/// Implementations classify their native errors into the crate
/// [`Error`](crate::Error) taxonomy.
#[async_trait]
pub trait BlePlatform: Send + Sync + 'static {
    /// Current adapter state.
    async fn adapter_state(&self) -> Result<AdapterState>;

    /// Stream of radio events. Called once per manager.
    async fn events(&self) -> Result<BoxStream<'static, PlatformEvent>>;

    /// Begin delivering advertisements.
    async fn start_scan(&self, filter: &ScanFilter) -> Result<()>;

    /// Stop delivering advertisements.
    async fn stop_scan(&self) -> Result<()>;

    /// Establish a link to a peripheral.
    async fn connect(&self, device: &DeviceId) -> Result<()>;

    /// Drop the link to a peripheral.
    async fn disconnect(&self, device: &DeviceId) -> Result<()>;

    /// Enumerate services and characteristics of a connected peripheral.
    async fn discover_services(&self, device: &DeviceId) -> Result<Vec<GattService>>;

    /// Stream of value-change notifications from a connected peripheral.
    async fn notifications(&self, device: &DeviceId) -> Result<BoxStream<'static, Notification>>;

    /// Enable notifications on a characteristic.
    async fn subscribe(&self, device: &DeviceId, characteristic: &GattCharacteristic)
        -> Result<()>;

    /// Disable notifications on a characteristic.
    async fn unsubscribe(
        &self,
        device: &DeviceId,
        characteristic: &GattCharacteristic,
    ) -> Result<()>;

    /// Read a characteristic value.
    async fn read(&self, device: &DeviceId, characteristic: &GattCharacteristic)
        -> Result<Vec<u8>>;
}

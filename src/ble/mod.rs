//! BLE communication module.
//!
//! The radio sits behind [`BlePlatform`]; everything above it (adapter
//! monitoring, scanning, connections, notifications) is platform independent.

pub mod adapter;
pub mod btleplug_platform;
pub mod connection;
pub mod notifications;
pub mod platform;
pub mod resolver;
pub mod scanner;
pub mod uuids;

#[cfg(test)]
pub(crate) mod fake;

pub use adapter::{AdapterMonitor, AdapterState};
pub use btleplug_platform::BtleplugPlatform;
pub use connection::{ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionState};
pub use notifications::Subscription;
pub use platform::{
    Advertisement, BlePlatform, CharacteristicProperties, GattCharacteristic, GattService,
    Notification, PlatformEvent, ScanFilter,
};
pub use resolver::TargetCharacteristic;
pub use scanner::{DeviceScanner, DeviceTable};
pub use uuids::*;

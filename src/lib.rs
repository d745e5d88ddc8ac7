// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # smartsleeve-ble
//!
//! A cross-platform Rust library that acts as a Bluetooth Low Energy
//! central for SmartSleeve sensor peripherals.
//!
//! ## Features
//!
//! - **Adapter Monitoring**: Observe the radio's power/authorization state
//! - **Scanning**: Time-bounded scan sessions with a de-duplicated device table
//! - **Connection Lifecycle**: Per-device state machine with connect timeout,
//!   coalesced concurrent connects and cancellation
//! - **Characteristic Resolution**: Pick the characteristic by UUID or the first
//!   one that notifies
//! - **Notification Decoding**: Pluggable payload decoders; malformed payloads
//!   are reported per reading without ending the stream
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use smartsleeve_ble::{CentralManager, ManagerConfig, Result, ScanFilter};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = CentralManager::new(ManagerConfig::default()).await?;
//!
//!     // Scan for ten seconds
//!     let mut scan = manager
//!         .start_scan(ScanFilter::default(), Duration::from_secs(10))
//!         .await?;
//!     while let Some(device) = scan.next().await {
//!         println!("Found {} ({:?} dBm)", device.name_or_default(), device.signal_strength);
//!     }
//!
//!     // Connect to the strongest device and print its readings
//!     if let Some(device) = manager.discovered_devices().first() {
//!         let handle = manager.connect(&device.id).await?;
//!         let mut readings = handle.readings();
//!         while let Some(reading) = readings.next().await {
//!             match reading.decoded() {
//!                 Some(value) => println!("Reading: {}", value),
//!                 None => println!("Malformed payload: {:02X?}", reading.raw),
//!             }
//!         }
//!     }
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod callback;
pub mod central;
pub mod config;
pub mod data;
pub mod error;
pub mod events;
pub mod protocol;
pub mod utils;

// Re-exports for convenience
pub use callback::CallbackHandle;
pub use central::CentralManager;
pub use config::ManagerConfig;
pub use error::{ConnectError, DecodeError, Error, ErrorKind, Result};
pub use events::{CentralEvent, ScanStopReason};
pub use utils::format_water_level;

// Re-export commonly used types from submodules
pub use ble::adapter::AdapterState;
pub use ble::connection::{ConnectionHandle, ConnectionState};
pub use ble::platform::{BlePlatform, ScanFilter};
pub use ble::resolver::TargetCharacteristic;
pub use data::{DeviceId, DiscoveredDevice, Reading, ReadingValue};
pub use protocol::{Decoder, NumericTextDecoder, Utf8TextDecoder};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<CentralManager>();
        let _ = std::any::TypeId::of::<ManagerConfig>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<ConnectionState>();
        let _ = std::any::TypeId::of::<DiscoveredDevice>();
        let _ = std::any::TypeId::of::<Reading>();
        let _ = std::any::TypeId::of::<CentralEvent>();
    }

    #[test]
    fn test_water_level_format() {
        assert_eq!(format_water_level(Some(300.0)), "300 ml");
        assert_eq!(format_water_level(None), "--.-- ml");
    }
}

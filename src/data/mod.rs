//! Data structures surfaced to callers.
//!
//! Discovered devices and decoded readings.

pub mod device;
pub mod reading;

pub use device::{DeviceId, DiscoveredDevice};
pub use reading::{Reading, ReadingValue};

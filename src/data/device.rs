//! Discovered device data structures.

use chrono::{DateTime, Utc};

/// Platform-assigned identifier of a peripheral.
///
/// On Linux this is the Bluetooth address, on macOS a random UUID assigned
/// by CoreBluetooth. Treat it as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A peripheral seen during a scan session.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveredDevice {
    /// Platform identifier, unique within a session.
    pub id: DeviceId,
    /// Advertised local name, if any.
    pub display_name: Option<String>,
    /// Signal strength in dBm.
    pub signal_strength: Option<i16>,
    /// When the device was last heard from.
    pub last_seen_at: DateTime<Utc>,
}

impl DiscoveredDevice {
    /// Placeholder shown for devices without an advertised name.
    pub const UNNAMED: &'static str = "Unnamed Device";

    /// Name to show in a device list.
    pub fn name_or_default(&self) -> &str {
        self.display_name.as_deref().unwrap_or(Self::UNNAMED)
    }
}

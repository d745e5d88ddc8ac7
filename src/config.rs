//! Manager configuration.
//!
//! Timing parameters, channel sizes and the scan-list policies the screens
//! disagreed on live here so they can be tuned in one place.

use std::time::Duration;

use crate::ble::resolver::TargetCharacteristic;

/// Default duration of a scan session.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on a whole connect attempt (link, discovery, subscribe).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for a [`CentralManager`](crate::CentralManager).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ManagerConfig {
    /// Empty the discovered-device table whenever a new scan starts.
    /// When false, devices accumulate across scans.
    pub clear_on_rescan: bool,
    /// Start a scan by itself whenever the adapter reaches `PoweredOn`.
    pub auto_scan_on_powered_on: bool,
    /// Duration of scans started automatically.
    pub scan_timeout: Duration,
    /// Bound on a connect attempt. Expiry fails the attempt with
    /// [`ConnectError::Timeout`](crate::ConnectError::Timeout).
    pub connect_timeout: Duration,
    /// Characteristic subscribed to by `connect`.
    pub target: TargetCharacteristic,
    /// Capacity of event channels.
    pub event_capacity: usize,
    /// Capacity of each reading channel.
    pub reading_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            clear_on_rescan: true,
            auto_scan_on_powered_on: false,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            target: TargetCharacteristic::any_notifiable(),
            event_capacity: 64,
            reading_capacity: 64,
        }
    }
}

impl ManagerConfig {
    /// Set whether a new scan clears previously discovered devices.
    pub fn with_clear_on_rescan(mut self, clear: bool) -> Self {
        self.clear_on_rescan = clear;
        self
    }

    /// Set whether scanning starts automatically on power-on.
    pub fn with_auto_scan_on_powered_on(mut self, auto_scan: bool) -> Self {
        self.auto_scan_on_powered_on = auto_scan;
        self
    }

    /// Set the duration of automatic scans.
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the characteristic `connect` subscribes to.
    pub fn with_target(mut self, target: TargetCharacteristic) -> Self {
        self.target = target;
        self
    }
}

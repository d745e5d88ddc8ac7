//! Manager-level events.
//!
//! These are the occurrences a UI turns into user-visible messages
//! (snackbars, toasts). Per-device connection states and readings have
//! their own streams.

use crate::ble::adapter::AdapterState;
use crate::data::DeviceId;

/// Why a scan session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScanStopReason {
    /// The session's timeout elapsed.
    Timeout,
    /// `stop_scan` was called.
    Stopped,
    /// A newer scan replaced this one.
    Superseded,
    /// A connect attempt needed the radio.
    Connecting,
    /// The adapter left `PoweredOn`.
    AdapterUnavailable,
}

/// Event emitted by the [`CentralManager`](crate::CentralManager).
#[derive(Debug, Clone, PartialEq)]
pub enum CentralEvent {
    /// The adapter left `PoweredOn`. Reported once per loss; every scan and
    /// connection was torn down.
    AdapterUnavailable(AdapterState),
    /// A scan session ended.
    ScanStopped {
        /// Session number, increasing per `start_scan`.
        session: u64,
        /// Why it ended.
        reason: ScanStopReason,
    },
    /// A connected device dropped the link on its own.
    LinkLost(DeviceId),
}

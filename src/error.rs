//! Error types for the smartsleeve-ble crate.

use thiserror::Error;

use crate::ble::adapter::AdapterState;
use crate::ble::connection::ConnectionState;

/// The main error type for this crate.
///
/// Errors are `Clone` so that a single connection attempt can hand the same
/// outcome to every caller that coalesced onto it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Unclassified error from the underlying BLE stack.
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),

    /// The adapter is not powered on (off, unauthorized, unsupported, ...).
    #[error("Bluetooth adapter unavailable (state: {state})")]
    AdapterUnavailable {
        /// Adapter state at the time of the failure.
        state: AdapterState,
    },

    /// The platform reported the operation as unauthorized.
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    /// The platform failed to start or run a scan.
    #[error("Scan failed: {reason}")]
    Scan {
        /// Description of the scan failure.
        reason: String,
    },

    /// Establishing the link failed.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// No characteristic matched the configured target.
    #[error("Characteristic not found: {target}")]
    CharacteristicNotFound {
        /// Description of what was searched for.
        target: String,
    },

    /// Subscribing to (or unsubscribing from) notifications failed.
    #[error("Subscription failed: {reason}")]
    Subscription {
        /// Description of the subscription failure.
        reason: String,
    },

    /// A payload could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Tearing down the link failed. The device is still considered disconnected.
    #[error("Disconnect failed: {reason}")]
    Disconnect {
        /// Description of the disconnect failure.
        reason: String,
    },

    /// Operation requires a connected device.
    #[error("Device not connected: {identifier}")]
    NotConnected {
        /// The device identifier.
        identifier: String,
    },

    /// The device is in a state that does not accept the operation.
    #[error("Device busy ({state})")]
    ConnectionBusy {
        /// The state the device was in.
        state: ConnectionState,
    },

    /// The device is subscribed to a different characteristic than requested.
    #[error("Requested characteristic {requested} but device is subscribed to {active}")]
    TargetMismatch {
        /// What the caller asked for.
        requested: String,
        /// The characteristic currently subscribed.
        active: String,
    },

    /// The operation was cancelled before it completed.
    #[error("Operation cancelled")]
    Cancelled,

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failures while establishing a link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The connect attempt did not complete within the configured timeout.
    #[error("Connection timed out")]
    Timeout,

    /// The peripheral could not be reached.
    #[error("Device unreachable: {reason}")]
    Unreachable {
        /// Description of why the device was unreachable.
        reason: String,
    },

    /// A GATT operation failed while setting up the link.
    #[error("GATT failure: {reason}")]
    GattFailure {
        /// Description of the GATT failure.
        reason: String,
    },
}

/// A notification payload that could not be turned into a value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The payload carried no data.
    #[error("Empty payload")]
    Empty,

    /// The payload is not valid UTF-8.
    #[error("Invalid UTF-8 after {valid_up_to} bytes")]
    InvalidUtf8 {
        /// Length of the valid prefix.
        valid_up_to: usize,
    },

    /// The payload text is not a number.
    #[error("Not a number: {text:?}")]
    InvalidNumber {
        /// The text that failed to parse.
        text: String,
    },
}

/// Compact classification of an [`Error`], carried by
/// [`ConnectionState::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    /// Adapter not powered on.
    AdapterUnavailable,
    /// Platform refused the operation.
    PermissionDenied,
    /// Connect timeout expired.
    Timeout,
    /// Peripheral unreachable.
    Unreachable,
    /// GATT operation failed.
    GattFailure,
    /// Target characteristic missing.
    CharacteristicNotFound,
    /// Notification subscription failed.
    Subscription,
    /// Attempt cancelled by a disconnect or shutdown.
    Cancelled,
    /// Anything else.
    Other,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::AdapterUnavailable => "adapter unavailable",
            Self::PermissionDenied => "permission denied",
            Self::Timeout => "timeout",
            Self::Unreachable => "unreachable",
            Self::GattFailure => "GATT failure",
            Self::CharacteristicNotFound => "characteristic not found",
            Self::Subscription => "subscription error",
            Self::Cancelled => "cancelled",
            Self::Other => "error",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AdapterUnavailable { .. } => ErrorKind::AdapterUnavailable,
            Self::PermissionDenied => ErrorKind::PermissionDenied,
            Self::Connect(ConnectError::Timeout) => ErrorKind::Timeout,
            Self::Connect(ConnectError::Unreachable { .. }) => ErrorKind::Unreachable,
            Self::Connect(ConnectError::GattFailure { .. }) => ErrorKind::GattFailure,
            Self::CharacteristicNotFound { .. } => ErrorKind::CharacteristicNotFound,
            Self::Subscription { .. } => ErrorKind::Subscription,
            Self::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Other,
        }
    }

    /// Wrap a platform failure that happened during a GATT step of connect.
    pub(crate) fn gatt(reason: impl Into<String>) -> Self {
        Self::Connect(ConnectError::GattFailure {
            reason: reason.into(),
        })
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        assert_eq!(Error::from(ConnectError::Timeout).kind(), ErrorKind::Timeout);
        assert_eq!(
            Error::AdapterUnavailable {
                state: AdapterState::PoweredOff
            }
            .kind(),
            ErrorKind::AdapterUnavailable
        );
        assert_eq!(Error::gatt("boom").kind(), ErrorKind::GattFailure);
        assert_eq!(Error::Internal("x".into()).kind(), ErrorKind::Other);
    }

    #[test]
    fn test_error_display() {
        let err = Error::from(ConnectError::Timeout);
        assert_eq!(err.to_string(), "Connection timed out");

        let err = Error::AdapterUnavailable {
            state: AdapterState::PoweredOff,
        };
        assert_eq!(
            err.to_string(),
            "Bluetooth adapter unavailable (state: PoweredOff)"
        );
    }
}

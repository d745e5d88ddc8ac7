//! Decoded sensor readings.

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::DecodeError;

/// A value produced by a [`Decoder`](crate::protocol::Decoder).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ReadingValue {
    /// Text payload.
    Text(String),
    /// Numeric payload.
    Number(f64),
}

impl ReadingValue {
    /// Get the text, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Number(_) => None,
        }
    }

    /// Get the number, if this is a numeric value.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(_) => None,
        }
    }
}

impl std::fmt::Display for ReadingValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Number(n) => write!(f, "{}", n),
        }
    }
}

/// One notification (or read) from a characteristic.
///
/// A reading whose payload failed to decode still carries the raw bytes, so
/// callers can log or skip it without losing the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// When the payload arrived.
    pub timestamp: DateTime<Utc>,
    /// The payload as received.
    pub raw: Bytes,
    /// The decoded value or why decoding failed.
    pub value: Result<ReadingValue, DecodeError>,
}

impl Reading {
    /// Create a reading stamped with the current time.
    pub fn new(raw: Bytes, value: Result<ReadingValue, DecodeError>) -> Self {
        Self {
            timestamp: Utc::now(),
            raw,
            value,
        }
    }

    /// Check whether the payload decoded.
    pub fn is_valid(&self) -> bool {
        self.value.is_ok()
    }

    /// Get the decoded value, if any.
    pub fn decoded(&self) -> Option<&ReadingValue> {
        self.value.as_ref().ok()
    }
}

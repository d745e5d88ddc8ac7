//! Notification payload decoders.
//!
//! The peripheral pushes its sensor value as text (for example `"300"` for
//! the current water level in millilitres). Decoders turn those raw bytes
//! into a [`ReadingValue`]; a decoder failure is reported per reading and
//! never ends a subscription.

use crate::data::ReadingValue;
use crate::error::DecodeError;

/// Turns a raw characteristic payload into a value.
#[cfg_attr(test, mockall::automock)]
pub trait Decoder: Send + Sync {
    /// Decode one payload.
    fn decode(&self, payload: &[u8]) -> Result<ReadingValue, DecodeError>;
}

/// Decode the payload as UTF-8 text.
///
/// Trailing NUL padding and surrounding whitespace are stripped.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8TextDecoder;

impl Utf8TextDecoder {
    fn text(payload: &[u8]) -> Result<&str, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::Empty);
        }

        let text = std::str::from_utf8(payload).map_err(|e| DecodeError::InvalidUtf8 {
            valid_up_to: e.valid_up_to(),
        })?;

        let text = text.trim_end_matches('\0').trim();
        if text.is_empty() {
            return Err(DecodeError::Empty);
        }

        Ok(text)
    }
}

impl Decoder for Utf8TextDecoder {
    fn decode(&self, payload: &[u8]) -> Result<ReadingValue, DecodeError> {
        Self::text(payload).map(|text| ReadingValue::Text(text.to_string()))
    }
}

/// Decode the payload as a number written in text, e.g. `"300"` or `"300 ml"`.
///
/// Anything after the leading numeric part is treated as a unit and ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct NumericTextDecoder;

impl Decoder for NumericTextDecoder {
    fn decode(&self, payload: &[u8]) -> Result<ReadingValue, DecodeError> {
        let text = Utf8TextDecoder::text(payload)?;

        let end = text
            .char_indices()
            .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || (*i == 0 && (*c == '-' || *c == '+'))))
            .map(|(i, _)| i)
            .unwrap_or(text.len());

        text[..end]
            .parse::<f64>()
            .map(ReadingValue::Number)
            .map_err(|_| DecodeError::InvalidNumber {
                text: text.to_string(),
            })
    }
}

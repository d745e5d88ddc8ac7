//! Protocol module for turning characteristic payloads into values.

pub mod decoder;

pub use decoder::{Decoder, NumericTextDecoder, Utf8TextDecoder};

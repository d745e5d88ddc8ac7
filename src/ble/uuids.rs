//! BLE Service and Characteristic UUIDs.
//!
//! Helpers for expanding Bluetooth SIG short UUIDs plus a few standard
//! constants.

use uuid::Uuid;

/// The Bluetooth Base UUID (`00000000-0000-1000-8000-00805f9b34fb`).
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805f9b34fb;

// Device Information Service (Standard BLE)
/// Standard BLE Device Information Service UUID.
pub const DEVICE_INFO_SERVICE_UUID: Uuid = uuid_from_u16(0x180a);
/// Manufacturer Name characteristic UUID.
pub const MANUFACTURER_NAME_UUID: Uuid = uuid_from_u16(0x2a29);
/// Model Number characteristic UUID.
pub const MODEL_NUMBER_UUID: Uuid = uuid_from_u16(0x2a24);

// Battery Service (Standard BLE)
/// Standard BLE Battery Service UUID.
pub const BATTERY_SERVICE_UUID: Uuid = uuid_from_u16(0x180f);
/// Battery Level characteristic UUID (Read, Notify).
pub const BATTERY_LEVEL_UUID: Uuid = uuid_from_u16(0x2a19);

/// Expand a 16-bit SIG UUID onto the Bluetooth Base UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    uuid_from_u32(short as u32)
}

/// Expand a 32-bit SIG UUID onto the Bluetooth Base UUID.
pub const fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Parse a UUID given as 4 hex digits, 8 hex digits, or the full 128-bit form.
///
/// Returns `None` if the text is none of those.
///
/// # Example
///
/// ```
/// use smartsleeve_ble::ble::uuids::{parse_uuid, uuid_from_u16};
///
/// assert_eq!(parse_uuid("1234"), Some(uuid_from_u16(0x1234)));
/// ```
pub fn parse_uuid(text: &str) -> Option<Uuid> {
    let text = text.trim();
    let text = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);

    match text.len() {
        4 => u16::from_str_radix(text, 16).ok().map(uuid_from_u16),
        8 => u32::from_str_radix(text, 16).ok().map(uuid_from_u32),
        _ => Uuid::parse_str(text).ok(),
    }
}

/// Get the 16-bit short form of a SIG UUID, if it has one.
pub fn short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let base_mask = (1u128 << 96) - 1;
    if value & base_mask != BLUETOOTH_BASE_UUID & base_mask {
        return None;
    }
    u16::try_from(value >> 96).ok()
}

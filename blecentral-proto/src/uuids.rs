//! 16/32/128-bit Bluetooth UUID handling
//!
//! Short UUIDs are offsets into the Bluetooth base UUID
//! `00000000-0000-1000-8000-00805f9b34fb`; everything is stored as a full
//! 128-bit [`Uuid`] so two spellings of the same attribute compare equal.

use uuid::Uuid;

const BASE_UUID_U128: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const LOW_96_MASK: u128 = (1u128 << 96) - 1;

/// Bluetooth base UUID
pub const BASE_UUID: Uuid = Uuid::from_u128(BASE_UUID_U128);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UuidError {
    #[error("invalid UUID: {0:?}")]
    Invalid(String),
}

/// Expand a 16-bit assigned number into a full UUID
pub const fn from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID_U128 | ((short as u128) << 96))
}

/// Expand a 32-bit assigned number into a full UUID
pub const fn from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BASE_UUID_U128 | ((short as u128) << 96))
}

/// Parse any of the accepted spellings: `2902`, `0x2902`, `00002902`,
/// or a full hyphenated UUID. Case-insensitive.
pub fn uuid_from_str(s: &str) -> Result<Uuid, UuidError> {
    let trimmed = s.trim();
    let short = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    let is_hex = !short.is_empty() && short.chars().all(|c| c.is_ascii_hexdigit());
    let parsed = match short.len() {
        4 if is_hex => u16::from_str_radix(short, 16).ok().map(from_u16),
        8 if is_hex => u32::from_str_radix(short, 16).ok().map(from_u32),
        _ => Uuid::parse_str(trimmed).ok(),
    };

    parsed.ok_or_else(|| UuidError::Invalid(s.to_string()))
}

/// The 16-bit assigned number, if `uuid` has one
pub fn as_u16(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & LOW_96_MASK == BASE_UUID_U128 && value >> 112 == 0 {
        Some((value >> 96) as u16)
    } else {
        None
    }
}

/// Shortest conventional spelling: 16-bit form inside the base range,
/// lowercase hyphenated form otherwise.
pub fn uuid_to_string(uuid: &Uuid) -> String {
    match as_u16(uuid) {
        Some(short) => format!("{short:04x}"),
        None => uuid.hyphenated().to_string(),
    }
}

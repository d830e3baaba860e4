//! Serial number forms.
//!
//! Storage keys use the lowercase hyphenated hex form (`0a-1b-2c`). CRL
//! entries carry the DER INTEGER content bytes, which must map back to the
//! exact same key.

use crate::error::{PkiError, Result};

/// Normalizes `aa:bb:cc`, `AA-BB-CC` or bare `aabbcc` to `aa-bb-cc`.
pub fn normalize_serial(serial: &str) -> Result<String> {
    let hex_digits: String = serial
        .trim()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect::<String>()
        .to_ascii_lowercase();

    if hex_digits.is_empty() || !hex_digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(PkiError::InvalidRequest(format!(
            "invalid serial number: {}",
            serial
        )));
    }

    let padded = if hex_digits.len() % 2 == 1 {
        format!("0{}", hex_digits)
    } else {
        hex_digits
    };

    let bytes = hex::decode(&padded)
        .map_err(|e| PkiError::InvalidRequest(format!("invalid serial number {}: {}", serial, e)))?;
    Ok(serial_from_bytes(&bytes))
}

/// Formats big-endian INTEGER content bytes as a hyphenated serial. A leading
/// zero sign byte is dropped when the next byte has its top bit set.
pub fn serial_from_bytes(bytes: &[u8]) -> String {
    let trimmed = match bytes {
        [0, next, ..] if next & 0x80 != 0 => &bytes[1..],
        _ => bytes,
    };
    trimmed
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join("-")
}

/// Reverses `serial_from_bytes`, re-adding the sign byte so the INTEGER stays
/// positive.
pub fn serial_to_bytes(serial: &str) -> Result<Vec<u8>> {
    let normalized = normalize_serial(serial)?;
    let mut bytes = hex::decode(normalized.replace('-', ""))
        .map_err(|e| PkiError::InvalidRequest(format!("invalid serial number {}: {}", serial, e)))?;
    if bytes.first().map(|b| b & 0x80 != 0).unwrap_or(false) {
        bytes.insert(0, 0);
    }
    Ok(bytes)
}

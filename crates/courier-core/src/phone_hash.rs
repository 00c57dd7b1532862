//! One-way phone hashing.
//!
//! Raw phone numbers never cross the repository boundary. Every phone is
//! normalized (provider suffixes and device ids stripped, non-digits removed)
//! and hashed to a fixed-length hex prefix of a SHA-256 digest.

use sha2::{Digest, Sha256};

/// Number of hex characters retained from the phone digest.
pub const PHONE_HASH_HEX_LEN: usize = 16;

/// Normalizes a raw phone identifier to its digit sequence.
///
/// `573001234567:12@s.whatsapp.net`, `+57 300 123 4567` and `573001234567`
/// all normalize to `573001234567`. Inputs without any digit fall back to the
/// trimmed, lowercased raw value so distinct opaque identifiers stay distinct.
pub fn normalize_phone(raw: &str) -> String {
    let trimmed = raw.trim();
    let local = trimmed.split('@').next().unwrap_or_default();
    let without_device = local.split(':').next().unwrap_or_default();
    let digits = without_device
        .chars()
        .filter(char::is_ascii_digit)
        .collect::<String>();
    if digits.is_empty() {
        return trimmed.to_ascii_lowercase();
    }
    digits
}

/// Returns the fixed-length hash used for every persisted phone reference.
pub fn hash_phone(raw: &str) -> String {
    let normalized = normalize_phone(raw);
    let digest = Sha256::digest(normalized.as_bytes());
    let mut encoded = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        encoded.push_str(&format!("{byte:02x}"));
    }
    encoded.truncate(PHONE_HASH_HEX_LEN);
    encoded
}

#[cfg(test)]
mod tests {
    use super::{hash_phone, normalize_phone};

    #[test]
    fn unit_normalize_phone_strips_suffixes_and_formatting() {
        assert_eq!(normalize_phone(" +57 (300) 123-4567 "), "573001234567");
        assert_eq!(normalize_phone("573001234567@c.us"), "573001234567");
        assert_eq!(normalize_phone("573001234567:3@s.whatsapp.net"), "573001234567");
        assert_eq!(normalize_phone("Operator"), "operator");
    }

    #[test]
    fn regression_hash_phone_is_lowercase_hex() {
        let hash = hash_phone("573001234567");
        assert!(hash.chars().all(|ch| ch.is_ascii_hexdigit() && !ch.is_ascii_uppercase()));
    }
}

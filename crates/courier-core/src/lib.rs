//! Foundational low-level utilities shared across Courier crates.
//!
//! Provides time helpers, identifier generation, phone hashing and free-text
//! redaction used by the lifecycle pipeline and its repositories.

pub mod ids;
pub mod phone_hash;
pub mod redaction;
pub mod time_utils;

pub use ids::next_id;
pub use phone_hash::{hash_phone, normalize_phone, PHONE_HASH_HEX_LEN};
pub use redaction::{redact_detail, DEFAULT_DETAIL_MAX_CHARS};
pub use time_utils::{current_unix_timestamp_ms, minutes_to_duration, unix_ms_to_datetime};

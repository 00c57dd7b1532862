use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a dedupe key was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DedupeKeyType {
    /// Provider message id plus remote conversation.
    Native,
    /// Content hash used when the provider sent no stable id.
    Fallback,
}

impl DedupeKeyType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Native => "NATIVE",
            Self::Fallback => "FALLBACK",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "NATIVE" => Some(Self::Native),
            "FALLBACK" => Some(Self::Fallback),
            _ => None,
        }
    }
}

/// Derived identity of one logical inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupeKey {
    pub key: String,
    pub key_type: DedupeKeyType,
}

/// Materialized dedupe cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupeRecord {
    pub key: String,
    pub key_type: DedupeKeyType,
    pub first_seen_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DedupeRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

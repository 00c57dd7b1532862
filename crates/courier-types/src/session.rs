use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tags that mark a contact as blacklisted regardless of status.
pub const BLACKLIST_TAGS: [&str; 2] = ["blacklist", "blacklisted"];
/// Tags that mark a contact as having closed the conversation with a decision.
pub const DECISION_MADE_TAGS: [&str; 2] = ["decision_made", "purchased"];

/// Contact-level status owned by the session store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContactStatus {
    #[default]
    Active,
    OptOut,
    Closed,
    Blacklisted,
}

impl ContactStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::OptOut => "OPT_OUT",
            Self::Closed => "CLOSED",
            Self::Blacklisted => "BLACKLISTED",
        }
    }
}

/// Per-conversation policy inputs read by the outbound gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPolicyState {
    #[serde(default)]
    pub contact_status: ContactStatus,
    #[serde(default)]
    pub last_follow_up: Option<DateTime<Utc>>,
    pub last_interaction: DateTime<Utc>,
    #[serde(default)]
    pub follow_up_attempts: u32,
    #[serde(default)]
    pub follow_up_count_24h: u32,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl SessionPolicyState {
    pub fn new(last_interaction: DateTime<Utc>) -> Self {
        Self {
            contact_status: ContactStatus::Active,
            last_follow_up: None,
            last_interaction,
            follow_up_attempts: 0,
            follow_up_count_24h: 0,
            tags: BTreeSet::new(),
        }
    }

    pub fn has_any_tag(&self, candidates: &[&str]) -> bool {
        self.tags.iter().any(|tag| {
            let normalized = tag.trim().to_ascii_lowercase();
            candidates.iter().any(|candidate| normalized == *candidate)
        })
    }
}

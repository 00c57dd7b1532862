use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lifecycle::{LifecycleState, TelemetryEvent};

/// Filter used by paginated telemetry queries. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFilter {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub phone_hash: Option<String>,
    #[serde(default)]
    pub states: Option<Vec<LifecycleState>>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

impl TelemetryFilter {
    pub fn matches(&self, event: &TelemetryEvent) -> bool {
        self.message_id
            .as_ref()
            .is_none_or(|message_id| message_id == &event.message_id)
            && self
                .phone_hash
                .as_ref()
                .is_none_or(|phone_hash| phone_hash == &event.phone_hash)
            && self
                .states
                .as_ref()
                .is_none_or(|states| states.contains(&event.state))
            && self
                .correlation_id
                .as_ref()
                .is_none_or(|correlation_id| event.correlation_id.as_ref() == Some(correlation_id))
            && self.since.is_none_or(|since| event.timestamp >= since)
            && self.until.is_none_or(|until| event.timestamp < until)
    }
}

/// One page of query results. `page` is 1-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> usize {
        if self.per_page == 0 {
            return 0;
        }
        self.total.div_ceil(self.per_page)
    }

    /// Slices an already ordered result set into the requested page.
    pub fn from_sorted(mut items: Vec<T>, page: usize, per_page: usize) -> Self {
        let page = page.max(1);
        let total = items.len();
        let start = page.saturating_sub(1).saturating_mul(per_page).min(total);
        let mut sliced = items.split_off(start);
        sliced.truncate(per_page);
        Self {
            items: sliced,
            page,
            per_page,
            total,
        }
    }
}

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lifecycle::{LifecycleState, TelemetryEvent};

/// Processing times at or below this value are counted as near-zero samples.
pub const FUNNEL_NEAR_ZERO_LATENCY_MS: u64 = 5;

/// Signals about how trustworthy the latency aggregate is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunnelDataQuality {
    /// RESPONDED events that carried a processing time.
    pub timed_samples: u64,
    /// Terminal events recorded without a processing time.
    pub untimed_terminal_events: u64,
    /// Timed RESPONDED events at or below the near-zero threshold.
    pub near_zero_latency_samples: u64,
    /// Set when every timed sample is near zero, which usually means missing
    /// instrumentation rather than instant responses.
    pub suspicious_zero_latency: bool,
}

/// Funnel aggregation over a trailing window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelStats {
    pub window_minutes: u64,
    pub since: DateTime<Utc>,
    pub received: u64,
    pub queued: u64,
    pub processing: u64,
    pub responded: u64,
    pub skipped: u64,
    pub errored: u64,
    pub skip_reasons: BTreeMap<String, u64>,
    pub error_types: BTreeMap<String, u64>,
    /// Average over RESPONDED events with a recorded processing time.
    /// `None` means no such event exists in the window, never "zero".
    pub avg_processing_time_ms: Option<f64>,
    /// Average per terminal state, only present for states with timed samples.
    pub avg_processing_time_by_state: BTreeMap<String, f64>,
    pub data_quality: FunnelDataQuality,
}

impl FunnelStats {
    /// Aggregates events. Events outside `[since, ..)` are ignored.
    pub fn from_events<'a, I>(window_minutes: u64, since: DateTime<Utc>, events: I) -> Self
    where
        I: IntoIterator<Item = &'a TelemetryEvent>,
    {
        let mut stats = Self {
            window_minutes,
            since,
            received: 0,
            queued: 0,
            processing: 0,
            responded: 0,
            skipped: 0,
            errored: 0,
            skip_reasons: BTreeMap::new(),
            error_types: BTreeMap::new(),
            avg_processing_time_ms: None,
            avg_processing_time_by_state: BTreeMap::new(),
            data_quality: FunnelDataQuality::default(),
        };
        let mut timing_sums: BTreeMap<LifecycleState, (u64, u64)> = BTreeMap::new();

        for event in events {
            if event.timestamp < since {
                continue;
            }
            match event.state {
                LifecycleState::Received => stats.received += 1,
                LifecycleState::Queued => stats.queued += 1,
                LifecycleState::Processing => stats.processing += 1,
                LifecycleState::Responded => stats.responded += 1,
                LifecycleState::Skipped => {
                    stats.skipped += 1;
                    let reason = event
                        .skip_reason
                        .map(|reason| reason.as_str())
                        .unwrap_or("UNSPECIFIED");
                    increment_counter(&mut stats.skip_reasons, reason);
                }
                LifecycleState::Error => {
                    stats.errored += 1;
                    let kind = event
                        .error_type
                        .map(|kind| kind.as_str())
                        .unwrap_or("UNSPECIFIED");
                    increment_counter(&mut stats.error_types, kind);
                }
            }

            if !event.state.is_terminal() {
                continue;
            }
            let Some(processing_time_ms) = event.processing_time_ms else {
                stats.data_quality.untimed_terminal_events += 1;
                continue;
            };
            let entry = timing_sums.entry(event.state).or_insert((0, 0));
            entry.0 = entry.0.saturating_add(processing_time_ms);
            entry.1 += 1;
            if event.state == LifecycleState::Responded {
                stats.data_quality.timed_samples += 1;
                if processing_time_ms <= FUNNEL_NEAR_ZERO_LATENCY_MS {
                    stats.data_quality.near_zero_latency_samples += 1;
                }
            }
        }

        for (state, (sum, count)) in &timing_sums {
            if *count == 0 {
                continue;
            }
            let average = *sum as f64 / *count as f64;
            stats
                .avg_processing_time_by_state
                .insert(state.as_str().to_string(), average);
            if *state == LifecycleState::Responded {
                stats.avg_processing_time_ms = Some(average);
            }
        }
        stats.data_quality.suspicious_zero_latency = stats.data_quality.timed_samples > 0
            && stats.data_quality.near_zero_latency_samples == stats.data_quality.timed_samples;
        stats
    }

    pub fn terminal_total(&self) -> u64 {
        self.responded + self.skipped + self.errored
    }
}

fn increment_counter(map: &mut BTreeMap<String, u64>, key: &str) {
    *map.entry(key.to_string()).or_insert(0) += 1;
}

//! Telemetry state machine for inbound message lifecycles.
//!
//! In-flight messages are tracked in a bounded concurrent map keyed by message
//! id. Each transition is validated, stamped and handed to the persistence
//! writer while the map entry is held, which keeps per-message write order
//! identical to transition order.
//!
//! Terminal outcomes are also remembered in a second bounded map that
//! outlives in-flight eviction, so a late terminal for a message that was
//! already closed is still rejected.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use courier_core::{hash_phone, next_id, redact_detail};
use courier_store::{group_journeys, StoreResult, TelemetryRepository};
use courier_types::{
    ErrorType, FunnelStats, LifecycleState, MessageJourney, Page, SkipReason,
    StatusTransitionError, TelemetryEvent, TelemetryFilter,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use crate::lifecycle_context::current_context;
use crate::lifecycle_persistence::PersistenceWriter;

pub const UNKNOWN_PHONE_HASH: &str = "unknown";
const JOURNEY_EVENT_SCAN_FACTOR: usize = 8;
const TERMINATED_RETENTION_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TelemetryError {
    #[error("message '{message_id}' was already received")]
    DuplicateReceived { message_id: String },
    #[error("message '{message_id}' already reached terminal state {existing}")]
    DuplicateTerminal {
        message_id: String,
        existing: &'static str,
    },
    #[error("message '{message_id}': {source}")]
    IllegalTransition {
        message_id: String,
        #[source]
        source: StatusTransitionError,
    },
}

/// Optional fields attached to a transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionDetails {
    pub skip_reason: Option<SkipReason>,
    pub error_type: Option<ErrorType>,
    pub stage: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone)]
struct InFlightMessage {
    phone_hash: String,
    correlation_id: Option<String>,
    started_at: Option<DateTime<Utc>>,
    state: LifecycleState,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct TerminatedMessage {
    state: LifecycleState,
    at: DateTime<Utc>,
}

/// Identifiers remembered for a message that is still tracked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightSnapshot {
    pub phone_hash: String,
    pub correlation_id: Option<String>,
    pub state: LifecycleState,
}

pub struct TelemetryStateMachine {
    in_flight: DashMap<String, InFlightMessage>,
    terminated: DashMap<String, TerminatedMessage>,
    terminated_retention: Duration,
    writer: PersistenceWriter,
    repository: Arc<dyn TelemetryRepository>,
    start_time_ttl: Duration,
    start_time_cap: usize,
    detail_max_chars: usize,
}

impl std::fmt::Debug for TelemetryStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryStateMachine")
            .field("in_flight", &self.in_flight.len())
            .field("terminated", &self.terminated.len())
            .field("start_time_ttl", &self.start_time_ttl)
            .field("start_time_cap", &self.start_time_cap)
            .finish()
    }
}

impl TelemetryStateMachine {
    pub fn new(
        writer: PersistenceWriter,
        repository: Arc<dyn TelemetryRepository>,
        start_time_ttl: Duration,
        start_time_cap: usize,
        detail_max_chars: usize,
    ) -> Self {
        Self {
            in_flight: DashMap::new(),
            terminated: DashMap::new(),
            terminated_retention: Duration::hours(TERMINATED_RETENTION_HOURS),
            writer,
            repository,
            start_time_ttl,
            start_time_cap: start_time_cap.max(1),
            detail_max_chars,
        }
    }

    /// Records RECEIVED and starts the processing clock for `message_id`.
    pub fn record_received(
        &self,
        message_id: &str,
        phone: &str,
    ) -> Result<TelemetryEvent, TelemetryError> {
        self.record_received_at(message_id, phone, Utc::now())
    }

    pub fn record_received_at(
        &self,
        message_id: &str,
        phone: &str,
        now: DateTime<Utc>,
    ) -> Result<TelemetryEvent, TelemetryError> {
        self.make_room(now);
        let phone_hash = hash_phone(phone);
        let correlation_id = current_context().map(|context| context.correlation_id);
        if self.terminated_state(message_id, now).is_some() {
            return Err(TelemetryError::DuplicateReceived {
                message_id: message_id.to_string(),
            });
        }

        match self.in_flight.entry(message_id.to_string()) {
            Entry::Occupied(occupied) if !self.is_stale(occupied.get(), now) => {
                Err(TelemetryError::DuplicateReceived {
                    message_id: message_id.to_string(),
                })
            }
            Entry::Occupied(mut occupied) => {
                let event = self.emit(
                    message_id,
                    &phone_hash,
                    correlation_id.clone(),
                    LifecycleState::Received,
                    None,
                    None,
                    TransitionDetails::default(),
                    now,
                );
                occupied.insert(InFlightMessage {
                    phone_hash,
                    correlation_id,
                    started_at: Some(now),
                    state: LifecycleState::Received,
                    updated_at: now,
                });
                Ok(event)
            }
            Entry::Vacant(vacant) => {
                let event = self.emit(
                    message_id,
                    &phone_hash,
                    correlation_id.clone(),
                    LifecycleState::Received,
                    None,
                    None,
                    TransitionDetails::default(),
                    now,
                );
                vacant.insert(InFlightMessage {
                    phone_hash,
                    correlation_id,
                    started_at: Some(now),
                    state: LifecycleState::Received,
                    updated_at: now,
                });
                Ok(event)
            }
        }
    }

    pub fn record_queued(&self, message_id: &str) -> Result<TelemetryEvent, TelemetryError> {
        self.transition(
            message_id,
            LifecycleState::Queued,
            TransitionDetails::default(),
            Utc::now(),
        )
    }

    pub fn record_processing(&self, message_id: &str) -> Result<TelemetryEvent, TelemetryError> {
        self.transition(
            message_id,
            LifecycleState::Processing,
            TransitionDetails::default(),
            Utc::now(),
        )
    }

    pub fn record_responded(
        &self,
        message_id: &str,
        stage: Option<&str>,
        detail: Option<&str>,
    ) -> Result<TelemetryEvent, TelemetryError> {
        self.transition(
            message_id,
            LifecycleState::Responded,
            TransitionDetails {
                stage: stage.map(str::to_string),
                detail: detail.map(str::to_string),
                ..TransitionDetails::default()
            },
            Utc::now(),
        )
    }

    pub fn record_skipped(
        &self,
        message_id: &str,
        reason: SkipReason,
        detail: Option<&str>,
    ) -> Result<TelemetryEvent, TelemetryError> {
        self.transition(
            message_id,
            LifecycleState::Skipped,
            TransitionDetails {
                skip_reason: Some(reason),
                detail: detail.map(str::to_string),
                ..TransitionDetails::default()
            },
            Utc::now(),
        )
    }

    pub fn record_error(
        &self,
        message_id: &str,
        error_type: ErrorType,
        detail: Option<&str>,
    ) -> Result<TelemetryEvent, TelemetryError> {
        self.transition(
            message_id,
            LifecycleState::Error,
            TransitionDetails {
                error_type: Some(error_type),
                detail: detail.map(str::to_string),
                ..TransitionDetails::default()
            },
            Utc::now(),
        )
    }

    /// Applies a non-RECEIVED transition.
    ///
    /// A message that is no longer tracked (restart or eviction) is recorded
    /// without a previous state and without a processing time, unless it is
    /// remembered as already terminated.
    pub fn transition(
        &self,
        message_id: &str,
        next: LifecycleState,
        details: TransitionDetails,
        now: DateTime<Utc>,
    ) -> Result<TelemetryEvent, TelemetryError> {
        let event = self.apply_transition(message_id, next, details, now)?;
        if next.is_terminal() {
            self.remember_terminal(message_id, next, now);
        }
        Ok(event)
    }

    fn apply_transition(
        &self,
        message_id: &str,
        next: LifecycleState,
        details: TransitionDetails,
        now: DateTime<Utc>,
    ) -> Result<TelemetryEvent, TelemetryError> {
        if let Some(existing) = self.terminated_state(message_id, now) {
            if next.is_terminal() {
                return Err(TelemetryError::DuplicateTerminal {
                    message_id: message_id.to_string(),
                    existing: existing.as_str(),
                });
            }
            existing
                .ensure_transition(next)
                .map_err(|source| TelemetryError::IllegalTransition {
                    message_id: message_id.to_string(),
                    source,
                })?;
        }
        match self.in_flight.entry(message_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().clone();
                if current.state.is_terminal() && next.is_terminal() {
                    return Err(TelemetryError::DuplicateTerminal {
                        message_id: message_id.to_string(),
                        existing: current.state.as_str(),
                    });
                }
                current
                    .state
                    .ensure_transition(next)
                    .map_err(|source| TelemetryError::IllegalTransition {
                        message_id: message_id.to_string(),
                        source,
                    })?;
                let processing_time_ms = if next.is_terminal() {
                    current.started_at.and_then(|started| {
                        u64::try_from(now.signed_duration_since(started).num_milliseconds()).ok()
                    })
                } else {
                    None
                };
                let correlation_id = current_context()
                    .map(|context| context.correlation_id)
                    .or_else(|| current.correlation_id.clone());
                let event = self.emit(
                    message_id,
                    &current.phone_hash,
                    correlation_id,
                    next,
                    Some(current.state),
                    processing_time_ms,
                    details,
                    now,
                );
                let tracked = occupied.get_mut();
                tracked.state = next;
                tracked.updated_at = now;
                Ok(event)
            }
            Entry::Vacant(vacant) => {
                let context = current_context();
                let phone_hash = context
                    .as_ref()
                    .and_then(|context| context.phone_hash.clone())
                    .unwrap_or_else(|| UNKNOWN_PHONE_HASH.to_string());
                let correlation_id = context.map(|context| context.correlation_id);
                tracing::debug!(
                    message_id,
                    state = next.as_str(),
                    "transition for untracked message; processing time omitted"
                );
                let event = self.emit(
                    message_id,
                    &phone_hash,
                    correlation_id.clone(),
                    next,
                    None,
                    None,
                    details,
                    now,
                );
                vacant.insert(InFlightMessage {
                    phone_hash,
                    correlation_id,
                    started_at: None,
                    state: next,
                    updated_at: now,
                });
                Ok(event)
            }
        }
    }

    /// Returns what is still remembered about `message_id`.
    pub fn in_flight(&self, message_id: &str) -> Option<InFlightSnapshot> {
        self.in_flight.get(message_id).map(|tracked| InFlightSnapshot {
            phone_hash: tracked.phone_hash.clone(),
            correlation_id: tracked.correlation_id.clone(),
            state: tracked.state,
        })
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Evicts entries idle for longer than the start-time TTL and forgets
    /// terminal outcomes older than the terminated-id retention.
    pub fn sweep_start_times(&self, now: DateTime<Utc>) -> usize {
        let before = self.in_flight.len();
        self.in_flight
            .retain(|_, tracked| !self.is_stale(tracked, now));
        self.terminated
            .retain(|_, terminated| terminated.at + self.terminated_retention > now);
        before.saturating_sub(self.in_flight.len())
    }

    pub fn terminated_count(&self) -> usize {
        self.terminated.len()
    }

    pub async fn funnel_stats(&self, window_minutes: u64) -> StoreResult<FunnelStats> {
        self.repository.funnel_stats(window_minutes).await
    }

    pub async fn events_by_message_id(&self, message_id: &str) -> StoreResult<Vec<TelemetryEvent>> {
        self.repository.events_by_message_id(message_id).await
    }

    pub async fn events_by_phone_hash(
        &self,
        phone_hash: &str,
        limit: usize,
    ) -> StoreResult<Vec<TelemetryEvent>> {
        self.repository.events_by_phone_hash(phone_hash, limit).await
    }

    pub async fn find_events(
        &self,
        filter: &TelemetryFilter,
        page: usize,
        per_page: usize,
    ) -> StoreResult<Page<TelemetryEvent>> {
        self.repository
            .find_events_paginated(filter, page, per_page)
            .await
    }

    pub async fn get_message_journey(&self, message_id: &str) -> StoreResult<Option<MessageJourney>> {
        let events = self.repository.events_by_message_id(message_id).await?;
        Ok(MessageJourney::from_events(events))
    }

    /// Returns up to `limit` journeys for a phone hash, newest first.
    pub async fn get_recent_journeys(
        &self,
        phone_hash: &str,
        limit: usize,
    ) -> StoreResult<Vec<MessageJourney>> {
        let scan = limit.saturating_mul(JOURNEY_EVENT_SCAN_FACTOR).max(limit);
        let events = self.repository.events_by_phone_hash(phone_hash, scan).await?;
        let mut journeys = group_journeys(events);
        journeys.truncate(limit);
        Ok(journeys)
    }

    pub async fn purge_older_than(&self, days: u64) -> StoreResult<usize> {
        self.repository.delete_events_older_than(days).await
    }

    fn terminated_state(&self, message_id: &str, now: DateTime<Utc>) -> Option<LifecycleState> {
        self.terminated
            .get(message_id)
            .filter(|terminated| terminated.at + self.terminated_retention > now)
            .map(|terminated| terminated.state)
    }

    /// Bounded by the same cap as the in-flight map; the oldest outcome goes first.
    fn remember_terminal(&self, message_id: &str, state: LifecycleState, now: DateTime<Utc>) {
        while self.terminated.len() >= self.start_time_cap {
            let oldest = self
                .terminated
                .iter()
                .min_by_key(|entry| entry.value().at)
                .map(|entry| entry.key().clone());
            let Some(oldest) = oldest else {
                break;
            };
            self.terminated.remove(&oldest);
        }
        self.terminated
            .insert(message_id.to_string(), TerminatedMessage { state, at: now });
    }

    fn is_stale(&self, tracked: &InFlightMessage, now: DateTime<Utc>) -> bool {
        tracked.updated_at + self.start_time_ttl <= now
    }

    /// Keeps the map under its cap: stale entries first, then the oldest.
    fn make_room(&self, now: DateTime<Utc>) {
        if self.in_flight.len() < self.start_time_cap {
            return;
        }
        let evicted = self.sweep_start_times(now);
        while self.in_flight.len() >= self.start_time_cap {
            let oldest = self
                .in_flight
                .iter()
                .min_by_key(|entry| entry.value().updated_at)
                .map(|entry| entry.key().clone());
            let Some(oldest) = oldest else {
                break;
            };
            self.in_flight.remove(&oldest);
            tracing::debug!(message_id = %oldest, "in-flight cap reached; oldest entry evicted");
        }
        if evicted > 0 {
            tracing::debug!(evicted, "stale in-flight entries evicted");
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &self,
        message_id: &str,
        phone_hash: &str,
        correlation_id: Option<String>,
        state: LifecycleState,
        previous_state: Option<LifecycleState>,
        processing_time_ms: Option<u64>,
        details: TransitionDetails,
        now: DateTime<Utc>,
    ) -> TelemetryEvent {
        let event = TelemetryEvent {
            event_id: next_id("evt"),
            message_id: message_id.to_string(),
            phone_hash: phone_hash.to_string(),
            timestamp: now,
            state,
            previous_state,
            skip_reason: details.skip_reason,
            error_type: details.error_type,
            processing_time_ms,
            stage: details.stage,
            correlation_id,
            detail: details
                .detail
                .map(|detail| redact_detail(&detail, self.detail_max_chars))
                .filter(|detail| !detail.is_empty()),
        };
        tracing::debug!(
            message_id = %event.message_id,
            state = event.state.as_str(),
            previous_state = event.previous_state.map(LifecycleState::as_str),
            processing_time_ms = event.processing_time_ms,
            "lifecycle transition"
        );
        self.writer.submit_event(event.clone());
        event
    }
}

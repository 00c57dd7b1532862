//! Repository abstractions for the lifecycle pipeline and an in-memory backend.
//!
//! The pipeline reaches the durable store only through the narrow traits in
//! this crate. Phone numbers cross this boundary as hashes, never raw.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

mod sqlite;

pub use sqlite::SqliteLifecycleStore;
pub use courier_types::{
    DecisionTrace, DedupeRecord, FunnelStats, MessageJourney, Page, TelemetryEvent,
    TelemetryFilter,
};

/// Result type for repository operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by repository implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record '{0}' already exists")]
    AlreadyExists(String),
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Durable storage for telemetry lifecycle events.
#[async_trait]
pub trait TelemetryRepository: Send + Sync {
    async fn create_event(&self, event: TelemetryEvent) -> StoreResult<()>;
    async fn create_events(&self, events: Vec<TelemetryEvent>) -> StoreResult<()> {
        for event in events {
            self.create_event(event).await?;
        }
        Ok(())
    }
    /// Returns every event of one message ordered by timestamp.
    async fn events_by_message_id(&self, message_id: &str) -> StoreResult<Vec<TelemetryEvent>>;
    /// Returns the newest events for a phone hash, newest first.
    async fn events_by_phone_hash(
        &self,
        phone_hash: &str,
        limit: usize,
    ) -> StoreResult<Vec<TelemetryEvent>>;
    /// Returns a page of matching events, newest first. `page` is 1-based.
    async fn find_events_paginated(
        &self,
        filter: &TelemetryFilter,
        page: usize,
        per_page: usize,
    ) -> StoreResult<Page<TelemetryEvent>>;
    async fn funnel_stats(&self, window_minutes: u64) -> StoreResult<FunnelStats>;
    /// Deletes events older than `days` days and returns the number removed.
    async fn delete_events_older_than(&self, days: u64) -> StoreResult<usize>;
}

/// Durable storage for decision traces.
#[async_trait]
pub trait DecisionTraceRepository: Send + Sync {
    async fn create_trace(&self, trace: DecisionTrace) -> StoreResult<()>;
    async fn create_traces(&self, traces: Vec<DecisionTrace>) -> StoreResult<()> {
        for trace in traces {
            self.create_trace(trace).await?;
        }
        Ok(())
    }
    /// Returns every trace of one message ordered by timestamp.
    async fn traces_by_message_id(&self, message_id: &str) -> StoreResult<Vec<DecisionTrace>>;
    /// Returns the newest traces for a phone hash, newest first.
    async fn traces_by_phone_hash(
        &self,
        phone_hash: &str,
        limit: usize,
    ) -> StoreResult<Vec<DecisionTrace>>;
    /// Returns the newest SKIP/DEFER/ERROR trace for a phone hash.
    async fn latest_blocking_trace(&self, phone_hash: &str) -> StoreResult<Option<DecisionTrace>>;
    async fn delete_traces_older_than(&self, days: u64) -> StoreResult<usize>;
}

/// Durable secondary store for dedupe keys, used for crash recovery.
#[async_trait]
pub trait DedupeRepository: Send + Sync {
    /// Returns the record for `key` when present and not expired at `now`.
    async fn find_dedupe_key(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DedupeRecord>>;
    /// Inserts a key. Re-inserting an existing key is a no-op.
    async fn insert_dedupe_key(&self, record: DedupeRecord) -> StoreResult<()>;
    async fn delete_expired_dedupe_keys(&self, now: DateTime<Utc>) -> StoreResult<usize>;
}

pub(crate) fn retention_cutoff(days: u64) -> DateTime<Utc> {
    let days = i64::try_from(days).unwrap_or(i64::MAX);
    let retention = Duration::try_days(days).unwrap_or(Duration::MAX);
    Utc::now()
        .checked_sub_signed(retention)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn funnel_window_start(window_minutes: u64) -> DateTime<Utc> {
    let minutes = i64::try_from(window_minutes).unwrap_or(i64::MAX);
    let window = Duration::try_minutes(minutes).unwrap_or(Duration::MAX);
    Utc::now()
        .checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// In-memory implementation for tests and local experimentation.
#[derive(Debug, Default)]
pub struct InMemoryLifecycleStore {
    inner: RwLock<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    events: Vec<TelemetryEvent>,
    traces: Vec<DecisionTrace>,
    dedupe_keys: HashMap<String, DedupeRecord>,
}

impl InMemoryLifecycleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every stored event in insertion order.
    pub async fn all_events(&self) -> Vec<TelemetryEvent> {
        self.inner.read().await.events.clone()
    }

    /// Returns every stored trace in insertion order.
    pub async fn all_traces(&self) -> Vec<DecisionTrace> {
        self.inner.read().await.traces.clone()
    }

    pub async fn dedupe_key_count(&self) -> usize {
        self.inner.read().await.dedupe_keys.len()
    }
}

#[async_trait]
impl TelemetryRepository for InMemoryLifecycleStore {
    async fn create_event(&self, event: TelemetryEvent) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner
            .events
            .iter()
            .any(|existing| existing.event_id == event.event_id)
        {
            return Err(StoreError::AlreadyExists(event.event_id));
        }
        inner.events.push(event);
        Ok(())
    }

    async fn create_events(&self, events: Vec<TelemetryEvent>) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        for event in &events {
            if inner
                .events
                .iter()
                .any(|existing| existing.event_id == event.event_id)
            {
                return Err(StoreError::AlreadyExists(event.event_id.clone()));
            }
        }
        inner.events.extend(events);
        Ok(())
    }

    async fn events_by_message_id(&self, message_id: &str) -> StoreResult<Vec<TelemetryEvent>> {
        let inner = self.inner.read().await;
        let mut events: Vec<TelemetryEvent> = inner
            .events
            .iter()
            .filter(|event| event.message_id == message_id)
            .cloned()
            .collect();
        events.sort_by_key(|event| event.timestamp);
        Ok(events)
    }

    async fn events_by_phone_hash(
        &self,
        phone_hash: &str,
        limit: usize,
    ) -> StoreResult<Vec<TelemetryEvent>> {
        let inner = self.inner.read().await;
        let mut events: Vec<TelemetryEvent> = inner
            .events
            .iter()
            .filter(|event| event.phone_hash == phone_hash)
            .cloned()
            .collect();
        events.sort_by(|left, right| right.timestamp.cmp(&left.timestamp));
        events.truncate(limit);
        Ok(events)
    }

    async fn find_events_paginated(
        &self,
        filter: &TelemetryFilter,
        page: usize,
        per_page: usize,
    ) -> StoreResult<Page<TelemetryEvent>> {
        let inner = self.inner.read().await;
        let mut events: Vec<TelemetryEvent> = inner
            .events
            .iter()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect();
        events.sort_by(|left, right| right.timestamp.cmp(&left.timestamp));
        Ok(Page::from_sorted(events, page, per_page))
    }

    async fn funnel_stats(&self, window_minutes: u64) -> StoreResult<FunnelStats> {
        let since = funnel_window_start(window_minutes);
        let inner = self.inner.read().await;
        Ok(FunnelStats::from_events(window_minutes, since, &inner.events))
    }

    async fn delete_events_older_than(&self, days: u64) -> StoreResult<usize> {
        let cutoff = retention_cutoff(days);
        let mut inner = self.inner.write().await;
        let before = inner.events.len();
        inner.events.retain(|event| event.timestamp >= cutoff);
        Ok(before - inner.events.len())
    }
}

#[async_trait]
impl DecisionTraceRepository for InMemoryLifecycleStore {
    async fn create_trace(&self, trace: DecisionTrace) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner
            .traces
            .iter()
            .any(|existing| existing.trace_id == trace.trace_id)
        {
            return Err(StoreError::AlreadyExists(trace.trace_id));
        }
        inner.traces.push(trace);
        Ok(())
    }

    async fn traces_by_message_id(&self, message_id: &str) -> StoreResult<Vec<DecisionTrace>> {
        let inner = self.inner.read().await;
        let mut traces: Vec<DecisionTrace> = inner
            .traces
            .iter()
            .filter(|trace| trace.message_id == message_id)
            .cloned()
            .collect();
        traces.sort_by_key(|trace| trace.timestamp);
        Ok(traces)
    }

    async fn traces_by_phone_hash(
        &self,
        phone_hash: &str,
        limit: usize,
    ) -> StoreResult<Vec<DecisionTrace>> {
        let inner = self.inner.read().await;
        let mut traces: Vec<DecisionTrace> = inner
            .traces
            .iter()
            .filter(|trace| trace.phone_hash == phone_hash)
            .cloned()
            .collect();
        traces.sort_by(|left, right| right.timestamp.cmp(&left.timestamp));
        traces.truncate(limit);
        Ok(traces)
    }

    async fn latest_blocking_trace(&self, phone_hash: &str) -> StoreResult<Option<DecisionTrace>> {
        let inner = self.inner.read().await;
        Ok(inner
            .traces
            .iter()
            .filter(|trace| trace.phone_hash == phone_hash && trace.is_blocking())
            .max_by_key(|trace| trace.timestamp)
            .cloned())
    }

    async fn delete_traces_older_than(&self, days: u64) -> StoreResult<usize> {
        let cutoff = retention_cutoff(days);
        let mut inner = self.inner.write().await;
        let before = inner.traces.len();
        inner.traces.retain(|trace| trace.timestamp >= cutoff);
        Ok(before - inner.traces.len())
    }
}

#[async_trait]
impl DedupeRepository for InMemoryLifecycleStore {
    async fn find_dedupe_key(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DedupeRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .dedupe_keys
            .get(key)
            .filter(|record| !record.is_expired(now))
            .cloned())
    }

    async fn insert_dedupe_key(&self, record: DedupeRecord) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .dedupe_keys
            .entry(record.key.clone())
            .or_insert(record);
        Ok(())
    }

    async fn delete_expired_dedupe_keys(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut inner = self.inner.write().await;
        let before = inner.dedupe_keys.len();
        inner.dedupe_keys.retain(|_, record| !record.is_expired(now));
        Ok(before - inner.dedupe_keys.len())
    }
}

/// Builds a journey per message from a flat event list, newest journey first.
pub fn group_journeys(events: Vec<TelemetryEvent>) -> Vec<MessageJourney> {
    let mut by_message: HashMap<String, Vec<TelemetryEvent>> = HashMap::new();
    for event in events {
        by_message
            .entry(event.message_id.clone())
            .or_default()
            .push(event);
    }
    let mut journeys: Vec<MessageJourney> = by_message
        .into_values()
        .filter_map(MessageJourney::from_events)
        .collect();
    journeys.sort_by(|left, right| right.started_at.cmp(&left.started_at));
    journeys
}

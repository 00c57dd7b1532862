use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_store::{
    DecisionTraceRepository, DedupeRepository, StoreError, StoreResult, TelemetryRepository,
};
use courier_types::{
    DecisionTrace, DedupeRecord, FunnelStats, Page, TelemetryEvent, TelemetryFilter,
};

/// Repository whose every call fails, for graceful-degradation tests.
#[derive(Debug, Default)]
pub(crate) struct FailingLifecycleStore;

fn unavailable<T>() -> StoreResult<T> {
    Err(StoreError::Unavailable("database offline".to_string()))
}

#[async_trait]
impl TelemetryRepository for FailingLifecycleStore {
    async fn create_event(&self, _event: TelemetryEvent) -> StoreResult<()> {
        unavailable()
    }

    async fn events_by_message_id(&self, _message_id: &str) -> StoreResult<Vec<TelemetryEvent>> {
        unavailable()
    }

    async fn events_by_phone_hash(
        &self,
        _phone_hash: &str,
        _limit: usize,
    ) -> StoreResult<Vec<TelemetryEvent>> {
        unavailable()
    }

    async fn find_events_paginated(
        &self,
        _filter: &TelemetryFilter,
        _page: usize,
        _per_page: usize,
    ) -> StoreResult<Page<TelemetryEvent>> {
        unavailable()
    }

    async fn funnel_stats(&self, _window_minutes: u64) -> StoreResult<FunnelStats> {
        unavailable()
    }

    async fn delete_events_older_than(&self, _days: u64) -> StoreResult<usize> {
        unavailable()
    }
}

#[async_trait]
impl DecisionTraceRepository for FailingLifecycleStore {
    async fn create_trace(&self, _trace: DecisionTrace) -> StoreResult<()> {
        unavailable()
    }

    async fn traces_by_message_id(&self, _message_id: &str) -> StoreResult<Vec<DecisionTrace>> {
        unavailable()
    }

    async fn traces_by_phone_hash(
        &self,
        _phone_hash: &str,
        _limit: usize,
    ) -> StoreResult<Vec<DecisionTrace>> {
        unavailable()
    }

    async fn latest_blocking_trace(&self, _phone_hash: &str) -> StoreResult<Option<DecisionTrace>> {
        unavailable()
    }

    async fn delete_traces_older_than(&self, _days: u64) -> StoreResult<usize> {
        unavailable()
    }
}

#[async_trait]
impl DedupeRepository for FailingLifecycleStore {
    async fn find_dedupe_key(
        &self,
        _key: &str,
        _now: DateTime<Utc>,
    ) -> StoreResult<Option<DedupeRecord>> {
        unavailable()
    }

    async fn insert_dedupe_key(&self, _record: DedupeRecord) -> StoreResult<()> {
        unavailable()
    }

    async fn delete_expired_dedupe_keys(&self, _now: DateTime<Utc>) -> StoreResult<usize> {
        unavailable()
    }
}

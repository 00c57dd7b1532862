//! SQLite-backed lifecycle repositories with durable persistence.

use crate::{
    funnel_window_start, retention_cutoff, DecisionTrace, DecisionTraceRepository,
    DedupeRecord, DedupeRepository, FunnelStats, Page, StoreError, StoreResult, TelemetryEvent,
    TelemetryFilter, TelemetryRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use courier_types::{
    DedupeKeyType, ErrorType, LifecycleState, ReasonCode, SkipReason, TraceDecision, TraceStage,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;

const EVENT_COLUMNS: &str = "event_id, message_id, phone_hash, timestamp, state, previous_state, \
     skip_reason, error_type, processing_time_ms, stage, correlation_id, detail";
const TRACE_COLUMNS: &str = "trace_id, message_id, phone_hash, timestamp, stage, decision, \
     reason_code, reason_detail, next_eligible_at, correlation_id";

/// Persistent SQLite store backend for telemetry, traces and dedupe keys.
#[derive(Debug)]
pub struct SqliteLifecycleStore {
    db_path: PathBuf,
}

impl SqliteLifecycleStore {
    /// Creates a SQLite-backed store at `path`, creating schema if needed.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self { db_path };
        let connection = store.open_connection()?;
        store.initialize_schema(&connection)?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        Ok(connection)
    }

    fn initialize_schema(&self, connection: &Connection) -> StoreResult<()> {
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS telemetry_events (
                event_id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                phone_hash TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                state TEXT NOT NULL,
                previous_state TEXT NULL,
                skip_reason TEXT NULL,
                error_type TEXT NULL,
                processing_time_ms INTEGER NULL,
                stage TEXT NULL,
                correlation_id TEXT NULL,
                detail TEXT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_telemetry_message
                ON telemetry_events (message_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_telemetry_phone
                ON telemetry_events (phone_hash, timestamp);
            CREATE INDEX IF NOT EXISTS idx_telemetry_timestamp
                ON telemetry_events (timestamp);

            CREATE TABLE IF NOT EXISTS decision_traces (
                trace_id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                phone_hash TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                stage TEXT NOT NULL,
                decision TEXT NOT NULL,
                reason_code TEXT NOT NULL,
                reason_detail TEXT NULL,
                next_eligible_at TEXT NULL,
                correlation_id TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_traces_message
                ON decision_traces (message_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_traces_phone
                ON decision_traces (phone_hash, timestamp);

            CREATE TABLE IF NOT EXISTS dedupe_keys (
                dedupe_key TEXT PRIMARY KEY,
                key_type TEXT NOT NULL,
                first_seen_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_dedupe_expires ON dedupe_keys (expires_at);
            "#,
        )?;
        Ok(())
    }
}

#[async_trait]
impl TelemetryRepository for SqliteLifecycleStore {
    async fn create_event(&self, event: TelemetryEvent) -> StoreResult<()> {
        self.create_events(vec![event]).await
    }

    async fn create_events(&self, events: Vec<TelemetryEvent>) -> StoreResult<()> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction()?;
        for event in &events {
            let inserted = transaction.execute(
                r#"
                INSERT OR IGNORE INTO telemetry_events (
                    event_id, message_id, phone_hash, timestamp, state, previous_state,
                    skip_reason, error_type, processing_time_ms, stage, correlation_id, detail
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
                params![
                    event.event_id,
                    event.message_id,
                    event.phone_hash,
                    timestamp_to_db(event.timestamp),
                    event.state.as_str(),
                    event.previous_state.map(LifecycleState::as_str),
                    event.skip_reason.map(SkipReason::as_str),
                    event.error_type.map(ErrorType::as_str),
                    event
                        .processing_time_ms
                        .map(|value| i64::try_from(value).unwrap_or(i64::MAX)),
                    event.stage,
                    event.correlation_id,
                    event.detail,
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::AlreadyExists(event.event_id.clone()));
            }
        }
        transaction.commit()?;
        Ok(())
    }

    async fn events_by_message_id(&self, message_id: &str) -> StoreResult<Vec<TelemetryEvent>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM telemetry_events WHERE message_id = ?1 \
             ORDER BY timestamp ASC, rowid ASC"
        ))?;
        let rows = statement.query_map(params![message_id], read_event_row)?;
        collect_rows(rows)
    }

    async fn events_by_phone_hash(
        &self,
        phone_hash: &str,
        limit: usize,
    ) -> StoreResult<Vec<TelemetryEvent>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM telemetry_events WHERE phone_hash = ?1 \
             ORDER BY timestamp DESC, rowid DESC LIMIT ?2"
        ))?;
        let rows = statement.query_map(params![phone_hash, usize_to_i64(limit)], read_event_row)?;
        collect_rows(rows)
    }

    async fn find_events_paginated(
        &self,
        filter: &TelemetryFilter,
        page: usize,
        per_page: usize,
    ) -> StoreResult<Page<TelemetryEvent>> {
        let page = page.max(1);
        let (where_clause, values) = telemetry_filter_clause(filter);
        let connection = self.open_connection()?;

        let total: i64 = connection.query_row(
            &format!("SELECT COUNT(*) FROM telemetry_events{where_clause}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let mut paged_values = values;
        paged_values.push(SqlValue::Integer(usize_to_i64(per_page)));
        paged_values.push(SqlValue::Integer(usize_to_i64(
            page.saturating_sub(1).saturating_mul(per_page),
        )));
        let limit_index = paged_values.len() - 1;
        let offset_index = paged_values.len();
        let mut statement = connection.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM telemetry_events{where_clause} \
             ORDER BY timestamp DESC, rowid DESC LIMIT ?{limit_index} OFFSET ?{offset_index}"
        ))?;
        let rows = statement.query_map(params_from_iter(paged_values.iter()), read_event_row)?;
        let items = collect_rows(rows)?;
        Ok(Page {
            items,
            page,
            per_page,
            total: usize::try_from(total).unwrap_or_default(),
        })
    }

    async fn funnel_stats(&self, window_minutes: u64) -> StoreResult<FunnelStats> {
        let since = funnel_window_start(window_minutes);
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM telemetry_events WHERE timestamp >= ?1"
        ))?;
        let rows = statement.query_map(params![timestamp_to_db(since)], read_event_row)?;
        let events = collect_rows(rows)?;
        Ok(FunnelStats::from_events(window_minutes, since, &events))
    }

    async fn delete_events_older_than(&self, days: u64) -> StoreResult<usize> {
        let cutoff = retention_cutoff(days);
        let connection = self.open_connection()?;
        let removed = connection.execute(
            "DELETE FROM telemetry_events WHERE timestamp < ?1",
            params![timestamp_to_db(cutoff)],
        )?;
        Ok(removed)
    }
}

#[async_trait]
impl DecisionTraceRepository for SqliteLifecycleStore {
    async fn create_trace(&self, trace: DecisionTrace) -> StoreResult<()> {
        self.create_traces(vec![trace]).await
    }

    async fn create_traces(&self, traces: Vec<DecisionTrace>) -> StoreResult<()> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction()?;
        for trace in &traces {
            let inserted = transaction.execute(
                r#"
                INSERT OR IGNORE INTO decision_traces (
                    trace_id, message_id, phone_hash, timestamp, stage, decision,
                    reason_code, reason_detail, next_eligible_at, correlation_id
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    trace.trace_id,
                    trace.message_id,
                    trace.phone_hash,
                    timestamp_to_db(trace.timestamp),
                    trace.stage.as_str(),
                    trace.decision.as_str(),
                    trace.reason_code.as_str(),
                    trace.reason_detail,
                    option_timestamp_to_db(trace.next_eligible_at),
                    trace.correlation_id,
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::AlreadyExists(trace.trace_id.clone()));
            }
        }
        transaction.commit()?;
        Ok(())
    }

    async fn traces_by_message_id(&self, message_id: &str) -> StoreResult<Vec<DecisionTrace>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {TRACE_COLUMNS} FROM decision_traces WHERE message_id = ?1 \
             ORDER BY timestamp ASC, rowid ASC"
        ))?;
        let rows = statement.query_map(params![message_id], read_trace_row)?;
        collect_rows(rows)
    }

    async fn traces_by_phone_hash(
        &self,
        phone_hash: &str,
        limit: usize,
    ) -> StoreResult<Vec<DecisionTrace>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {TRACE_COLUMNS} FROM decision_traces WHERE phone_hash = ?1 \
             ORDER BY timestamp DESC, rowid DESC LIMIT ?2"
        ))?;
        let rows = statement.query_map(params![phone_hash, usize_to_i64(limit)], read_trace_row)?;
        collect_rows(rows)
    }

    async fn latest_blocking_trace(&self, phone_hash: &str) -> StoreResult<Option<DecisionTrace>> {
        let connection = self.open_connection()?;
        let row = connection
            .query_row(
                &format!(
                    "SELECT {TRACE_COLUMNS} FROM decision_traces \
                     WHERE phone_hash = ?1 AND decision != ?2 \
                     ORDER BY timestamp DESC, rowid DESC LIMIT 1"
                ),
                params![phone_hash, TraceDecision::Respond.as_str()],
                read_trace_row,
            )
            .optional()?;
        row.transpose()
    }

    async fn delete_traces_older_than(&self, days: u64) -> StoreResult<usize> {
        let cutoff = retention_cutoff(days);
        let connection = self.open_connection()?;
        let removed = connection.execute(
            "DELETE FROM decision_traces WHERE timestamp < ?1",
            params![timestamp_to_db(cutoff)],
        )?;
        Ok(removed)
    }
}

#[async_trait]
impl DedupeRepository for SqliteLifecycleStore {
    async fn find_dedupe_key(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DedupeRecord>> {
        let connection = self.open_connection()?;
        let row: Option<(String, String, String, String)> = connection
            .query_row(
                "SELECT dedupe_key, key_type, first_seen_at, expires_at FROM dedupe_keys \
                 WHERE dedupe_key = ?1 AND expires_at > ?2",
                params![key, timestamp_to_db(now)],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let Some((key, key_type, first_seen_at, expires_at)) = row else {
            return Ok(None);
        };
        Ok(Some(DedupeRecord {
            key,
            key_type: DedupeKeyType::parse(&key_type).ok_or_else(|| {
                StoreError::InvalidPersistedValue {
                    field: "key_type",
                    value: key_type.clone(),
                }
            })?,
            first_seen_at: timestamp_from_db(&first_seen_at)?,
            expires_at: timestamp_from_db(&expires_at)?,
        }))
    }

    async fn insert_dedupe_key(&self, record: DedupeRecord) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            "INSERT OR IGNORE INTO dedupe_keys (dedupe_key, key_type, first_seen_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.key,
                record.key_type.as_str(),
                timestamp_to_db(record.first_seen_at),
                timestamp_to_db(record.expires_at),
            ],
        )?;
        Ok(())
    }

    async fn delete_expired_dedupe_keys(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let connection = self.open_connection()?;
        let removed = connection.execute(
            "DELETE FROM dedupe_keys WHERE expires_at <= ?1",
            params![timestamp_to_db(now)],
        )?;
        Ok(removed)
    }
}

fn telemetry_filter_clause(filter: &TelemetryFilter) -> (String, Vec<SqlValue>) {
    let mut clauses = Vec::new();
    let mut values = Vec::new();
    if let Some(message_id) = &filter.message_id {
        values.push(SqlValue::Text(message_id.clone()));
        clauses.push(format!("message_id = ?{}", values.len()));
    }
    if let Some(phone_hash) = &filter.phone_hash {
        values.push(SqlValue::Text(phone_hash.clone()));
        clauses.push(format!("phone_hash = ?{}", values.len()));
    }
    if let Some(correlation_id) = &filter.correlation_id {
        values.push(SqlValue::Text(correlation_id.clone()));
        clauses.push(format!("correlation_id = ?{}", values.len()));
    }
    if let Some(since) = filter.since {
        values.push(SqlValue::Text(timestamp_to_db(since)));
        clauses.push(format!("timestamp >= ?{}", values.len()));
    }
    if let Some(until) = filter.until {
        values.push(SqlValue::Text(timestamp_to_db(until)));
        clauses.push(format!("timestamp < ?{}", values.len()));
    }
    if let Some(states) = &filter.states {
        if states.is_empty() {
            clauses.push("0".to_string());
        } else {
            let mut placeholders = Vec::with_capacity(states.len());
            for state in states {
                values.push(SqlValue::Text(state.as_str().to_string()));
                placeholders.push(format!("?{}", values.len()));
            }
            clauses.push(format!("state IN ({})", placeholders.join(", ")));
        }
    }
    if clauses.is_empty() {
        return (String::new(), values);
    }
    (format!(" WHERE {}", clauses.join(" AND ")), values)
}

fn collect_rows<T, F>(rows: rusqlite::MappedRows<'_, F>) -> StoreResult<Vec<T>>
where
    F: FnMut(&Row<'_>) -> rusqlite::Result<StoreResult<T>>,
{
    let mut items = Vec::new();
    for row in rows {
        items.push(row??);
    }
    Ok(items)
}

fn read_event_row(row: &Row<'_>) -> rusqlite::Result<StoreResult<TelemetryEvent>> {
    let timestamp: String = row.get(3)?;
    let state: String = row.get(4)?;
    let previous_state: Option<String> = row.get(5)?;
    let skip_reason: Option<String> = row.get(6)?;
    let error_type: Option<String> = row.get(7)?;
    let processing_time_ms: Option<i64> = row.get(8)?;
    let event_id: String = row.get(0)?;
    let message_id: String = row.get(1)?;
    let phone_hash: String = row.get(2)?;
    let stage: Option<String> = row.get(9)?;
    let correlation_id: Option<String> = row.get(10)?;
    let detail: Option<String> = row.get(11)?;

    Ok((|| -> StoreResult<TelemetryEvent> {
        Ok(TelemetryEvent {
            event_id,
            message_id,
            phone_hash,
            timestamp: timestamp_from_db(&timestamp)?,
            state: parse_persisted("state", &state, LifecycleState::parse)?,
            previous_state: previous_state
                .map(|value| parse_persisted("previous_state", &value, LifecycleState::parse))
                .transpose()?,
            skip_reason: skip_reason
                .map(|value| parse_persisted("skip_reason", &value, SkipReason::parse))
                .transpose()?,
            error_type: error_type
                .map(|value| parse_persisted("error_type", &value, ErrorType::parse))
                .transpose()?,
            processing_time_ms: processing_time_ms
                .map(|value| i64_to_u64("processing_time_ms", value))
                .transpose()?,
            stage,
            correlation_id,
            detail,
        })
    })())
}

fn read_trace_row(row: &Row<'_>) -> rusqlite::Result<StoreResult<DecisionTrace>> {
    let trace_id: String = row.get(0)?;
    let message_id: String = row.get(1)?;
    let phone_hash: String = row.get(2)?;
    let timestamp: String = row.get(3)?;
    let stage: String = row.get(4)?;
    let decision: String = row.get(5)?;
    let reason_code: String = row.get(6)?;
    let reason_detail: Option<String> = row.get(7)?;
    let next_eligible_at: Option<String> = row.get(8)?;
    let correlation_id: String = row.get(9)?;

    Ok((|| -> StoreResult<DecisionTrace> {
        Ok(DecisionTrace {
            trace_id,
            message_id,
            phone_hash,
            timestamp: timestamp_from_db(&timestamp)?,
            stage: parse_persisted("stage", &stage, TraceStage::parse)?,
            decision: parse_persisted("decision", &decision, TraceDecision::parse)?,
            reason_code: parse_persisted("reason_code", &reason_code, ReasonCode::parse)?,
            reason_detail,
            next_eligible_at: option_timestamp_from_db(next_eligible_at)?,
            correlation_id,
        })
    })())
}

fn parse_persisted<T>(
    field: &'static str,
    value: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> StoreResult<T> {
    parse(value).ok_or_else(|| StoreError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}

fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn option_timestamp_to_db(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(timestamp_to_db)
}

fn timestamp_from_db(value: &str) -> StoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn option_timestamp_from_db(value: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    value.as_deref().map(timestamp_from_db).transpose()
}

fn i64_to_u64(field: &'static str, value: i64) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StoreError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}

fn usize_to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

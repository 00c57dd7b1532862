//! Inbound message deduplication.
//!
//! Keys live in a concurrent TTL cache that is the source of truth for the
//! running process. An optional durable repository is consulted on cache
//! misses and written best-effort so that restarts keep recent keys.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use courier_store::DedupeRepository;
use courier_types::{DedupeKey, DedupeKeyType, DedupeRecord};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::Instrument;
use unicode_normalization::UnicodeNormalization;

const UNKNOWN_CONVERSATION: &str = "unknown";

/// Identifying attributes of an inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupeInput {
    #[serde(default)]
    pub provider_message_id: Option<String>,
    #[serde(default)]
    pub remote_conversation_id: String,
    /// Provider timestamp in unix seconds.
    #[serde(default)]
    pub provider_timestamp: Option<i64>,
    #[serde(default)]
    pub text_content: Option<String>,
}

impl DedupeInput {
    pub fn native(provider_message_id: &str, remote_conversation_id: &str) -> Self {
        Self {
            provider_message_id: Some(provider_message_id.to_string()),
            remote_conversation_id: remote_conversation_id.to_string(),
            provider_timestamp: None,
            text_content: None,
        }
    }

    /// Fills a blank conversation id with `fallback`, usually the sender's
    /// phone hash, so that fallback keys stay per contact.
    pub fn with_conversation_fallback(mut self, fallback: &str) -> Self {
        if self.remote_conversation_id.trim().is_empty() {
            self.remote_conversation_id = fallback.to_string();
        }
        self
    }

    /// True when there is a provider id, a timestamp or non-blank text to
    /// derive a key from.
    pub fn has_identifying_material(&self) -> bool {
        self.provider_message_id
            .as_deref()
            .is_some_and(|value| !value.trim().is_empty())
            || self.provider_timestamp.is_some()
            || self
                .text_content
                .as_deref()
                .is_some_and(|text| !text.trim().is_empty())
    }
}

/// Applies NFKC, collapses whitespace runs, trims and lowercases message text.
///
/// Lowercasing is not full Unicode case folding: "ß" and "SS" still produce
/// different text and therefore different keys.
pub fn normalize_dedupe_text(raw: &str) -> String {
    raw.nfkc()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Derives the dedupe key. A provider id wins; otherwise the key is a digest
/// of conversation, provider timestamp and normalized text.
pub fn compute_dedupe_key(input: &DedupeInput) -> DedupeKey {
    let conversation = match input.remote_conversation_id.trim() {
        "" => UNKNOWN_CONVERSATION,
        trimmed => trimmed,
    };
    if let Some(provider_message_id) = input
        .provider_message_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return DedupeKey {
            key: format!("{provider_message_id}:{conversation}"),
            key_type: DedupeKeyType::Native,
        };
    }

    let timestamp = input
        .provider_timestamp
        .map(|value| value.to_string())
        .unwrap_or_default();
    let normalized = normalize_dedupe_text(input.text_content.as_deref().unwrap_or_default());
    let mut hasher = Sha256::new();
    hasher.update(conversation.as_bytes());
    hasher.update(b"|");
    hasher.update(timestamp.as_bytes());
    hasher.update(b"|");
    hasher.update(normalized.as_bytes());
    let digest = hasher.finalize();
    DedupeKey {
        key: digest.iter().map(|byte| format!("{byte:02x}")).collect(),
        key_type: DedupeKeyType::Fallback,
    }
}

/// Result of [`DedupeEngine::check_and_mark`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupeOutcome {
    pub key: DedupeKey,
    pub duplicate: bool,
}

/// Point-in-time dedupe counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DedupeMetrics {
    pub total_checks: u64,
    pub duplicates_found: u64,
    pub native_keys: u64,
    pub fallback_keys: u64,
    pub store_errors: u64,
    pub cache_size: usize,
    /// Share of checks that had to fall back to a content digest.
    pub fallback_ratio: f64,
}

#[derive(Debug, Default)]
struct DedupeCounters {
    total_checks: AtomicU64,
    duplicates_found: AtomicU64,
    native_keys: AtomicU64,
    fallback_keys: AtomicU64,
    store_errors: AtomicU64,
}

pub struct DedupeEngine {
    cache: DashMap<String, DedupeRecord>,
    store: Option<Arc<dyn DedupeRepository>>,
    ttl: Duration,
    counters: DedupeCounters,
}

impl std::fmt::Debug for DedupeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupeEngine")
            .field("cache_size", &self.cache.len())
            .field("durable_store", &self.store.is_some())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl DedupeEngine {
    pub fn new(ttl: Duration, store: Option<Arc<dyn DedupeRepository>>) -> Self {
        Self {
            cache: DashMap::new(),
            store,
            ttl,
            counters: DedupeCounters::default(),
        }
    }

    /// Returns true when `key` was already processed within the TTL.
    pub async fn is_processed(&self, key: &DedupeKey) -> bool {
        self.is_processed_at(key, Utc::now()).await
    }

    pub async fn is_processed_at(&self, key: &DedupeKey, now: DateTime<Utc>) -> bool {
        self.count_check(key.key_type);
        if self.cached_live(&key.key, now) {
            self.counters.duplicates_found.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        let Some(record) = self.durable_lookup(&key.key, now).await else {
            return false;
        };
        self.cache.entry(record.key.clone()).or_insert(record);
        self.counters.duplicates_found.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Marks `key` as processed in the cache and, best-effort, in the store.
    pub fn mark_as_processed(&self, key: &DedupeKey) {
        self.mark_as_processed_at(key, Utc::now());
    }

    pub fn mark_as_processed_at(&self, key: &DedupeKey, now: DateTime<Utc>) {
        let record = self.fresh_record(key, now);
        let inserted = match self.cache.entry(key.key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(record.clone());
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(record.clone());
                true
            }
        };
        if inserted {
            self.persist_best_effort(record);
        }
    }

    /// Derives the key for `input`, then checks and marks it in one step.
    ///
    /// The final decision is taken under the cache entry lock, so two
    /// concurrent deliveries of the same message cannot both be new.
    pub async fn check_and_mark(&self, input: &DedupeInput) -> DedupeOutcome {
        self.check_and_mark_at(input, Utc::now()).await
    }

    /// Input with nothing identifying is never marked and never reported as a
    /// duplicate, since any key built from it would collide across messages.
    pub async fn check_and_mark_at(&self, input: &DedupeInput, now: DateTime<Utc>) -> DedupeOutcome {
        let key = compute_dedupe_key(input);
        self.count_check(key.key_type);
        if !input.has_identifying_material() {
            tracing::debug!("no identifying dedupe material; delivery treated as new");
            return DedupeOutcome {
                key,
                duplicate: false,
            };
        }

        if self.cached_live(&key.key, now) {
            return self.duplicate(key);
        }
        let durable_hit = self.durable_lookup(&key.key, now).await;

        let (duplicate, fresh) = match self.cache.entry(key.key.clone()) {
            Entry::Occupied(occupied) if !occupied.get().is_expired(now) => (true, None),
            Entry::Occupied(mut occupied) => match durable_hit {
                Some(record) => {
                    occupied.insert(record);
                    (true, None)
                }
                None => {
                    let record = self.fresh_record(&key, now);
                    occupied.insert(record.clone());
                    (false, Some(record))
                }
            },
            Entry::Vacant(vacant) => match durable_hit {
                Some(record) => {
                    vacant.insert(record);
                    (true, None)
                }
                None => {
                    let record = self.fresh_record(&key, now);
                    vacant.insert(record.clone());
                    (false, Some(record))
                }
            },
        };

        if let Some(record) = fresh {
            self.persist_best_effort(record);
        }
        if duplicate {
            return self.duplicate(key);
        }
        tracing::debug!(
            dedupe_key_type = key.key_type.as_str(),
            "dedupe key marked as processed"
        );
        DedupeOutcome {
            key,
            duplicate: false,
        }
    }

    /// Evicts expired cache entries and returns how many were removed.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.cache.len();
        self.cache.retain(|_, record| !record.is_expired(now));
        before.saturating_sub(self.cache.len())
    }

    /// Deletes expired keys from the durable store. Failures are logged.
    pub async fn sweep_durable(&self, now: DateTime<Utc>) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        match store.delete_expired_dedupe_keys(now).await {
            Ok(removed) => removed,
            Err(error) => {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %error, "durable dedupe sweep failed");
                0
            }
        }
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    pub fn metrics(&self) -> DedupeMetrics {
        let total_checks = self.counters.total_checks.load(Ordering::Relaxed);
        let fallback_keys = self.counters.fallback_keys.load(Ordering::Relaxed);
        let fallback_ratio = if total_checks == 0 {
            0.0
        } else {
            fallback_keys as f64 / total_checks as f64
        };
        DedupeMetrics {
            total_checks,
            duplicates_found: self.counters.duplicates_found.load(Ordering::Relaxed),
            native_keys: self.counters.native_keys.load(Ordering::Relaxed),
            fallback_keys,
            store_errors: self.counters.store_errors.load(Ordering::Relaxed),
            cache_size: self.cache.len(),
            fallback_ratio,
        }
    }

    fn count_check(&self, key_type: DedupeKeyType) {
        self.counters.total_checks.fetch_add(1, Ordering::Relaxed);
        match key_type {
            DedupeKeyType::Native => self.counters.native_keys.fetch_add(1, Ordering::Relaxed),
            DedupeKeyType::Fallback => self.counters.fallback_keys.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn duplicate(&self, key: DedupeKey) -> DedupeOutcome {
        self.counters.duplicates_found.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            dedupe_key_type = key.key_type.as_str(),
            "duplicate delivery detected"
        );
        DedupeOutcome {
            key,
            duplicate: true,
        }
    }

    fn cached_live(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.cache
            .get(key)
            .is_some_and(|record| !record.is_expired(now))
    }

    fn fresh_record(&self, key: &DedupeKey, now: DateTime<Utc>) -> DedupeRecord {
        DedupeRecord {
            key: key.key.clone(),
            key_type: key.key_type,
            first_seen_at: now,
            expires_at: now + self.ttl,
        }
    }

    async fn durable_lookup(&self, key: &str, now: DateTime<Utc>) -> Option<DedupeRecord> {
        let store = self.store.as_ref()?;
        match store.find_dedupe_key(key, now).await {
            Ok(record) => record,
            Err(error) => {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    error = %error,
                    "durable dedupe lookup failed; treating message as new"
                );
                None
            }
        }
    }

    fn persist_best_effort(&self, record: DedupeRecord) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no tokio runtime; durable dedupe write skipped");
            return;
        };
        runtime.spawn(
            async move {
                if let Err(error) = store.insert_dedupe_key(record).await {
                    tracing::warn!(error = %error, "durable dedupe write failed");
                }
            }
            .instrument(tracing::Span::current()),
        );
    }
}

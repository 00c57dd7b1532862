//! Task-scoped correlation context.
//!
//! A context is established once per inbound message or outbound attempt with
//! [`with_correlation_context`]. Code running inside that future, including
//! nested `async` calls, reads it through [`current_context`] without any
//! parameter threading. The correlation id never changes once the scope is
//! entered; [`update_context`] only fills in fields that are still empty.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use courier_core::{hash_phone, next_id};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::lock_unpoisoned;

tokio::task_local! {
    static CURRENT_CONTEXT: Arc<Mutex<CorrelationContext>>;
}

/// Identifiers attached to one logical operation.
///
/// Only the phone hash is kept; raw phone numbers never enter the context.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CorrelationContext {
    pub correlation_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub phone_hash: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub flow: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl CorrelationContext {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            ..Self::default()
        }
    }

    /// Starts a context with a freshly generated correlation id.
    pub fn generate() -> Self {
        Self::new(next_id("corr"))
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Hashes `phone` and stores only the hash.
    pub fn with_phone(mut self, phone: &str) -> Self {
        self.phone_hash = Some(hash_phone(phone));
        self
    }

    pub fn with_order_id(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    pub fn with_flow(mut self, flow: impl Into<String>) -> Self {
        self.flow = Some(flow.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns a span carrying the context's identifiers as structured fields.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "lifecycle",
            correlation_id = %self.correlation_id,
            session_id = self.session_id.as_deref().unwrap_or(""),
            phone_hash = self.phone_hash.as_deref().unwrap_or(""),
            order_id = self.order_id.as_deref().unwrap_or(""),
            flow = self.flow.as_deref().unwrap_or(""),
        )
    }

    fn merge(&mut self, update: ContextUpdate) {
        fill_if_empty(&mut self.session_id, update.session_id);
        fill_if_empty(&mut self.phone_hash, update.phone_hash);
        fill_if_empty(&mut self.order_id, update.order_id);
        fill_if_empty(&mut self.flow, update.flow);
        for (key, value) in update.metadata {
            self.metadata.entry(key).or_insert(value);
        }
    }
}

/// Additive changes applied by [`update_context`]. Existing values win.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextUpdate {
    pub session_id: Option<String>,
    pub phone_hash: Option<String>,
    pub order_id: Option<String>,
    pub flow: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

fn fill_if_empty(slot: &mut Option<String>, candidate: Option<String>) {
    if slot.is_none() {
        *slot = candidate.filter(|value| !value.trim().is_empty());
    }
}

/// Runs `future` with `context` as the current correlation context, inside the
/// context's tracing span.
pub async fn with_correlation_context<F>(context: CorrelationContext, future: F) -> F::Output
where
    F: Future,
{
    let span = context.span();
    CURRENT_CONTEXT
        .scope(Arc::new(Mutex::new(context)), future.instrument(span))
        .await
}

/// Returns a snapshot of the current context, if one is active.
pub fn current_context() -> Option<CorrelationContext> {
    CURRENT_CONTEXT
        .try_with(|cell| lock_unpoisoned(cell).clone())
        .ok()
}

pub fn current_correlation_id() -> Option<String> {
    CURRENT_CONTEXT
        .try_with(|cell| lock_unpoisoned(cell).correlation_id.clone())
        .ok()
}

/// Merges `update` into the active context. Returns false outside a scope.
pub fn update_context(update: ContextUpdate) -> bool {
    CURRENT_CONTEXT
        .try_with(|cell| lock_unpoisoned(cell).merge(update))
        .is_ok()
}

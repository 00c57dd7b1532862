//! Inbound and outbound pipeline facade.
//!
//! [`LifecyclePipeline`] is the composition of the dedupe engine, telemetry
//! state machine, trace ledger and outbound gate over one set of
//! repositories. Every public operation runs inside a correlation scope: the
//! caller's scope when one is active, otherwise one derived from the message.
//!
//! Only trace invariant violations are returned to callers. Telemetry
//! transition errors and store failures are logged and absorbed.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use courier_core::hash_phone;
use courier_store::{
    DecisionTraceRepository, DedupeRepository, StoreResult, TelemetryRepository,
};
use courier_types::{
    DecisionTrace, ErrorType, FunnelStats, MessageJourney, SessionPolicyState, SkipReason,
    TelemetryEvent, TraceStage,
};
use serde::{Deserialize, Serialize};

use crate::lifecycle_config::{validate_lifecycle_config, LifecycleConfig};
use crate::lifecycle_context::{current_context, with_correlation_context, CorrelationContext};
use crate::lifecycle_dedupe::{DedupeEngine, DedupeInput, DedupeMetrics, DedupeOutcome};
use crate::lifecycle_explain::{explain_gate, GateExplanation};
use crate::lifecycle_gate::{GateContext, GateDecision, OutboundGate, OutboundMessageType};
use crate::lifecycle_persistence::{PersistenceStats, PersistenceWriter};
use crate::lifecycle_sweeper::{spawn_periodic_sweep, SweeperHandle};
use crate::lifecycle_telemetry::{TelemetryError, TelemetryStateMachine, UNKNOWN_PHONE_HASH};
use crate::lifecycle_trace::{DecisionTraceLedger, TraceInvariantError};

const RETENTION_PURGE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

/// An inbound message as reported by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: String,
    /// Raw phone or provider jid; hashed before it leaves the pipeline.
    pub phone: String,
    #[serde(default)]
    pub dedupe: DedupeInput,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Outcome of [`LifecyclePipeline::begin_inbound`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundDecision {
    pub message_id: String,
    pub correlation_id: String,
    pub dedupe: DedupeOutcome,
}

impl InboundDecision {
    /// False when the delivery was a duplicate and has already been skipped.
    pub fn should_process(&self) -> bool {
        !self.dedupe.duplicate
    }
}

/// A proactive message about to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub message_id: String,
    pub phone: String,
    pub session: SessionPolicyState,
    pub message_type: OutboundMessageType,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub dedupe_cache_evicted: usize,
    pub dedupe_store_deleted: usize,
    pub start_times_evicted: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    pub events_deleted: usize,
    pub traces_deleted: usize,
}

pub struct LifecyclePipeline {
    config: LifecycleConfig,
    dedupe: DedupeEngine,
    telemetry: TelemetryStateMachine,
    ledger: DecisionTraceLedger,
    gate: OutboundGate,
    writer: PersistenceWriter,
    traces: Arc<dyn DecisionTraceRepository>,
}

impl std::fmt::Debug for LifecyclePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecyclePipeline")
            .field("config", &self.config)
            .field("dedupe", &self.dedupe)
            .field("telemetry", &self.telemetry)
            .finish()
    }
}

impl LifecyclePipeline {
    /// Builds a pipeline over one store that backs every repository.
    ///
    /// Must be called inside a tokio runtime; the persistence writer task is
    /// spawned here.
    pub fn new<S>(config: LifecycleConfig, store: Arc<S>) -> Result<Self>
    where
        S: TelemetryRepository + DecisionTraceRepository + DedupeRepository + 'static,
    {
        let dedupe_store: Arc<dyn DedupeRepository> = store.clone();
        Self::with_repositories(config, store.clone(), store, Some(dedupe_store))
    }

    pub fn with_repositories(
        config: LifecycleConfig,
        telemetry: Arc<dyn TelemetryRepository>,
        traces: Arc<dyn DecisionTraceRepository>,
        dedupe_store: Option<Arc<dyn DedupeRepository>>,
    ) -> Result<Self> {
        validate_lifecycle_config(&config)?;
        let gate = OutboundGate::new(config.gate_policy()?);
        let writer = PersistenceWriter::spawn(Arc::clone(&telemetry), Arc::clone(&traces));
        let dedupe = DedupeEngine::new(config.dedupe_ttl(), dedupe_store);
        let telemetry = TelemetryStateMachine::new(
            writer.clone(),
            telemetry,
            config.telemetry_start_time_ttl(),
            config.telemetry_start_time_cap,
            config.detail_max_chars,
        );
        let ledger = DecisionTraceLedger::new(
            writer.clone(),
            Arc::clone(&traces),
            config.trace_invariant_mode,
            config.detail_max_chars,
        );
        Ok(Self {
            config,
            dedupe,
            telemetry,
            ledger,
            gate,
            writer,
            traces,
        })
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn dedupe(&self) -> &DedupeEngine {
        &self.dedupe
    }

    pub fn telemetry(&self) -> &TelemetryStateMachine {
        &self.telemetry
    }

    pub fn ledger(&self) -> &DecisionTraceLedger {
        &self.ledger
    }

    pub fn gate(&self) -> &OutboundGate {
        &self.gate
    }

    /// Dedupes an inbound delivery, records RECEIVED and traces the decision.
    /// Duplicates under a new message id are recorded as SKIPPED(DEDUPED)
    /// before returning. A redelivered id that is already tracked or closed
    /// is traced as deduped without touching its telemetry.
    #[tracing::instrument(
        name = "lifecycle.begin_inbound",
        skip(self, message),
        fields(message_id = %message.message_id)
    )]
    pub async fn begin_inbound(
        &self,
        message: InboundMessage,
    ) -> Result<InboundDecision, TraceInvariantError> {
        let fallback = || {
            let mut context = message
                .correlation_id
                .clone()
                .map(CorrelationContext::new)
                .unwrap_or_else(CorrelationContext::generate)
                .with_phone(&message.phone);
            context.session_id = message.session_id.clone();
            context
        };
        self.scoped(fallback, self.begin_inbound_scoped(&message))
            .await
    }

    async fn begin_inbound_scoped(
        &self,
        message: &InboundMessage,
    ) -> Result<InboundDecision, TraceInvariantError> {
        let phone_hash = hash_phone(&message.phone);
        let input = message
            .dedupe
            .clone()
            .with_conversation_fallback(&phone_hash);
        let mut outcome = self.dedupe.check_and_mark(&input).await;
        let received = self
            .telemetry
            .record_received(&message.message_id, &message.phone);
        // A tracked or closed id keeps its own lifecycle; the redelivery only
        // leaves traces.
        let id_already_seen = matches!(received, Err(TelemetryError::DuplicateReceived { .. }));
        absorb_telemetry(&message.message_id, received);
        self.ledger.received(&message.message_id, &phone_hash)?;
        outcome.duplicate |= id_already_seen;

        if outcome.duplicate {
            if !id_already_seen {
                absorb_telemetry(
                    &message.message_id,
                    self.telemetry
                        .record_skipped(&message.message_id, SkipReason::Deduped, None),
                );
            }
            self.ledger.deduped(&message.message_id, &phone_hash)?;
            tracing::info!(
                dedupe_key_type = outcome.key.key_type.as_str(),
                id_already_seen,
                "duplicate delivery skipped"
            );
        } else {
            self.ledger.accepted_new(&message.message_id, &phone_hash)?;
        }

        Ok(InboundDecision {
            message_id: message.message_id.clone(),
            correlation_id: current_context()
                .map(|context| context.correlation_id)
                .unwrap_or_default(),
            dedupe: outcome,
        })
    }

    pub async fn mark_queued(&self, message_id: &str) {
        self.scoped(
            || self.context_for(message_id),
            async { absorb_telemetry(message_id, self.telemetry.record_queued(message_id)) },
        )
        .await;
    }

    pub async fn mark_processing(&self, message_id: &str) {
        self.scoped(
            || self.context_for(message_id),
            async { absorb_telemetry(message_id, self.telemetry.record_processing(message_id)) },
        )
        .await;
    }

    #[tracing::instrument(name = "lifecycle.complete_responded", skip(self, detail))]
    pub async fn complete_responded(
        &self,
        message_id: &str,
        stage: TraceStage,
        detail: Option<&str>,
    ) -> Result<DecisionTrace, TraceInvariantError> {
        self.scoped(|| self.context_for(message_id), async {
            let phone_hash = self.phone_hash_for(message_id);
            absorb_telemetry(
                message_id,
                self.telemetry
                    .record_responded(message_id, Some(stage_label(stage).as_str()), detail),
            );
            self.ledger.success(message_id, &phone_hash, stage, detail)
        })
        .await
    }

    #[tracing::instrument(name = "lifecycle.complete_skipped", skip(self, detail))]
    pub async fn complete_skipped(
        &self,
        message_id: &str,
        reason: SkipReason,
        detail: Option<&str>,
    ) -> Result<DecisionTrace, TraceInvariantError> {
        self.scoped(|| self.context_for(message_id), async {
            let phone_hash = self.phone_hash_for(message_id);
            absorb_telemetry(
                message_id,
                self.telemetry.record_skipped(message_id, reason, detail),
            );
            self.ledger.skipped(message_id, &phone_hash, reason, detail)
        })
        .await
    }

    #[tracing::instrument(name = "lifecycle.complete_error", skip(self, detail))]
    pub async fn complete_error(
        &self,
        message_id: &str,
        error_type: ErrorType,
        detail: Option<&str>,
    ) -> Result<DecisionTrace, TraceInvariantError> {
        self.scoped(|| self.context_for(message_id), async {
            let phone_hash = self.phone_hash_for(message_id);
            absorb_telemetry(
                message_id,
                self.telemetry.record_error(message_id, error_type, detail),
            );
            self.ledger
                .errored(message_id, &phone_hash, error_type, detail)
        })
        .await
    }

    /// Gates a proactive message and traces the decision. The session is only
    /// read; updating it after an allowed send is the caller's job.
    #[tracing::instrument(
        name = "lifecycle.evaluate_outbound",
        skip(self, request),
        fields(message_id = %request.message_id, message_type = request.message_type.as_str())
    )]
    pub async fn evaluate_outbound(
        &self,
        request: OutboundRequest,
    ) -> Result<GateDecision, TraceInvariantError> {
        let phone_hash = hash_phone(&request.phone);
        let fallback = || CorrelationContext::generate().with_phone(&request.phone);
        self.scoped(fallback, async {
            let decision = self.gate.evaluate(
                &request.session,
                &GateContext {
                    message_type: request.message_type,
                    now: request.now,
                    phone_hash: phone_hash.clone(),
                },
            );
            for error in &decision.evaluation_errors {
                tracing::warn!(error = %error, "outbound policy evaluation failed; policy ignored");
            }
            if decision.allowed {
                self.ledger
                    .policy_allowed(&request.message_id, &phone_hash, decision.evaluated_at)?;
            } else {
                self.ledger
                    .policy_blocked(&request.message_id, &phone_hash, &decision)?;
                tracing::info!(
                    blocked_by = ?decision.blocked_by,
                    next_eligible_at = ?decision.next_eligible_at,
                    "outbound message blocked"
                );
            }
            Ok(decision)
        })
        .await
    }

    /// Waits for every queued telemetry and trace write.
    pub async fn flush(&self) {
        self.writer.flush().await;
    }

    pub async fn funnel_stats(&self, window_minutes: u64) -> StoreResult<FunnelStats> {
        self.flush().await;
        self.telemetry.funnel_stats(window_minutes).await
    }

    pub async fn events_for_message(&self, message_id: &str) -> StoreResult<Vec<TelemetryEvent>> {
        self.flush().await;
        self.telemetry.events_by_message_id(message_id).await
    }

    pub async fn events_for_phone(
        &self,
        phone: &str,
        limit: usize,
    ) -> StoreResult<Vec<TelemetryEvent>> {
        self.flush().await;
        self.telemetry
            .events_by_phone_hash(&hash_phone(phone), limit)
            .await
    }

    pub async fn message_journey(&self, message_id: &str) -> StoreResult<Option<MessageJourney>> {
        self.flush().await;
        self.telemetry.get_message_journey(message_id).await
    }

    pub async fn recent_journeys(
        &self,
        phone: &str,
        limit: usize,
    ) -> StoreResult<Vec<MessageJourney>> {
        self.flush().await;
        self.telemetry
            .get_recent_journeys(&hash_phone(phone), limit)
            .await
    }

    pub async fn traces_for_message(&self, message_id: &str) -> StoreResult<Vec<DecisionTrace>> {
        self.flush().await;
        self.ledger.traces_for_message(message_id).await
    }

    pub async fn explain_gate(
        &self,
        phone: &str,
        session: &SessionPolicyState,
        now: DateTime<Utc>,
    ) -> GateExplanation {
        self.flush().await;
        explain_gate(&self.gate, self.traces.as_ref(), phone, session, now).await
    }

    pub fn dedupe_metrics(&self) -> DedupeMetrics {
        self.dedupe.metrics()
    }

    pub fn persistence_stats(&self) -> PersistenceStats {
        self.writer.stats()
    }

    /// Runs one dedupe and in-flight sweep.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let report = SweepReport {
            dedupe_cache_evicted: self.dedupe.sweep_expired(now),
            dedupe_store_deleted: self.dedupe.sweep_durable(now).await,
            start_times_evicted: self.telemetry.sweep_start_times(now),
        };
        tracing::debug!(?report, "lifecycle sweep finished");
        report
    }

    /// Deletes telemetry and traces older than the retention window.
    pub async fn purge_retention(&self) -> RetentionReport {
        self.flush().await;
        let days = self.config.telemetry_retention_days;
        let events_deleted = self
            .telemetry
            .purge_older_than(days)
            .await
            .unwrap_or_else(|error| {
                tracing::warn!(error = %error, "telemetry retention purge failed");
                0
            });
        let traces_deleted = self
            .traces
            .delete_traces_older_than(days)
            .await
            .unwrap_or_else(|error| {
                tracing::warn!(error = %error, "trace retention purge failed");
                0
            });
        let report = RetentionReport {
            events_deleted,
            traces_deleted,
        };
        tracing::info!(?report, retention_days = days, "retention purge finished");
        report
    }

    /// Starts the dedupe/in-flight sweeper and the daily retention purge.
    pub fn spawn_sweepers(self: &Arc<Self>) -> SweeperHandle {
        let sweep_pipeline = Arc::clone(self);
        let sweep = spawn_periodic_sweep(
            "dedupe_and_in_flight",
            self.config.dedupe_cleanup_interval(),
            move || {
                let pipeline = Arc::clone(&sweep_pipeline);
                async move {
                    pipeline.sweep_once(Utc::now()).await;
                }
            },
        );
        let purge_pipeline = Arc::clone(self);
        let purge = spawn_periodic_sweep("retention", RETENTION_PURGE_INTERVAL, move || {
            let pipeline = Arc::clone(&purge_pipeline);
            async move {
                pipeline.purge_retention().await;
            }
        });
        SweeperHandle::new(vec![sweep, purge])
    }

    async fn scoped<C, F>(&self, fallback: C, future: F) -> F::Output
    where
        C: FnOnce() -> CorrelationContext,
        F: Future,
    {
        if current_context().is_some() {
            future.await
        } else {
            with_correlation_context(fallback(), future).await
        }
    }

    fn context_for(&self, message_id: &str) -> CorrelationContext {
        let Some(snapshot) = self.telemetry.in_flight(message_id) else {
            return CorrelationContext::generate();
        };
        let mut context = snapshot
            .correlation_id
            .map(CorrelationContext::new)
            .unwrap_or_else(CorrelationContext::generate);
        context.phone_hash = Some(snapshot.phone_hash);
        context
    }

    fn phone_hash_for(&self, message_id: &str) -> String {
        self.telemetry
            .in_flight(message_id)
            .map(|snapshot| snapshot.phone_hash)
            .or_else(|| current_context().and_then(|context| context.phone_hash))
            .unwrap_or_else(|| UNKNOWN_PHONE_HASH.to_string())
    }
}

fn stage_label(stage: TraceStage) -> String {
    stage.as_str().to_ascii_lowercase()
}

fn absorb_telemetry<T>(message_id: &str, result: Result<T, TelemetryError>) {
    if let Err(error) = result {
        tracing::warn!(message_id, error = %error, "telemetry transition rejected");
    }
}

#[cfg(test)]
mod tests {
    use super::{InboundMessage, LifecyclePipeline, OutboundRequest};
    use crate::lifecycle_config::{LifecycleConfig, TraceInvariantMode};
    use crate::lifecycle_context::{with_correlation_context, CorrelationContext};
    use crate::lifecycle_dedupe::DedupeInput;
    use crate::lifecycle_gate::OutboundMessageType;
    use crate::test_support::FailingLifecycleStore;
    use chrono::{Duration, TimeZone, Utc};
    use courier_store::InMemoryLifecycleStore;
    use courier_types::{
        ErrorType, LifecycleState, ReasonCode, SessionPolicyState, SkipReason, TraceDecision,
        TraceStage,
    };
    use std::sync::Arc;

    fn config() -> LifecycleConfig {
        LifecycleConfig {
            trace_invariant_mode: TraceInvariantMode::Strict,
            ..LifecycleConfig::default()
        }
    }

    fn inbound(message_id: &str, provider_id: &str) -> InboundMessage {
        InboundMessage {
            message_id: message_id.to_string(),
            phone: "573001234567@s.whatsapp.net".to_string(),
            dedupe: DedupeInput::native(provider_id, "c1"),
            correlation_id: None,
            session_id: Some("session-1".to_string()),
        }
    }

    #[tokio::test]
    async fn functional_inbound_happy_path_records_events_and_traces() {
        let store = Arc::new(InMemoryLifecycleStore::new());
        let pipeline = LifecyclePipeline::new(config(), store.clone()).expect("pipeline");

        let decision = pipeline
            .begin_inbound(inbound("m1", "wamid-1"))
            .await
            .expect("begin inbound");
        assert!(decision.should_process());
        pipeline.mark_processing("m1").await;
        pipeline
            .complete_responded("m1", TraceStage::Send, Some("reply delivered"))
            .await
            .expect("responded");

        let events = pipeline.events_for_message("m1").await.expect("events");
        let states: Vec<LifecycleState> = events.iter().map(|event| event.state).collect();
        assert_eq!(
            states,
            vec![
                LifecycleState::Received,
                LifecycleState::Processing,
                LifecycleState::Responded
            ]
        );
        assert!(events
            .iter()
            .all(|event| event.correlation_id.as_deref() == Some(decision.correlation_id.as_str())));

        let traces = pipeline.traces_for_message("m1").await.expect("traces");
        assert!(traces
            .iter()
            .all(|trace| trace.correlation_id == decision.correlation_id));
        assert_eq!(
            traces.last().map(|trace| trace.reason_code),
            Some(ReasonCode::Success)
        );
    }

    #[tokio::test]
    async fn functional_duplicate_delivery_is_skipped_and_traced() {
        let store = Arc::new(InMemoryLifecycleStore::new());
        let pipeline = LifecyclePipeline::new(config(), store).expect("pipeline");
        pipeline
            .begin_inbound(inbound("m1", "wamid-1"))
            .await
            .expect("first delivery");
        let second = pipeline
            .begin_inbound(inbound("m1-redelivery", "wamid-1"))
            .await
            .expect("second delivery");
        assert!(!second.should_process());

        let traces = pipeline
            .traces_for_message("m1-redelivery")
            .await
            .expect("traces");
        let skips: Vec<_> = traces
            .iter()
            .filter(|trace| trace.decision == TraceDecision::Skip)
            .collect();
        assert_eq!(skips.len(), 1);
        assert_eq!(skips[0].reason_code, ReasonCode::Deduped);
        let journey = pipeline
            .message_journey("m1-redelivery")
            .await
            .expect("journey")
            .expect("exists");
        assert_eq!(journey.final_state, LifecycleState::Skipped);
        assert_eq!(pipeline.dedupe_metrics().duplicates_found, 1);
    }

    #[tokio::test]
    async fn functional_caller_scope_is_reused() {
        let store = Arc::new(InMemoryLifecycleStore::new());
        let pipeline = LifecyclePipeline::new(config(), store).expect("pipeline");
        let decision = with_correlation_context(CorrelationContext::new("corr-outer"), async {
            let decision = pipeline
                .begin_inbound(inbound("m2", "wamid-2"))
                .await
                .expect("begin");
            pipeline.mark_processing("m2").await;
            pipeline
                .complete_error("m2", ErrorType::AiTimeout, Some("model timed out"))
                .await
                .expect("error");
            decision
        })
        .await;
        assert_eq!(decision.correlation_id, "corr-outer");
        let traces = pipeline.traces_for_message("m2").await.expect("traces");
        let error = traces
            .iter()
            .find(|trace| trace.decision == TraceDecision::Error)
            .expect("error trace");
        assert_eq!(error.reason_code, ReasonCode::AiTimeout);
        assert_eq!(error.stage, TraceStage::Ai);
        assert!(traces.iter().all(|trace| trace.correlation_id == "corr-outer"));
    }

    #[tokio::test]
    async fn functional_outbound_defer_is_traced_and_explained() {
        let store = Arc::new(InMemoryLifecycleStore::new());
        let pipeline = LifecyclePipeline::new(config(), store).expect("pipeline");
        let now = Utc
            .with_ymd_and_hms(2026, 3, 10, 3, 0, 0)
            .single()
            .expect("valid time");
        let mut session = SessionPolicyState::new(now - Duration::days(1));
        session.last_follow_up = Some(now - Duration::hours(2));

        let decision = pipeline
            .evaluate_outbound(OutboundRequest {
                message_id: "out-1".to_string(),
                phone: "573001234567".to_string(),
                session: session.clone(),
                message_type: OutboundMessageType::FollowUp,
                now,
            })
            .await
            .expect("evaluate");
        assert!(!decision.allowed);

        let traces = pipeline.traces_for_message("out-1").await.expect("traces");
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].decision, TraceDecision::Defer);
        assert!(traces[0]
            .next_eligible_at
            .is_some_and(|next| next > traces[0].timestamp));

        let explanation = pipeline
            .explain_gate("573001234567", &session, now)
            .await;
        assert_eq!(
            explanation
                .latest_blocking_trace
                .map(|trace| trace.message_id),
            Some("out-1".to_string())
        );
    }

    #[tokio::test]
    async fn regression_store_outage_never_reaches_the_caller() {
        let store = Arc::new(FailingLifecycleStore);
        let pipeline = LifecyclePipeline::new(config(), store).expect("pipeline");
        let decision = pipeline
            .begin_inbound(inbound("m9", "wamid-9"))
            .await
            .expect("begin despite outage");
        assert!(decision.should_process());
        pipeline
            .complete_skipped("m9", SkipReason::NoRoute, None)
            .await
            .expect("skip despite outage");
        pipeline.flush().await;
        let stats = pipeline.persistence_stats();
        assert!(stats.write_failures >= 2);
        assert!(pipeline.funnel_stats(60).await.is_err());
        let report = pipeline.purge_retention().await;
        assert_eq!(report.events_deleted, 0);
    }

    #[tokio::test]
    async fn functional_sweep_once_evicts_expired_state() {
        let store = Arc::new(InMemoryLifecycleStore::new());
        let pipeline = LifecyclePipeline::new(config(), store.clone()).expect("pipeline");
        pipeline
            .begin_inbound(inbound("m1", "wamid-1"))
            .await
            .expect("begin");
        for _ in 0..50 {
            if store.dedupe_key_count().await == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        let report = pipeline
            .sweep_once(Utc::now() + Duration::minutes(30))
            .await;
        assert_eq!(report.dedupe_cache_evicted, 1);
        assert_eq!(report.dedupe_store_deleted, 1);
        assert_eq!(report.start_times_evicted, 1);
        assert_eq!(pipeline.dedupe().cache_size(), 0);
    }

    #[tokio::test]
    async fn regression_same_id_redelivery_mid_processing_keeps_the_real_outcome() {
        let store = Arc::new(InMemoryLifecycleStore::new());
        let pipeline = LifecyclePipeline::new(config(), store).expect("pipeline");
        pipeline
            .begin_inbound(inbound("m7", "wamid-7"))
            .await
            .expect("first delivery");
        pipeline.mark_processing("m7").await;

        let redelivery = pipeline
            .begin_inbound(inbound("m7", "wamid-7"))
            .await
            .expect("redelivery");
        assert!(!redelivery.should_process());
        let retried_without_provider_id = pipeline
            .begin_inbound(InboundMessage {
                dedupe: DedupeInput::default(),
                ..inbound("m7", "unused")
            })
            .await
            .expect("redelivery without dedupe material");
        assert!(!retried_without_provider_id.should_process());

        pipeline
            .complete_responded("m7", TraceStage::Send, None)
            .await
            .expect("responded");

        let journey = pipeline
            .message_journey("m7")
            .await
            .expect("journey")
            .expect("exists");
        let states: Vec<LifecycleState> = journey.events.iter().map(|event| event.state).collect();
        assert_eq!(
            states,
            vec![
                LifecycleState::Received,
                LifecycleState::Processing,
                LifecycleState::Responded
            ]
        );
        assert_eq!(journey.final_state, LifecycleState::Responded);

        let traces = pipeline.traces_for_message("m7").await.expect("traces");
        let deduped = traces
            .iter()
            .filter(|trace| trace.reason_code == ReasonCode::Deduped)
            .count();
        assert_eq!(deduped, 2);
        assert_eq!(
            traces.last().map(|trace| trace.reason_code),
            Some(ReasonCode::Success)
        );
    }

    #[tokio::test]
    async fn regression_missing_dedupe_input_never_blocks_distinct_messages() {
        let store = Arc::new(InMemoryLifecycleStore::new());
        let pipeline = LifecyclePipeline::new(config(), store).expect("pipeline");
        for (index, phone) in ["573001111111", "573002222222", "573003333333"]
            .iter()
            .enumerate()
        {
            let decision = pipeline
                .begin_inbound(InboundMessage {
                    message_id: format!("bare-{index}"),
                    phone: phone.to_string(),
                    dedupe: DedupeInput::default(),
                    correlation_id: None,
                    session_id: None,
                })
                .await
                .expect("begin inbound");
            assert!(decision.should_process(), "bare-{index} was deduped");
        }
        assert_eq!(pipeline.dedupe_metrics().duplicates_found, 0);
    }

    #[tokio::test]
    async fn regression_blank_conversation_keys_fallback_per_contact() {
        let store = Arc::new(InMemoryLifecycleStore::new());
        let pipeline = LifecyclePipeline::new(config(), store).expect("pipeline");
        let same_text = |message_id: &str, phone: &str| InboundMessage {
            message_id: message_id.to_string(),
            phone: phone.to_string(),
            dedupe: DedupeInput {
                provider_message_id: None,
                remote_conversation_id: String::new(),
                provider_timestamp: Some(1_773_100_800),
                text_content: Some("hola".to_string()),
            },
            correlation_id: None,
            session_id: None,
        };
        let first = pipeline
            .begin_inbound(same_text("a-1", "573001111111"))
            .await
            .expect("first contact");
        let other_contact = pipeline
            .begin_inbound(same_text("b-1", "573002222222"))
            .await
            .expect("second contact");
        let repeat = pipeline
            .begin_inbound(same_text("a-2", "573001111111"))
            .await
            .expect("repeat from first contact");
        assert!(first.should_process());
        assert!(other_contact.should_process());
        assert!(!repeat.should_process());
    }
}

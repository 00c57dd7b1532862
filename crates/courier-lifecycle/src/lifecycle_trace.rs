//! Decision trace ledger.
//!
//! Every stage decision is recorded through [`DecisionTraceLedger::record`],
//! which enforces the reason-code invariants before the trace is queued for
//! persistence: SKIP, DEFER and ERROR always carry a reason code, and DEFER
//! always carries a next-eligible time strictly after the decision.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use courier_core::{next_id, redact_detail};
use courier_store::{DecisionTraceRepository, StoreResult};
use courier_types::{
    DecisionTrace, ErrorType, ReasonCode, SkipReason, TraceDecision, TraceStage,
};
use thiserror::Error;

use crate::lifecycle_config::TraceInvariantMode;
use crate::lifecycle_context::current_context;
use crate::lifecycle_gate::GateDecision;
use crate::lifecycle_persistence::PersistenceWriter;

/// Deferral applied when a DEFER trace has to be repaired in normalize mode.
pub const NORMALIZED_DEFER_DELAY_SECONDS: i64 = 60;
pub const UNCORRELATED_ID: &str = "uncorrelated";

/// A trace that would break the ledger invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraceInvariantError {
    #[error("{decision} trace for message '{message_id}' has no reason code")]
    MissingReasonCode {
        message_id: String,
        decision: &'static str,
    },
    #[error("DEFER trace for message '{message_id}' has no next eligible time")]
    DeferWithoutNextEligible { message_id: String },
    #[error(
        "DEFER trace for message '{message_id}' has next eligible time {next_eligible_at} not after {timestamp}"
    )]
    DeferNotInFuture {
        message_id: String,
        timestamp: DateTime<Utc>,
        next_eligible_at: DateTime<Utc>,
    },
}

/// Input to [`DecisionTraceLedger::record`].
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRequest {
    pub message_id: String,
    pub phone_hash: String,
    pub stage: TraceStage,
    pub decision: TraceDecision,
    pub reason_code: Option<ReasonCode>,
    pub reason_detail: Option<String>,
    pub next_eligible_at: Option<DateTime<Utc>>,
    /// Defaults to the time of recording.
    pub timestamp: Option<DateTime<Utc>>,
}

impl TraceRequest {
    pub fn new(
        message_id: impl Into<String>,
        phone_hash: impl Into<String>,
        stage: TraceStage,
        decision: TraceDecision,
        reason_code: ReasonCode,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            phone_hash: phone_hash.into(),
            stage,
            decision,
            reason_code: Some(reason_code),
            reason_detail: None,
            next_eligible_at: None,
            timestamp: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.reason_detail = Some(detail.into());
        self
    }
}

/// Pipeline stage that owns a skip reason.
pub fn stage_for_skip_reason(reason: SkipReason) -> TraceStage {
    match reason {
        SkipReason::Deduped => TraceStage::Dedupe,
        SkipReason::EmptyMessage => TraceStage::InboundReceived,
        SkipReason::BlockedUser | SkipReason::PolicyBlocked => TraceStage::Policy,
        SkipReason::NoRoute | SkipReason::ContextBlocked => TraceStage::Flow,
    }
}

/// Pipeline stage that owns an error type.
pub fn stage_for_error_type(error_type: ErrorType) -> TraceStage {
    match error_type {
        ErrorType::AiError | ErrorType::AiTimeout => TraceStage::Ai,
        ErrorType::ProviderSendFail | ErrorType::ProviderTimeout => TraceStage::Send,
        ErrorType::FlowError | ErrorType::CriticalError => TraceStage::Flow,
    }
}

pub struct DecisionTraceLedger {
    writer: PersistenceWriter,
    repository: Arc<dyn DecisionTraceRepository>,
    mode: TraceInvariantMode,
    detail_max_chars: usize,
}

impl std::fmt::Debug for DecisionTraceLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionTraceLedger")
            .field("mode", &self.mode)
            .field("detail_max_chars", &self.detail_max_chars)
            .finish()
    }
}

impl DecisionTraceLedger {
    pub fn new(
        writer: PersistenceWriter,
        repository: Arc<dyn DecisionTraceRepository>,
        mode: TraceInvariantMode,
        detail_max_chars: usize,
    ) -> Self {
        Self {
            writer,
            repository,
            mode,
            detail_max_chars,
        }
    }

    pub fn mode(&self) -> TraceInvariantMode {
        self.mode
    }

    /// Checks the invariants, then queues the trace for persistence.
    pub fn record(&self, request: TraceRequest) -> Result<DecisionTrace, TraceInvariantError> {
        let trace = build_trace(request, self.mode, self.detail_max_chars)?;
        tracing::debug!(
            message_id = %trace.message_id,
            stage = trace.stage.as_str(),
            decision = trace.decision.as_str(),
            reason_code = trace.reason_code.as_str(),
            "decision traced"
        );
        self.writer.submit_trace(trace.clone());
        Ok(trace)
    }

    pub fn received(
        &self,
        message_id: &str,
        phone_hash: &str,
    ) -> Result<DecisionTrace, TraceInvariantError> {
        self.record(TraceRequest::new(
            message_id,
            phone_hash,
            TraceStage::InboundReceived,
            TraceDecision::Respond,
            ReasonCode::Received,
        ))
    }

    pub fn accepted_new(
        &self,
        message_id: &str,
        phone_hash: &str,
    ) -> Result<DecisionTrace, TraceInvariantError> {
        self.record(TraceRequest::new(
            message_id,
            phone_hash,
            TraceStage::Dedupe,
            TraceDecision::Respond,
            ReasonCode::NewMessage,
        ))
    }

    pub fn deduped(
        &self,
        message_id: &str,
        phone_hash: &str,
    ) -> Result<DecisionTrace, TraceInvariantError> {
        self.record(TraceRequest::new(
            message_id,
            phone_hash,
            TraceStage::Dedupe,
            TraceDecision::Skip,
            ReasonCode::Deduped,
        ))
    }

    /// Records an outbound gate block. Any permanent block makes the trace a
    /// SKIP; a purely temporal block is a DEFER until `next_eligible_at`.
    pub fn policy_blocked(
        &self,
        message_id: &str,
        phone_hash: &str,
        decision: &GateDecision,
    ) -> Result<DecisionTrace, TraceInvariantError> {
        let reason_code = decision.blocked_by.first().copied();
        let detail = decision
            .blocked_by
            .iter()
            .map(|code| code.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let trace_decision = if decision.next_eligible_at.is_some() {
            TraceDecision::Defer
        } else {
            TraceDecision::Skip
        };
        self.record(TraceRequest {
            message_id: message_id.to_string(),
            phone_hash: phone_hash.to_string(),
            stage: TraceStage::Policy,
            decision: trace_decision,
            reason_code,
            reason_detail: Some(format!("blocked_by={detail}")),
            next_eligible_at: decision.next_eligible_at,
            timestamp: Some(decision.evaluated_at),
        })
    }

    pub fn policy_allowed(
        &self,
        message_id: &str,
        phone_hash: &str,
        evaluated_at: DateTime<Utc>,
    ) -> Result<DecisionTrace, TraceInvariantError> {
        self.record(TraceRequest {
            timestamp: Some(evaluated_at),
            ..TraceRequest::new(
                message_id,
                phone_hash,
                TraceStage::Policy,
                TraceDecision::Respond,
                ReasonCode::PolicyAllowed,
            )
        })
    }

    pub fn success(
        &self,
        message_id: &str,
        phone_hash: &str,
        stage: TraceStage,
        detail: Option<&str>,
    ) -> Result<DecisionTrace, TraceInvariantError> {
        self.record(TraceRequest {
            reason_detail: detail.map(str::to_string),
            ..TraceRequest::new(
                message_id,
                phone_hash,
                stage,
                TraceDecision::Respond,
                ReasonCode::Success,
            )
        })
    }

    pub fn skipped(
        &self,
        message_id: &str,
        phone_hash: &str,
        reason: SkipReason,
        detail: Option<&str>,
    ) -> Result<DecisionTrace, TraceInvariantError> {
        self.record(TraceRequest {
            reason_detail: detail.map(str::to_string),
            ..TraceRequest::new(
                message_id,
                phone_hash,
                stage_for_skip_reason(reason),
                TraceDecision::Skip,
                reason.reason_code(),
            )
        })
    }

    pub fn errored(
        &self,
        message_id: &str,
        phone_hash: &str,
        error_type: ErrorType,
        detail: Option<&str>,
    ) -> Result<DecisionTrace, TraceInvariantError> {
        self.record(TraceRequest {
            reason_detail: detail.map(str::to_string),
            ..TraceRequest::new(
                message_id,
                phone_hash,
                stage_for_error_type(error_type),
                TraceDecision::Error,
                error_type.reason_code(),
            )
        })
    }

    pub async fn traces_for_message(&self, message_id: &str) -> StoreResult<Vec<DecisionTrace>> {
        self.repository.traces_by_message_id(message_id).await
    }

    pub async fn traces_for_phone_hash(
        &self,
        phone_hash: &str,
        limit: usize,
    ) -> StoreResult<Vec<DecisionTrace>> {
        self.repository.traces_by_phone_hash(phone_hash, limit).await
    }

    /// Answers "why hasn't this contact received a follow-up".
    pub async fn latest_blocking_trace(
        &self,
        phone_hash: &str,
    ) -> StoreResult<Option<DecisionTrace>> {
        self.repository.latest_blocking_trace(phone_hash).await
    }
}

/// Applies the ledger invariants to `request` under `mode`.
pub fn build_trace(
    request: TraceRequest,
    mode: TraceInvariantMode,
    detail_max_chars: usize,
) -> Result<DecisionTrace, TraceInvariantError> {
    let timestamp = request.timestamp.unwrap_or_else(Utc::now);
    let mut notes = Vec::new();

    let reason_code = match (request.reason_code, request.decision) {
        (Some(code), _) => code,
        (None, TraceDecision::Respond) => ReasonCode::Success,
        (None, decision) => match mode {
            TraceInvariantMode::Strict => {
                return Err(TraceInvariantError::MissingReasonCode {
                    message_id: request.message_id,
                    decision: decision.as_str(),
                });
            }
            TraceInvariantMode::Normalize => {
                tracing::warn!(
                    message_id = %request.message_id,
                    decision = decision.as_str(),
                    "trace without reason code normalized to UNKNOWN"
                );
                ReasonCode::Unknown
            }
        },
    };

    let next_eligible_at = if request.decision == TraceDecision::Defer {
        let violation = match request.next_eligible_at {
            None => Some(TraceInvariantError::DeferWithoutNextEligible {
                message_id: request.message_id.clone(),
            }),
            Some(next) if next <= timestamp => Some(TraceInvariantError::DeferNotInFuture {
                message_id: request.message_id.clone(),
                timestamp,
                next_eligible_at: next,
            }),
            Some(_) => None,
        };
        match (violation, mode) {
            (None, _) => request.next_eligible_at,
            (Some(error), TraceInvariantMode::Strict) => return Err(error),
            (Some(error), TraceInvariantMode::Normalize) => {
                tracing::warn!(error = %error, "defer trace normalized to minimum delay");
                notes.push(format!(
                    "next_eligible_at normalized to +{NORMALIZED_DEFER_DELAY_SECONDS}s"
                ));
                Some(timestamp + Duration::seconds(NORMALIZED_DEFER_DELAY_SECONDS))
            }
        }
    } else {
        request.next_eligible_at
    };

    let reason_detail = match (request.reason_detail, notes.is_empty()) {
        (Some(detail), true) => Some(detail),
        (Some(detail), false) => Some(format!("{detail}; {}", notes.join("; "))),
        (None, true) => None,
        (None, false) => Some(notes.join("; ")),
    }
    .map(|detail| redact_detail(&detail, detail_max_chars))
    .filter(|detail| !detail.is_empty());

    let correlation_id = current_context()
        .map(|context| context.correlation_id)
        .unwrap_or_else(|| UNCORRELATED_ID.to_string());

    Ok(DecisionTrace {
        trace_id: next_id("trace"),
        message_id: request.message_id,
        phone_hash: request.phone_hash,
        timestamp,
        stage: request.stage,
        decision: request.decision,
        reason_code,
        reason_detail,
        next_eligible_at,
        correlation_id,
    })
}

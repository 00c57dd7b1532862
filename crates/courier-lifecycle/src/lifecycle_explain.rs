//! Operator-facing explanation of outbound gate status.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use courier_core::hash_phone;
use courier_store::DecisionTraceRepository;
use courier_types::{ContactStatus, DecisionTrace, ReasonCode, SessionPolicyState};
use serde::{Deserialize, Serialize};

use crate::lifecycle_gate::{GateContext, OutboundGate, OutboundMessageType};

/// One blocking reason with its operator-facing description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingReason {
    pub reason_code: ReasonCode,
    pub description: String,
}

/// Answer to "why hasn't this contact received a follow-up".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateExplanation {
    pub phone_hash: String,
    pub evaluated_at: DateTime<Utc>,
    pub allowed: bool,
    pub reasons: Vec<BlockingReason>,
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub contact_status: ContactStatus,
    pub tags: Vec<String>,
    pub attempts_used: u32,
    pub attempts_remaining: u32,
    pub follow_ups_last_24h: u32,
    pub follow_ups_remaining_24h: u32,
    pub latest_blocking_trace: Option<DecisionTrace>,
    #[serde(default)]
    pub evaluation_errors: Vec<String>,
}

/// Evaluates the gate for `phone` as a follow-up at `now` and gathers the
/// counters and last blocking trace for that contact.
///
/// A failed trace lookup is logged and reported as no trace.
pub async fn explain_gate(
    gate: &OutboundGate,
    traces: &dyn DecisionTraceRepository,
    phone: &str,
    session: &SessionPolicyState,
    now: DateTime<Utc>,
) -> GateExplanation {
    let phone_hash = hash_phone(phone);
    let decision = gate.evaluate(
        session,
        &GateContext {
            message_type: OutboundMessageType::FollowUp,
            now,
            phone_hash: phone_hash.clone(),
        },
    );
    let latest_blocking_trace = match traces.latest_blocking_trace(&phone_hash).await {
        Ok(trace) => trace,
        Err(error) => {
            tracing::warn!(
                error = %error,
                phone_hash = %phone_hash,
                "latest blocking trace lookup failed"
            );
            None
        }
    };
    let policy = gate.policy();

    GateExplanation {
        phone_hash,
        evaluated_at: now,
        allowed: decision.allowed,
        reasons: decision
            .blocked_by
            .iter()
            .map(|code| BlockingReason {
                reason_code: *code,
                description: code.describe().to_string(),
            })
            .collect(),
        next_eligible_at: decision.next_eligible_at,
        contact_status: session.contact_status,
        tags: session.tags.iter().cloned().collect(),
        attempts_used: session.follow_up_attempts,
        attempts_remaining: policy
            .max_follow_up_attempts
            .saturating_sub(session.follow_up_attempts),
        follow_ups_last_24h: session.follow_up_count_24h,
        follow_ups_remaining_24h: policy
            .max_follow_ups_per_24h
            .saturating_sub(session.follow_up_count_24h),
        latest_blocking_trace,
        evaluation_errors: decision.evaluation_errors,
    }
}

/// Renders an explanation as plain text for terminals and logs.
pub fn render_gate_explanation(explanation: &GateExplanation) -> String {
    let mut out = String::new();
    let status = if explanation.allowed {
        "allowed"
    } else {
        "blocked"
    };
    let _ = writeln!(
        out,
        "outbound gate for {}: {status}",
        explanation.phone_hash
    );
    for reason in &explanation.reasons {
        let _ = writeln!(
            out,
            "  - {}: {}",
            reason.reason_code.as_str(),
            reason.description
        );
    }
    match explanation.next_eligible_at {
        Some(next) => {
            let _ = writeln!(out, "next eligible at: {}", next.to_rfc3339());
        }
        None if !explanation.allowed => {
            let _ = writeln!(out, "next eligible at: never (permanent block)");
        }
        None => {}
    }
    let _ = writeln!(
        out,
        "contact status: {}",
        explanation.contact_status.as_str()
    );
    let tags = if explanation.tags.is_empty() {
        "none".to_string()
    } else {
        explanation.tags.join(", ")
    };
    let _ = writeln!(out, "tags: {tags}");
    let _ = writeln!(
        out,
        "attempts: {} used, {} remaining",
        explanation.attempts_used, explanation.attempts_remaining
    );
    let _ = writeln!(
        out,
        "last 24h: {} sent, {} remaining",
        explanation.follow_ups_last_24h, explanation.follow_ups_remaining_24h
    );
    if let Some(trace) = &explanation.latest_blocking_trace {
        let _ = writeln!(
            out,
            "latest blocking trace: {} {} {} at {} (message {})",
            trace.stage.as_str(),
            trace.decision.as_str(),
            trace.reason_code.as_str(),
            trace.timestamp.to_rfc3339(),
            trace.message_id
        );
    }
    for error in &explanation.evaluation_errors {
        let _ = writeln!(out, "evaluation error (ignored): {error}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{explain_gate, render_gate_explanation};
    use crate::lifecycle_config::LifecycleConfig;
    use crate::lifecycle_gate::OutboundGate;
    use crate::test_support::FailingLifecycleStore;
    use chrono::{Duration, TimeZone, Utc};
    use courier_core::hash_phone;
    use courier_store::{DecisionTraceRepository, InMemoryLifecycleStore};
    use courier_types::{
        ContactStatus, DecisionTrace, ReasonCode, SessionPolicyState, TraceDecision, TraceStage,
    };

    fn gate() -> OutboundGate {
        OutboundGate::new(
            LifecycleConfig::default()
                .gate_policy()
                .expect("default policy"),
        )
    }

    #[tokio::test]
    async fn functional_explains_blocks_counters_and_latest_trace() {
        let store = InMemoryLifecycleStore::new();
        let now = Utc
            .with_ymd_and_hms(2026, 3, 10, 3, 0, 0)
            .single()
            .expect("valid time");
        store
            .create_trace(DecisionTrace {
                trace_id: "t-1".to_string(),
                message_id: "out-1".to_string(),
                phone_hash: hash_phone("573001234567"),
                timestamp: now - Duration::hours(2),
                stage: TraceStage::Policy,
                decision: TraceDecision::Defer,
                reason_code: ReasonCode::PolicyOutsideHours,
                reason_detail: None,
                next_eligible_at: Some(now + Duration::hours(6)),
                correlation_id: "corr-1".to_string(),
            })
            .await
            .expect("seed trace");

        let mut session = SessionPolicyState::new(now - Duration::days(2));
        session.last_follow_up = Some(now - Duration::hours(2));
        session.follow_up_attempts = 1;
        session.follow_up_count_24h = 1;
        session.tags.insert("vip".to_string());

        let explanation = explain_gate(&gate(), &store, "+57 300 123 4567", &session, now).await;
        assert!(!explanation.allowed);
        assert_eq!(explanation.attempts_used, 1);
        assert_eq!(explanation.attempts_remaining, 2);
        assert_eq!(explanation.follow_ups_remaining_24h, 0);
        assert_eq!(explanation.contact_status, ContactStatus::Active);
        let codes: Vec<ReasonCode> = explanation
            .reasons
            .iter()
            .map(|reason| reason.reason_code)
            .collect();
        assert!(codes.contains(&ReasonCode::PolicyCooldown));
        assert!(codes.contains(&ReasonCode::PolicyOutsideHours));
        assert!(codes.contains(&ReasonCode::PolicyRateLimited));
        assert_eq!(
            explanation
                .latest_blocking_trace
                .as_ref()
                .map(|trace| trace.trace_id.as_str()),
            Some("t-1")
        );

        let rendered = render_gate_explanation(&explanation);
        assert!(rendered.contains("blocked"));
        assert!(rendered.contains("POLICY_COOLDOWN"));
        assert!(rendered.contains("tags: vip"));
        assert!(!rendered.contains("573001234567"));
    }

    #[tokio::test]
    async fn regression_trace_lookup_failure_still_explains() {
        let now = Utc
            .with_ymd_and_hms(2026, 3, 10, 12, 0, 0)
            .single()
            .expect("valid time");
        let mut session = SessionPolicyState::new(now);
        session.contact_status = ContactStatus::OptOut;
        let explanation =
            explain_gate(&gate(), &FailingLifecycleStore, "5730", &session, now).await;
        assert!(!explanation.allowed);
        assert!(explanation.latest_blocking_trace.is_none());
        assert!(render_gate_explanation(&explanation).contains("never (permanent block)"));
    }

    #[tokio::test]
    async fn unit_repeated_explanations_compare_equal() {
        let store = InMemoryLifecycleStore::new();
        let now = Utc
            .with_ymd_and_hms(2026, 3, 10, 3, 0, 0)
            .single()
            .expect("valid time");
        store
            .create_trace(DecisionTrace {
                trace_id: "t-2".to_string(),
                message_id: "out-2".to_string(),
                phone_hash: hash_phone("5730"),
                timestamp: now - Duration::minutes(5),
                stage: TraceStage::Policy,
                decision: TraceDecision::Skip,
                reason_code: ReasonCode::PolicyOptOut,
                reason_detail: None,
                next_eligible_at: None,
                correlation_id: "corr-2".to_string(),
            })
            .await
            .expect("seed trace");
        let session = SessionPolicyState::new(now - Duration::days(1));

        let first = explain_gate(&gate(), &store, "5730", &session, now).await;
        let second = explain_gate(&gate(), &store, "5730", &session, now).await;
        assert!(first.latest_blocking_trace.is_some());
        assert_eq!(first, second);
    }
}

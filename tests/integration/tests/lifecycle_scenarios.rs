use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use courier_core::hash_phone;
use courier_lifecycle::{
    compute_dedupe_key, evaluate_outbound_gate, reschedule_jitter, DedupeEngine, DedupeInput,
    GateContext, InboundMessage, LifecycleConfig, LifecyclePipeline, OutboundMessageType,
    OutboundRequest, TraceInvariantMode,
};
use courier_store::{DedupeRepository, InMemoryLifecycleStore, SqliteLifecycleStore};
use courier_types::{LifecycleState, ReasonCode, SessionPolicyState, TraceDecision, TraceStage};
use tempfile::tempdir;

const PHONE: &str = "573001234567@s.whatsapp.net";

fn strict_config() -> LifecycleConfig {
    LifecycleConfig {
        trace_invariant_mode: TraceInvariantMode::Strict,
        ..LifecycleConfig::default()
    }
}

fn inbound(message_id: &str, input: DedupeInput) -> InboundMessage {
    InboundMessage {
        message_id: message_id.to_string(),
        phone: PHONE.to_string(),
        dedupe: input,
        correlation_id: None,
        session_id: None,
    }
}

fn text_input(provider_message_id: &str, text: &str) -> DedupeInput {
    DedupeInput {
        provider_message_id: Some(provider_message_id.to_string()),
        remote_conversation_id: "c1".to_string(),
        provider_timestamp: Some(1_773_100_800),
        text_content: Some(text.to_string()),
    }
}

#[tokio::test]
async fn integration_marked_message_is_processed_and_other_ids_are_not() {
    let engine = DedupeEngine::new(Duration::minutes(5), None);
    let m1 = compute_dedupe_key(&DedupeInput::native("m1", "c1"));
    let m2 = compute_dedupe_key(&DedupeInput::native("m2", "c1"));

    engine.mark_as_processed(&m1);

    assert!(engine.is_processed(&m1).await);
    assert!(!engine.is_processed(&m2).await);
}

#[test]
fn integration_gate_at_three_am_defers_to_window_open_not_cooldown_end() {
    let policy = strict_config().gate_policy().expect("policy");
    let now = Utc
        .with_ymd_and_hms(2026, 3, 10, 3, 0, 0)
        .single()
        .expect("valid time");
    let mut session = SessionPolicyState::new(now - Duration::days(1));
    session.last_follow_up = Some(now - Duration::hours(2));
    let phone_hash = hash_phone(PHONE);

    let decision = evaluate_outbound_gate(
        &session,
        &GateContext {
            message_type: OutboundMessageType::FollowUp,
            now,
            phone_hash: phone_hash.clone(),
        },
        &policy,
    );

    assert!(!decision.allowed);
    assert!(decision.blocked_by.contains(&ReasonCode::PolicyOutsideHours));
    assert!(decision.blocked_by.contains(&ReasonCode::PolicyCooldown));
    let window_open = Utc
        .with_ymd_and_hms(2026, 3, 10, 9, 0, 0)
        .single()
        .expect("valid time");
    let jitter = reschedule_jitter(&phone_hash, now, policy.reschedule_jitter_max_seconds);
    assert_eq!(decision.next_eligible_at, Some(window_open + jitter));
    assert!(jitter <= Duration::seconds(300));
}

#[tokio::test]
async fn integration_full_inbound_run_feeds_the_funnel() {
    let store = Arc::new(InMemoryLifecycleStore::new());
    let pipeline = LifecyclePipeline::new(strict_config(), store).expect("pipeline");

    let decision = pipeline
        .begin_inbound(inbound("m3", DedupeInput::native("wamid-m3", "c1")))
        .await
        .expect("begin");
    assert!(decision.should_process());
    pipeline.mark_processing("m3").await;
    pipeline
        .complete_responded("m3", TraceStage::Send, None)
        .await
        .expect("responded");

    let stats = pipeline.funnel_stats(60).await.expect("funnel");
    assert_eq!(stats.received, 1);
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.responded, 1);
    assert!(stats.avg_processing_time_ms.is_some());
}

#[tokio::test]
async fn integration_deduped_message_has_exactly_one_skip_trace() {
    let store = Arc::new(InMemoryLifecycleStore::new());
    let pipeline = LifecyclePipeline::new(strict_config(), store).expect("pipeline");
    pipeline
        .begin_inbound(inbound("m4-original", DedupeInput::native("wamid-m4", "c1")))
        .await
        .expect("original");
    let decision = pipeline
        .begin_inbound(inbound("m4", DedupeInput::native("wamid-m4", "c1")))
        .await
        .expect("redelivery");
    assert!(!decision.should_process());

    let journey = pipeline
        .message_journey("m4")
        .await
        .expect("journey")
        .expect("events recorded");
    let states: Vec<LifecycleState> = journey.events.iter().map(|event| event.state).collect();
    assert_eq!(states, vec![LifecycleState::Received, LifecycleState::Skipped]);

    let traces = pipeline.traces_for_message("m4").await.expect("traces");
    let skips: Vec<_> = traces
        .iter()
        .filter(|trace| trace.decision == TraceDecision::Skip)
        .collect();
    assert_eq!(skips.len(), 1);
    assert_eq!(skips[0].reason_code, ReasonCode::Deduped);
}

#[tokio::test]
async fn integration_provider_id_wins_over_text_noise() {
    let store = Arc::new(InMemoryLifecycleStore::new());
    let pipeline = LifecyclePipeline::new(strict_config(), store).expect("pipeline");

    let first = pipeline
        .begin_inbound(inbound("m5-a", text_input("wamid-5", "Hola, quiero pedir")))
        .await
        .expect("first");
    let noisy_redelivery = pipeline
        .begin_inbound(inbound(
            "m5-b",
            text_input("wamid-5", "  hola,   QUIERO pedir \n"),
        ))
        .await
        .expect("redelivery");
    let different_id = pipeline
        .begin_inbound(inbound("m5-c", text_input("wamid-6", "Hola, quiero pedir")))
        .await
        .expect("different provider id");

    assert!(first.should_process());
    assert!(!noisy_redelivery.should_process());
    assert!(different_id.should_process());
    assert_eq!(pipeline.dedupe_metrics().duplicates_found, 1);
}

#[tokio::test]
async fn integration_dedupe_survives_restart_through_sqlite() {
    let temp = tempdir().expect("tempdir");
    let db = temp.path().join("lifecycle.sqlite");
    let input = DedupeInput::native("wamid-restart", "c1");
    let key = compute_dedupe_key(&input);

    {
        let store = Arc::new(SqliteLifecycleStore::new(&db).expect("open store"));
        let pipeline =
            LifecyclePipeline::new(strict_config(), store.clone()).expect("pipeline");
        pipeline
            .begin_inbound(inbound("before-restart", input.clone()))
            .await
            .expect("first delivery");
        let mut persisted = false;
        for _ in 0..100 {
            if store
                .find_dedupe_key(&key.key, Utc::now())
                .await
                .expect("lookup")
                .is_some()
            {
                persisted = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(persisted, "dedupe key should reach sqlite");
        pipeline.flush().await;
    }

    let store = Arc::new(SqliteLifecycleStore::new(&db).expect("reopen store"));
    let pipeline = LifecyclePipeline::new(strict_config(), store).expect("pipeline");
    let decision = pipeline
        .begin_inbound(inbound("after-restart", input))
        .await
        .expect("redelivery after restart");
    assert!(!decision.should_process());

    let traces = pipeline
        .traces_for_message("before-restart")
        .await
        .expect("traces survive restart");
    assert_eq!(traces.len(), 2);
}

#[tokio::test]
async fn integration_outbound_trace_explains_the_block_later() {
    let store = Arc::new(InMemoryLifecycleStore::new());
    let pipeline = LifecyclePipeline::new(strict_config(), store).expect("pipeline");
    let now = Utc
        .with_ymd_and_hms(2026, 3, 10, 12, 0, 0)
        .single()
        .expect("valid time");
    let mut session = SessionPolicyState::new(now - Duration::days(3));
    session.follow_up_attempts = 3;

    let decision = pipeline
        .evaluate_outbound(OutboundRequest {
            message_id: "followup-9".to_string(),
            phone: PHONE.to_string(),
            session: session.clone(),
            message_type: OutboundMessageType::FollowUp,
            now,
        })
        .await
        .expect("evaluate");
    assert_eq!(decision.blocked_by, vec![ReasonCode::PolicyMaxAttempts]);
    assert_eq!(decision.next_eligible_at, None);

    let transactional = pipeline
        .evaluate_outbound(OutboundRequest {
            message_id: "receipt-1".to_string(),
            phone: PHONE.to_string(),
            session: session.clone(),
            message_type: OutboundMessageType::Transactional,
            now,
        })
        .await
        .expect("evaluate transactional");
    assert!(transactional.allowed);

    let explanation = pipeline.explain_gate(PHONE, &session, now).await;
    assert_eq!(explanation.attempts_remaining, 0);
    let latest = explanation
        .latest_blocking_trace
        .expect("blocking trace recorded");
    assert_eq!(latest.message_id, "followup-9");
    assert_eq!(latest.decision, TraceDecision::Skip);
    assert_eq!(latest.reason_code, ReasonCode::PolicyMaxAttempts);
}

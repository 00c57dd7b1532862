use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use courier_lifecycle::{
    compute_dedupe_key, evaluate_outbound_gate, reschedule_jitter, DecisionTraceLedger,
    DedupeInput, GateContext, LifecycleConfig, OutboundMessageType, PersistenceWriter,
    TelemetryStateMachine, TraceInvariantMode,
};
use courier_store::InMemoryLifecycleStore;
use courier_types::{
    ContactStatus, ErrorType, FunnelStats, LifecycleState, ReasonCode, SessionPolicyState,
    SkipReason, TelemetryEvent, TraceDecision,
};
use proptest::prelude::*;

fn fallback_input(text: &str) -> DedupeInput {
    DedupeInput {
        provider_message_id: None,
        remote_conversation_id: "c1".to_string(),
        provider_timestamp: Some(1_773_100_800),
        text_content: Some(text.to_string()),
    }
}

fn noisy(words: &[String], gaps: &[String], upper: &[bool]) -> String {
    let mut out = gaps.first().cloned().unwrap_or_default();
    for (index, word) in words.iter().enumerate() {
        if upper.get(index).copied().unwrap_or(false) {
            out.push_str(&word.to_uppercase());
        } else {
            out.push_str(word);
        }
        out.push_str(gaps.get(index + 1).map(String::as_str).unwrap_or(" "));
    }
    out
}

fn day_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0)
        .single()
        .expect("valid time")
}

fn session_strategy() -> impl Strategy<Value = SessionPolicyState> {
    (
        prop_oneof![
            Just(ContactStatus::Active),
            Just(ContactStatus::OptOut),
            Just(ContactStatus::Blacklisted),
            Just(ContactStatus::Closed),
        ],
        proptest::option::of(0i64..(48 * 60)),
        0u32..5,
        0u32..3,
    )
        .prop_map(|(status, follow_up_minutes_ago, attempts, count_24h)| {
            let now = day_start() + Duration::hours(12);
            let mut session = SessionPolicyState::new(now - Duration::days(2));
            session.contact_status = status;
            session.last_follow_up =
                follow_up_minutes_ago.map(|minutes| now - Duration::minutes(minutes));
            session.follow_up_attempts = attempts;
            session.follow_up_count_24h = count_24h;
            session
        })
}

proptest! {
    #[test]
    fn property_fallback_key_ignores_whitespace_and_case(
        words in proptest::collection::vec("[a-z0-9áéñ]{1,8}", 1..8),
        gaps in proptest::collection::vec("[ \t\n]{1,3}", 9),
        upper in proptest::collection::vec(any::<bool>(), 8),
    ) {
        let canonical = words.join(" ");
        let canonical_key = compute_dedupe_key(&fallback_input(&canonical));
        let noisy_key = compute_dedupe_key(&fallback_input(&noisy(&words, &gaps, &upper)));
        prop_assert_eq!(canonical_key, noisy_key);
    }

    #[test]
    fn property_distinct_provider_ids_never_collide(
        first in "[A-Za-z0-9]{4,16}",
        second in "[A-Za-z0-9]{4,16}",
        text in ".{0,40}",
    ) {
        prop_assume!(first != second);
        let mut left = fallback_input(&text);
        left.provider_message_id = Some(first);
        let mut right = fallback_input(&text);
        right.provider_message_id = Some(second);
        prop_assert_ne!(compute_dedupe_key(&left), compute_dedupe_key(&right));
    }

    #[test]
    fn property_window_and_cooldown_defer_to_the_later_clear_time(
        now_minutes in 0i64..(9 * 60),
        follow_up_minutes_ago in 0i64..360,
        phone_hash in "[0-9a-f]{16}",
    ) {
        let policy = LifecycleConfig::default().gate_policy().expect("policy");
        let now = day_start() + Duration::minutes(now_minutes);
        let last_follow_up = now - Duration::minutes(follow_up_minutes_ago);
        let mut session = SessionPolicyState::new(now - Duration::days(1));
        session.last_follow_up = Some(last_follow_up);

        let decision = evaluate_outbound_gate(
            &session,
            &GateContext {
                message_type: OutboundMessageType::FollowUp,
                now,
                phone_hash: phone_hash.clone(),
            },
            &policy,
        );

        prop_assert!(decision.blocked_by.contains(&ReasonCode::PolicyOutsideHours));
        let window_open = day_start() + Duration::hours(9);
        let cooldown_end = last_follow_up + Duration::hours(6);
        let cooling = cooldown_end > now;
        prop_assert_eq!(decision.blocked_by.contains(&ReasonCode::PolicyCooldown), cooling);
        let latest = if cooling { window_open.max(cooldown_end) } else { window_open };
        let jitter = reschedule_jitter(&phone_hash, now, policy.reschedule_jitter_max_seconds);
        prop_assert_eq!(decision.next_eligible_at, Some(latest + jitter));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn property_blocking_traces_always_carry_reason_and_future_retry(
        session in session_strategy(),
        message_type in prop_oneof![
            Just(OutboundMessageType::FollowUp),
            Just(OutboundMessageType::Transactional),
        ],
    ) {
        let runtime = tokio::runtime::Runtime::new().expect("runtime");
        let _entered = runtime.enter();
        let store = Arc::new(InMemoryLifecycleStore::new());
        let writer = PersistenceWriter::spawn(store.clone(), store.clone());
        let ledger = DecisionTraceLedger::new(writer, store, TraceInvariantMode::Strict, 500);
        let policy = LifecycleConfig::default().gate_policy().expect("policy");
        let now = day_start() + Duration::hours(12);

        let decision = evaluate_outbound_gate(
            &session,
            &GateContext { message_type, now, phone_hash: "abc".to_string() },
            &policy,
        );
        let trace = if decision.allowed {
            ledger.policy_allowed("out", "abc", now)
        } else {
            ledger.policy_blocked("out", "abc", &decision)
        }
        .expect("gate decisions always satisfy the trace invariants");

        if trace.decision == TraceDecision::Defer {
            let next = trace.next_eligible_at.expect("defer carries a retry time");
            prop_assert!(next > trace.timestamp);
        }
        if trace.decision != TraceDecision::Respond {
            prop_assert_ne!(trace.reason_code, ReasonCode::Unknown);
            prop_assert!(decision.blocked_by.contains(&trace.reason_code));
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Queued,
    Processing,
    Responded,
    Skipped,
    Errored,
}

const STEPS: [Step; 5] = [
    Step::Queued,
    Step::Processing,
    Step::Responded,
    Step::Skipped,
    Step::Errored,
];

#[tokio::test]
async fn property_every_message_has_at_most_one_terminal_event() {
    let store = Arc::new(InMemoryLifecycleStore::new());
    let writer = PersistenceWriter::spawn(store.clone(), store.clone());
    let telemetry =
        TelemetryStateMachine::new(writer.clone(), store.clone(), Duration::minutes(5), 10_000, 500);

    let mut scripts = Vec::new();
    for first in STEPS {
        for second in STEPS {
            for third in STEPS {
                scripts.push([first, second, third]);
            }
        }
    }

    for (index, script) in scripts.iter().enumerate() {
        let message_id = format!("m{index}");
        telemetry
            .record_received(&message_id, "573001234567")
            .expect("received");
        for step in script {
            let _ = match step {
                Step::Queued => telemetry.record_queued(&message_id),
                Step::Processing => telemetry.record_processing(&message_id),
                Step::Responded => telemetry.record_responded(&message_id, None, None),
                Step::Skipped => {
                    telemetry.record_skipped(&message_id, SkipReason::NoRoute, None)
                }
                Step::Errored => {
                    telemetry.record_error(&message_id, ErrorType::FlowError, None)
                }
            };
        }
    }
    writer.flush().await;

    for index in 0..scripts.len() {
        let events = telemetry
            .events_by_message_id(&format!("m{index}"))
            .await
            .expect("events");
        let terminal = events
            .iter()
            .filter(|event| event.state.is_terminal())
            .count();
        assert!(terminal <= 1, "script {:?} produced {terminal} terminal events", scripts[index]);
        assert_eq!(events[0].state, LifecycleState::Received);
    }
}

fn responded_event(index: usize, processing_time_ms: Option<u64>) -> TelemetryEvent {
    TelemetryEvent {
        event_id: format!("e{index}"),
        message_id: format!("m{index}"),
        phone_hash: "abc".to_string(),
        timestamp: day_start() + Duration::minutes(index as i64),
        state: LifecycleState::Responded,
        previous_state: Some(LifecycleState::Processing),
        skip_reason: None,
        error_type: None,
        processing_time_ms,
        stage: None,
        correlation_id: None,
        detail: None,
    }
}

proptest! {
    #[test]
    fn property_funnel_average_is_null_only_without_timed_responses(
        timings in proptest::collection::vec(proptest::option::of(0u64..5), 0..12),
    ) {
        let events: Vec<TelemetryEvent> = timings
            .iter()
            .enumerate()
            .map(|(index, timing)| responded_event(index, *timing))
            .collect();
        let stats = FunnelStats::from_events(60 * 24, day_start(), events.iter());
        let timed = timings.iter().filter(|timing| timing.is_some()).count() as u64;

        prop_assert_eq!(stats.avg_processing_time_ms.is_some(), timed > 0);
        prop_assert_eq!(stats.data_quality.timed_samples, timed);
        prop_assert_eq!(stats.data_quality.near_zero_latency_samples, timed);
        prop_assert_eq!(stats.data_quality.suspicious_zero_latency, timed > 0);
        prop_assert_eq!(
            stats.data_quality.untimed_terminal_events,
            timings.len() as u64 - timed
        );
    }
}

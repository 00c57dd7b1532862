use std::fmt::Write as _;

use courier_types::{DecisionTrace, FunnelStats, MessageJourney, TelemetryEvent};

pub(crate) fn render_funnel(stats: &FunnelStats) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "funnel over the last {} minutes (since {})",
        stats.window_minutes,
        stats.since.to_rfc3339()
    );
    let _ = writeln!(
        out,
        "received={} queued={} processing={} responded={} skipped={} errored={} (terminal={})",
        stats.received,
        stats.queued,
        stats.processing,
        stats.responded,
        stats.skipped,
        stats.errored,
        stats.terminal_total()
    );
    match stats.avg_processing_time_ms {
        Some(avg) => {
            let _ = writeln!(out, "avg processing time: {avg:.1} ms");
        }
        None => {
            let _ = writeln!(out, "avg processing time: n/a (no timed responses)");
        }
    }
    for (state, avg) in &stats.avg_processing_time_by_state {
        let _ = writeln!(out, "  {state}: {avg:.1} ms");
    }
    for (reason, count) in &stats.skip_reasons {
        let _ = writeln!(out, "skip {reason}: {count}");
    }
    for (error_type, count) in &stats.error_types {
        let _ = writeln!(out, "error {error_type}: {count}");
    }
    let quality = &stats.data_quality;
    let _ = writeln!(
        out,
        "data quality: timed={} untimed_terminal={} near_zero={}",
        quality.timed_samples, quality.untimed_terminal_events, quality.near_zero_latency_samples
    );
    if quality.suspicious_zero_latency {
        let _ = writeln!(
            out,
            "warning: every timed response is near zero latency; timing is probably not instrumented"
        );
    }
    out
}

fn render_event_line(out: &mut String, event: &TelemetryEvent) {
    let _ = write!(
        out,
        "{} {} {}",
        event.timestamp.to_rfc3339(),
        event.message_id,
        event.state.as_str()
    );
    if let Some(previous) = event.previous_state {
        let _ = write!(out, " from={}", previous.as_str());
    }
    if let Some(reason) = event.skip_reason {
        let _ = write!(out, " skip_reason={}", reason.as_str());
    }
    if let Some(error_type) = event.error_type {
        let _ = write!(out, " error_type={}", error_type.as_str());
    }
    if let Some(elapsed) = event.processing_time_ms {
        let _ = write!(out, " took={elapsed}ms");
    }
    if let Some(stage) = &event.stage {
        let _ = write!(out, " stage={stage}");
    }
    if let Some(detail) = &event.detail {
        let _ = write!(out, " detail=\"{detail}\"");
    }
    let _ = writeln!(out);
}

pub(crate) fn render_events(events: &[TelemetryEvent]) -> String {
    if events.is_empty() {
        return "no telemetry events\n".to_string();
    }
    let mut out = String::new();
    for event in events {
        render_event_line(&mut out, event);
    }
    out
}

pub(crate) fn render_journey(journey: &MessageJourney) -> String {
    let mut out = String::new();
    let duration = journey
        .total_duration_ms
        .map(|ms| format!("{ms}ms"))
        .unwrap_or_else(|| "incomplete".to_string());
    let _ = writeln!(
        out,
        "message {} ({}) final={} duration={duration}",
        journey.message_id,
        journey.phone_hash,
        journey.final_state.as_str()
    );
    for event in &journey.events {
        out.push_str("  ");
        render_event_line(&mut out, event);
    }
    out
}

pub(crate) fn render_journeys(journeys: &[MessageJourney]) -> String {
    if journeys.is_empty() {
        return "no journeys\n".to_string();
    }
    journeys.iter().map(render_journey).collect()
}

pub(crate) fn render_traces(traces: &[DecisionTrace]) -> String {
    if traces.is_empty() {
        return "no decision traces\n".to_string();
    }
    let mut out = String::new();
    for trace in traces {
        let _ = write!(
            out,
            "{} {} {} {}",
            trace.timestamp.to_rfc3339(),
            trace.stage.as_str(),
            trace.decision.as_str(),
            trace.reason_code.as_str()
        );
        if let Some(next) = trace.next_eligible_at {
            let _ = write!(out, " next_eligible_at={}", next.to_rfc3339());
        }
        if let Some(detail) = &trace.reason_detail {
            let _ = write!(out, " detail=\"{detail}\"");
        }
        let _ = writeln!(out, " correlation_id={}", trace.correlation_id);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{render_funnel, render_traces};
    use chrono::{TimeZone, Utc};
    use courier_types::{
        DecisionTrace, FunnelStats, LifecycleState, ReasonCode, TelemetryEvent, TraceDecision,
        TraceStage,
    };

    #[test]
    fn unit_funnel_without_timed_samples_reports_not_available() {
        let since = Utc
            .with_ymd_and_hms(2026, 3, 10, 12, 0, 0)
            .single()
            .expect("valid time");
        let event = TelemetryEvent {
            event_id: "e1".to_string(),
            message_id: "m1".to_string(),
            phone_hash: "abc".to_string(),
            timestamp: since,
            state: LifecycleState::Received,
            previous_state: None,
            skip_reason: None,
            error_type: None,
            processing_time_ms: None,
            stage: None,
            correlation_id: None,
            detail: None,
        };
        let stats = FunnelStats::from_events(60, since, [&event]);
        let rendered = render_funnel(&stats);
        assert!(rendered.contains("received=1"));
        assert!(rendered.contains("n/a"));
    }

    #[test]
    fn unit_traces_render_next_eligible_time() {
        let at = Utc
            .with_ymd_and_hms(2026, 3, 10, 3, 0, 0)
            .single()
            .expect("valid time");
        let trace = DecisionTrace {
            trace_id: "t1".to_string(),
            message_id: "out-1".to_string(),
            phone_hash: "abc".to_string(),
            timestamp: at,
            stage: TraceStage::Policy,
            decision: TraceDecision::Defer,
            reason_code: ReasonCode::PolicyOutsideHours,
            reason_detail: Some("blocked_by=POLICY_OUTSIDE_HOURS".to_string()),
            next_eligible_at: Some(at + chrono::Duration::hours(6)),
            correlation_id: "corr-1".to_string(),
        };
        let rendered = render_traces(&[trace]);
        assert!(rendered.contains("DEFER POLICY_OUTSIDE_HOURS"));
        assert!(rendered.contains("next_eligible_at=2026-03-10T09:00:00+00:00"));
        assert_eq!(render_traces(&[]), "no decision traces\n");
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::trace::ReasonCode;

/// Error returned when a lifecycle transition is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusTransitionError {
    #[error("invalid {kind} transition: {from:?} -> {to:?}")]
    Invalid {
        kind: &'static str,
        from: String,
        to: String,
    },
}

/// Lifecycle state for an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Received,
    Queued,
    Processing,
    Responded,
    Skipped,
    Error,
}

impl LifecycleState {
    pub const ALL: [Self; 6] = [
        Self::Received,
        Self::Queued,
        Self::Processing,
        Self::Responded,
        Self::Skipped,
        Self::Error,
    ];

    /// Returns the stable wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::Queued => "QUEUED",
            Self::Processing => "PROCESSING",
            Self::Responded => "RESPONDED",
            Self::Skipped => "SKIPPED",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(raw.trim()))
    }

    /// Returns true when no further transition is expected.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Responded | Self::Skipped | Self::Error)
    }

    /// Returns true when this state can transition to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Received, Self::Queued)
                | (Self::Received, Self::Processing)
                | (Self::Received, Self::Skipped)
                | (Self::Received, Self::Error)
                | (Self::Queued, Self::Processing)
                | (Self::Processing, Self::Responded)
                | (Self::Processing, Self::Skipped)
                | (Self::Processing, Self::Error)
        )
    }

    /// Returns an error if transitioning to `next` is not allowed.
    pub fn ensure_transition(self, next: Self) -> Result<(), StatusTransitionError> {
        if self.can_transition_to(next) {
            return Ok(());
        }

        Err(StatusTransitionError::Invalid {
            kind: "lifecycle_state",
            from: format!("{self:?}"),
            to: format!("{next:?}"),
        })
    }
}

/// Why a message was skipped without a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    Deduped,
    EmptyMessage,
    BlockedUser,
    PolicyBlocked,
    NoRoute,
    ContextBlocked,
}

impl SkipReason {
    pub const ALL: [Self; 6] = [
        Self::Deduped,
        Self::EmptyMessage,
        Self::BlockedUser,
        Self::PolicyBlocked,
        Self::NoRoute,
        Self::ContextBlocked,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deduped => "DEDUPED",
            Self::EmptyMessage => "EMPTY_MESSAGE",
            Self::BlockedUser => "BLOCKED_USER",
            Self::PolicyBlocked => "POLICY_BLOCKED",
            Self::NoRoute => "NO_ROUTE",
            Self::ContextBlocked => "CONTEXT_BLOCKED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|reason| reason.as_str().eq_ignore_ascii_case(raw.trim()))
    }

    /// Maps the skip reason onto the decision-trace reason code.
    pub fn reason_code(self) -> ReasonCode {
        match self {
            Self::Deduped => ReasonCode::Deduped,
            Self::EmptyMessage => ReasonCode::EmptyMessage,
            Self::BlockedUser => ReasonCode::BlockedUser,
            Self::PolicyBlocked => ReasonCode::PolicyBlocked,
            Self::NoRoute => ReasonCode::NoRoute,
            Self::ContextBlocked => ReasonCode::ContextBlocked,
        }
    }
}

/// Classification of a processing failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    AiError,
    AiTimeout,
    FlowError,
    ProviderSendFail,
    ProviderTimeout,
    CriticalError,
}

impl ErrorType {
    pub const ALL: [Self; 6] = [
        Self::AiError,
        Self::AiTimeout,
        Self::FlowError,
        Self::ProviderSendFail,
        Self::ProviderTimeout,
        Self::CriticalError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AiError => "AI_ERROR",
            Self::AiTimeout => "AI_TIMEOUT",
            Self::FlowError => "FLOW_ERROR",
            Self::ProviderSendFail => "PROVIDER_SEND_FAIL",
            Self::ProviderTimeout => "PROVIDER_TIMEOUT",
            Self::CriticalError => "CRITICAL_ERROR",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(raw.trim()))
    }

    pub fn reason_code(self) -> ReasonCode {
        match self {
            Self::AiError => ReasonCode::AiError,
            Self::AiTimeout => ReasonCode::AiTimeout,
            Self::FlowError => ReasonCode::FlowError,
            Self::ProviderSendFail => ReasonCode::ProviderSendFail,
            Self::ProviderTimeout => ReasonCode::ProviderTimeout,
            Self::CriticalError => ReasonCode::CriticalError,
        }
    }
}

/// One immutable record per lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_id: String,
    pub message_id: String,
    pub phone_hash: String,
    pub timestamp: DateTime<Utc>,
    pub state: LifecycleState,
    #[serde(default)]
    pub previous_state: Option<LifecycleState>,
    #[serde(default)]
    pub skip_reason: Option<SkipReason>,
    #[serde(default)]
    pub error_type: Option<ErrorType>,
    #[serde(default)]
    pub processing_time_ms: Option<u64>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Ordered view of every telemetry event sharing a message id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageJourney {
    pub message_id: String,
    pub phone_hash: String,
    pub events: Vec<TelemetryEvent>,
    pub final_state: LifecycleState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_duration_ms: Option<u64>,
}

impl MessageJourney {
    /// Builds a journey from the events of one message. Returns `None` when empty.
    pub fn from_events(mut events: Vec<TelemetryEvent>) -> Option<Self> {
        events.sort_by(|left, right| {
            left.timestamp
                .cmp(&right.timestamp)
                .then_with(|| left.state.cmp(&right.state))
        });
        let first = events.first()?;
        let last = events.last()?;
        let message_id = first.message_id.clone();
        let phone_hash = first.phone_hash.clone();
        let started_at = first.timestamp;
        let final_state = last.state;
        let completed_at = events
            .iter()
            .find(|event| event.state.is_terminal())
            .map(|event| event.timestamp);
        let total_duration_ms = completed_at.and_then(|completed| {
            u64::try_from(completed.signed_duration_since(started_at).num_milliseconds()).ok()
        });
        Some(Self {
            message_id,
            phone_hash,
            events,
            final_state,
            started_at,
            completed_at,
            total_duration_ms,
        })
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::{LifecycleState, MessageJourney, SkipReason, TelemetryEvent};
    use crate::ReasonCode;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
            .single()
            .expect("base time")
    }

    fn event(state: LifecycleState, offset_ms: i64) -> TelemetryEvent {
        TelemetryEvent {
            event_id: format!("evt-{}", state.as_str()),
            message_id: "m-1".to_string(),
            phone_hash: "abcd".to_string(),
            timestamp: base_time() + Duration::milliseconds(offset_ms),
            state,
            previous_state: None,
            skip_reason: None,
            error_type: None,
            processing_time_ms: None,
            stage: None,
            correlation_id: None,
            detail: None,
        }
    }

    #[test]
    fn unit_lifecycle_transitions_follow_declared_graph() {
        assert!(LifecycleState::Received.can_transition_to(LifecycleState::Queued));
        assert!(LifecycleState::Received.can_transition_to(LifecycleState::Skipped));
        assert!(LifecycleState::Queued.can_transition_to(LifecycleState::Processing));
        assert!(LifecycleState::Processing.can_transition_to(LifecycleState::Responded));
        assert!(!LifecycleState::Received.can_transition_to(LifecycleState::Responded));
        assert!(!LifecycleState::Responded.can_transition_to(LifecycleState::Error));
        assert!(!LifecycleState::Processing.can_transition_to(LifecycleState::Queued));
        let error = LifecycleState::Skipped
            .ensure_transition(LifecycleState::Processing)
            .expect_err("terminal state must not move");
        assert!(error.to_string().contains("lifecycle_state"));
    }

    #[test]
    fn unit_wire_names_round_trip_through_parse() {
        for state in LifecycleState::ALL {
            assert_eq!(LifecycleState::parse(state.as_str()), Some(state));
        }
        assert_eq!(SkipReason::parse("deduped"), Some(SkipReason::Deduped));
        assert_eq!(SkipReason::Deduped.reason_code(), ReasonCode::Deduped);
        let encoded = serde_json::to_string(&LifecycleState::Responded).expect("encode");
        assert_eq!(encoded, "\"RESPONDED\"");
    }

    #[test]
    fn functional_journey_orders_events_and_computes_duration() {
        let journey = MessageJourney::from_events(vec![
            event(LifecycleState::Responded, 250),
            event(LifecycleState::Received, 0),
            event(LifecycleState::Processing, 100),
        ])
        .expect("journey");
        assert_eq!(journey.events[0].state, LifecycleState::Received);
        assert_eq!(journey.final_state, LifecycleState::Responded);
        assert!(journey.is_complete());
        assert_eq!(journey.total_duration_ms, Some(250));
    }

    #[test]
    fn regression_journey_without_terminal_event_has_no_duration() {
        let journey = MessageJourney::from_events(vec![event(LifecycleState::Received, 0)])
            .expect("journey");
        assert!(!journey.is_complete());
        assert_eq!(journey.total_duration_ms, None);
        assert!(MessageJourney::from_events(Vec::new()).is_none());
    }
}

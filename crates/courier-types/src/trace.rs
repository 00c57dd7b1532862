use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pipeline stage that produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceStage {
    InboundReceived,
    Dedupe,
    Policy,
    Flow,
    Ai,
    Send,
}

impl TraceStage {
    pub const ALL: [Self; 6] = [
        Self::InboundReceived,
        Self::Dedupe,
        Self::Policy,
        Self::Flow,
        Self::Ai,
        Self::Send,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InboundReceived => "INBOUND_RECEIVED",
            Self::Dedupe => "DEDUPE",
            Self::Policy => "POLICY",
            Self::Flow => "FLOW",
            Self::Ai => "AI",
            Self::Send => "SEND",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(raw.trim()))
    }
}

/// Outcome recorded by a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceDecision {
    Respond,
    Skip,
    Defer,
    Error,
}

impl TraceDecision {
    pub const ALL: [Self; 4] = [Self::Respond, Self::Skip, Self::Defer, Self::Error];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Respond => "RESPOND",
            Self::Skip => "SKIP",
            Self::Defer => "DEFER",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|decision| decision.as_str().eq_ignore_ascii_case(raw.trim()))
    }

    /// Returns true for decisions that stop a message from reaching the user.
    pub fn is_blocking(self) -> bool {
        !matches!(self, Self::Respond)
    }
}

/// Closed set of reasons attached to every decision trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    Received,
    NewMessage,
    PolicyAllowed,
    Success,
    Deduped,
    EmptyMessage,
    BlockedUser,
    PolicyBlocked,
    PolicyOptOut,
    PolicyBlacklisted,
    PolicyUserClosed,
    PolicyCooldown,
    PolicyOutsideHours,
    PolicyRateLimited,
    PolicyMaxAttempts,
    NoRoute,
    ContextBlocked,
    AiError,
    AiTimeout,
    FlowError,
    ProviderSendFail,
    ProviderTimeout,
    CriticalError,
    Unknown,
}

impl ReasonCode {
    pub const ALL: [Self; 24] = [
        Self::Received,
        Self::NewMessage,
        Self::PolicyAllowed,
        Self::Success,
        Self::Deduped,
        Self::EmptyMessage,
        Self::BlockedUser,
        Self::PolicyBlocked,
        Self::PolicyOptOut,
        Self::PolicyBlacklisted,
        Self::PolicyUserClosed,
        Self::PolicyCooldown,
        Self::PolicyOutsideHours,
        Self::PolicyRateLimited,
        Self::PolicyMaxAttempts,
        Self::NoRoute,
        Self::ContextBlocked,
        Self::AiError,
        Self::AiTimeout,
        Self::FlowError,
        Self::ProviderSendFail,
        Self::ProviderTimeout,
        Self::CriticalError,
        Self::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::NewMessage => "NEW_MESSAGE",
            Self::PolicyAllowed => "POLICY_ALLOWED",
            Self::Success => "SUCCESS",
            Self::Deduped => "DEDUPED",
            Self::EmptyMessage => "EMPTY_MESSAGE",
            Self::BlockedUser => "BLOCKED_USER",
            Self::PolicyBlocked => "POLICY_BLOCKED",
            Self::PolicyOptOut => "POLICY_OPT_OUT",
            Self::PolicyBlacklisted => "POLICY_BLACKLISTED",
            Self::PolicyUserClosed => "POLICY_USER_CLOSED",
            Self::PolicyCooldown => "POLICY_COOLDOWN",
            Self::PolicyOutsideHours => "POLICY_OUTSIDE_HOURS",
            Self::PolicyRateLimited => "POLICY_RATE_LIMITED",
            Self::PolicyMaxAttempts => "POLICY_MAX_ATTEMPTS",
            Self::NoRoute => "NO_ROUTE",
            Self::ContextBlocked => "CONTEXT_BLOCKED",
            Self::AiError => "AI_ERROR",
            Self::AiTimeout => "AI_TIMEOUT",
            Self::FlowError => "FLOW_ERROR",
            Self::ProviderSendFail => "PROVIDER_SEND_FAIL",
            Self::ProviderTimeout => "PROVIDER_TIMEOUT",
            Self::CriticalError => "CRITICAL_ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|code| code.as_str().eq_ignore_ascii_case(raw.trim()))
    }

    /// Returns the operator-facing explanation for this reason.
    pub fn describe(self) -> &'static str {
        match self {
            Self::Received => "message received",
            Self::NewMessage => "message is new and was accepted for processing",
            Self::PolicyAllowed => "all outbound policies allowed the message",
            Self::Success => "message was handled successfully",
            Self::Deduped => "message was a duplicate delivery and was ignored",
            Self::EmptyMessage => "message had no usable content",
            Self::BlockedUser => "sender is blocked",
            Self::PolicyBlocked => "an inbound policy blocked the message",
            Self::PolicyOptOut => "contact opted out of proactive messages",
            Self::PolicyBlacklisted => "contact is blacklisted",
            Self::PolicyUserClosed => "contact closed the conversation after deciding",
            Self::PolicyCooldown => "cooldown since the last follow-up has not elapsed",
            Self::PolicyOutsideHours => "current time is outside the business-hours window",
            Self::PolicyRateLimited => "follow-up limit for the last 24 hours reached",
            Self::PolicyMaxAttempts => "maximum follow-up attempts reached",
            Self::NoRoute => "no flow matched the message",
            Self::ContextBlocked => "conversation context blocked automated handling",
            Self::AiError => "AI component failed",
            Self::AiTimeout => "AI component timed out",
            Self::FlowError => "conversation flow failed",
            Self::ProviderSendFail => "provider rejected the outbound send",
            Self::ProviderTimeout => "provider send timed out",
            Self::CriticalError => "unexpected critical failure",
            Self::Unknown => "reason was not recorded",
        }
    }
}

/// One immutable record per stage decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionTrace {
    pub trace_id: String,
    pub message_id: String,
    pub phone_hash: String,
    pub timestamp: DateTime<Utc>,
    pub stage: TraceStage,
    pub decision: TraceDecision,
    pub reason_code: ReasonCode,
    #[serde(default)]
    pub reason_detail: Option<String>,
    #[serde(default)]
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub correlation_id: String,
}

impl DecisionTrace {
    pub fn is_blocking(&self) -> bool {
        self.decision.is_blocking()
    }
}

#[cfg(test)]
mod tests {
    use super::{ReasonCode, TraceDecision, TraceStage};

    #[test]
    fn unit_reason_codes_round_trip_through_wire_names() {
        for code in ReasonCode::ALL {
            assert_eq!(ReasonCode::parse(code.as_str()), Some(code));
            let encoded = serde_json::to_string(&code).expect("encode");
            assert_eq!(encoded, format!("\"{}\"", code.as_str()));
        }
        assert_eq!(ReasonCode::parse("not-a-code"), None);
    }

    #[test]
    fn unit_only_respond_is_non_blocking() {
        assert!(!TraceDecision::Respond.is_blocking());
        assert!(TraceDecision::Skip.is_blocking());
        assert!(TraceDecision::Defer.is_blocking());
        assert!(TraceDecision::Error.is_blocking());
        assert_eq!(TraceStage::parse("inbound_received"), Some(TraceStage::InboundReceived));
    }
}

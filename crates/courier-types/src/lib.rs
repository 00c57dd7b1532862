//! Shared data types for the Courier message-lifecycle pipeline.

mod dedupe;
mod funnel;
mod lifecycle;
mod query;
mod session;
mod trace;

pub use dedupe::{DedupeKey, DedupeKeyType, DedupeRecord};
pub use funnel::{FunnelDataQuality, FunnelStats, FUNNEL_NEAR_ZERO_LATENCY_MS};
pub use lifecycle::{
    ErrorType, LifecycleState, MessageJourney, SkipReason, StatusTransitionError, TelemetryEvent,
};
pub use query::{Page, TelemetryFilter};
pub use session::{ContactStatus, SessionPolicyState, BLACKLIST_TAGS, DECISION_MADE_TAGS};
pub use trace::{DecisionTrace, ReasonCode, TraceDecision, TraceStage};

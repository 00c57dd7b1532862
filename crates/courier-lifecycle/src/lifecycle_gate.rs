//! Outbound gate evaluation for proactive messages.
//!
//! [`evaluate_outbound_gate`] is a pure function of the session state, the
//! evaluation context and the configured [`GatePolicy`]. Each policy
//! contributes at most one reason code. A policy that fails to evaluate is
//! treated as not blocking and reported in `evaluation_errors`.

use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use courier_types::{
    ContactStatus, ReasonCode, SessionPolicyState, BLACKLIST_TAGS, DECISION_MADE_TAGS,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const RATE_LIMIT_WINDOW_HOURS: i64 = 24;
const DST_GAP_SCAN_MINUTES: i64 = 3 * 60;

/// Parsed outbound policy settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatePolicy {
    pub window_start: NaiveTime,
    pub window_end: NaiveTime,
    pub timezone: Tz,
    pub cooldown: Duration,
    pub max_follow_up_attempts: u32,
    pub max_follow_ups_per_24h: u32,
    pub reschedule_jitter_max_seconds: u64,
}

/// Kind of proactive message being gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundMessageType {
    /// Sales follow-up; every policy applies.
    #[default]
    FollowUp,
    /// Order or account notice; only consent policies apply.
    Transactional,
}

impl OutboundMessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FollowUp => "follow_up",
            Self::Transactional => "transactional",
        }
    }

    fn is_engagement_limited(self) -> bool {
        matches!(self, Self::FollowUp)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateContext {
    pub message_type: OutboundMessageType,
    pub now: DateTime<Utc>,
    /// Seeds the reschedule jitter so retries spread across contacts.
    pub phone_hash: String,
}

/// Result of one gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub allowed: bool,
    pub blocked_by: Vec<ReasonCode>,
    /// Set only when every blocking policy is temporal.
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub evaluated_at: DateTime<Utc>,
    #[serde(default)]
    pub evaluation_errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PolicyBlock {
    reason: ReasonCode,
    /// `None` for blocks that never clear on their own.
    clears_at: Option<DateTime<Utc>>,
}

impl PolicyBlock {
    fn permanent(reason: ReasonCode) -> Self {
        Self {
            reason,
            clears_at: None,
        }
    }

    fn until(reason: ReasonCode, clears_at: DateTime<Utc>) -> Self {
        Self {
            reason,
            clears_at: Some(clears_at),
        }
    }
}

type PolicyResult = Result<Option<PolicyBlock>, String>;

pub fn evaluate_outbound_gate(
    session: &SessionPolicyState,
    context: &GateContext,
    policy: &GatePolicy,
) -> GateDecision {
    let now = context.now;
    let mut checks: Vec<(&'static str, PolicyResult)> = vec![
        ("opt_out", Ok(opt_out_block(session))),
        ("blacklist", Ok(blacklist_block(session))),
        ("user_closed", Ok(user_closed_block(session))),
    ];
    if context.message_type.is_engagement_limited() {
        checks.push(("max_attempts", Ok(max_attempts_block(session, policy))));
        checks.push(("cooldown", cooldown_block(session, policy, now)));
        checks.push(("business_hours", business_hours_block(policy, now)));
        checks.push(("rate_limit_24h", rate_limit_block(session, policy, now)));
    }

    let mut blocks = Vec::new();
    let mut evaluation_errors = Vec::new();
    for (name, result) in checks {
        match result {
            Ok(Some(block)) => blocks.push(block),
            Ok(None) => {}
            Err(error) => evaluation_errors.push(format!("{name}: {error}")),
        }
    }

    let blocked_by: Vec<ReasonCode> = blocks.iter().map(|block| block.reason).collect();
    let next_eligible_at = if blocks.is_empty() {
        None
    } else {
        blocks
            .iter()
            .map(|block| block.clears_at)
            .collect::<Option<Vec<_>>>()
            .and_then(|times| times.into_iter().max())
            .map(|latest| {
                latest
                    + reschedule_jitter(
                        &context.phone_hash,
                        now,
                        policy.reschedule_jitter_max_seconds,
                    )
            })
    };

    GateDecision {
        allowed: blocked_by.is_empty(),
        blocked_by,
        next_eligible_at,
        evaluated_at: now,
        evaluation_errors,
    }
}

fn opt_out_block(session: &SessionPolicyState) -> Option<PolicyBlock> {
    (session.contact_status == ContactStatus::OptOut)
        .then(|| PolicyBlock::permanent(ReasonCode::PolicyOptOut))
}

fn blacklist_block(session: &SessionPolicyState) -> Option<PolicyBlock> {
    (session.contact_status == ContactStatus::Blacklisted || session.has_any_tag(&BLACKLIST_TAGS))
        .then(|| PolicyBlock::permanent(ReasonCode::PolicyBlacklisted))
}

fn user_closed_block(session: &SessionPolicyState) -> Option<PolicyBlock> {
    (session.contact_status == ContactStatus::Closed || session.has_any_tag(&DECISION_MADE_TAGS))
        .then(|| PolicyBlock::permanent(ReasonCode::PolicyUserClosed))
}

fn max_attempts_block(session: &SessionPolicyState, policy: &GatePolicy) -> Option<PolicyBlock> {
    (session.follow_up_attempts >= policy.max_follow_up_attempts)
        .then(|| PolicyBlock::permanent(ReasonCode::PolicyMaxAttempts))
}

fn cooldown_block(
    session: &SessionPolicyState,
    policy: &GatePolicy,
    now: DateTime<Utc>,
) -> PolicyResult {
    let Some(last_follow_up) = session.last_follow_up else {
        return Ok(None);
    };
    let clears_at = last_follow_up
        .checked_add_signed(policy.cooldown)
        .ok_or_else(|| "cooldown end overflows the calendar".to_string())?;
    Ok((clears_at > now).then(|| PolicyBlock::until(ReasonCode::PolicyCooldown, clears_at)))
}

fn business_hours_block(policy: &GatePolicy, now: DateTime<Utc>) -> PolicyResult {
    let local = now.with_timezone(&policy.timezone);
    let local_time = local.time();
    if local_time >= policy.window_start && local_time < policy.window_end {
        return Ok(None);
    }
    let open_date = if local_time < policy.window_start {
        local.date_naive()
    } else {
        local
            .date_naive()
            .succ_opt()
            .ok_or_else(|| "next business day overflows the calendar".to_string())?
    };
    let opens_at = resolve_local_opening(policy.timezone, open_date.and_time(policy.window_start))
        .ok_or_else(|| {
            format!(
                "window opening {} {} has no valid instant in {}",
                open_date,
                policy.window_start.format("%H:%M"),
                policy.timezone
            )
        })?;
    Ok(Some(PolicyBlock::until(
        ReasonCode::PolicyOutsideHours,
        opens_at,
    )))
}

/// Maps a local wall-clock time to UTC. A time skipped by a DST gap resolves
/// to the first valid minute after the gap.
fn resolve_local_opening(timezone: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    (0..=DST_GAP_SCAN_MINUTES).find_map(|offset| {
        let candidate = local.checked_add_signed(Duration::minutes(offset))?;
        timezone
            .from_local_datetime(&candidate)
            .earliest()
            .map(|resolved| resolved.with_timezone(&Utc))
    })
}

fn rate_limit_block(
    session: &SessionPolicyState,
    policy: &GatePolicy,
    now: DateTime<Utc>,
) -> PolicyResult {
    if session.follow_up_count_24h < policy.max_follow_ups_per_24h {
        return Ok(None);
    }
    let window = Duration::hours(RATE_LIMIT_WINDOW_HOURS);
    let clears_at = session
        .last_follow_up
        .unwrap_or(now)
        .checked_add_signed(window)
        .ok_or_else(|| "rate limit window overflows the calendar".to_string())?;
    // The stored count is stale once its window has passed.
    if clears_at <= now {
        return Ok(None);
    }
    Ok(Some(PolicyBlock::until(
        ReasonCode::PolicyRateLimited,
        clears_at,
    )))
}

/// Deterministic jitter in `[0, max_seconds]` seeded by contact and time.
pub fn reschedule_jitter(seed: &str, decided_at: DateTime<Utc>, max_seconds: u64) -> Duration {
    if max_seconds == 0 {
        return Duration::zero();
    }
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(decided_at.timestamp().to_le_bytes());
    let digest = hasher.finalize();
    let mut seed_bytes = [0_u8; 8];
    seed_bytes.copy_from_slice(&digest[..8]);
    let jitter = u64::from_le_bytes(seed_bytes) % max_seconds.saturating_add(1);
    Duration::seconds(i64::try_from(jitter).unwrap_or(i64::MAX))
}

/// Holds the parsed policy and evaluates sessions against it.
#[derive(Debug, Clone)]
pub struct OutboundGate {
    policy: GatePolicy,
}

impl OutboundGate {
    pub fn new(policy: GatePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    pub fn evaluate(&self, session: &SessionPolicyState, context: &GateContext) -> GateDecision {
        evaluate_outbound_gate(session, context, &self.policy)
    }
}

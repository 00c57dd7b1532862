use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{Duration, NaiveTime};
use chrono_tz::Tz;
use courier_core::{minutes_to_duration, DEFAULT_DETAIL_MAX_CHARS};
use serde::{Deserialize, Serialize};

use crate::lifecycle_gate::GatePolicy;

pub const LIFECYCLE_CONFIG_SCHEMA_VERSION: u32 = 1;

const BUSINESS_HOURS_FORMAT: &str = "%H:%M";

fn lifecycle_config_schema_version() -> u32 {
    LIFECYCLE_CONFIG_SCHEMA_VERSION
}

fn default_dedupe_ttl_minutes() -> u64 {
    5
}

fn default_dedupe_cleanup_interval_minutes() -> u64 {
    1
}

fn default_telemetry_retention_days() -> u64 {
    7
}

fn default_telemetry_start_time_ttl_minutes() -> u64 {
    5
}

fn default_telemetry_start_time_cap() -> usize {
    10_000
}

fn default_detail_max_chars() -> usize {
    DEFAULT_DETAIL_MAX_CHARS
}

fn default_business_hours_start() -> String {
    "09:00".to_string()
}

fn default_business_hours_end() -> String {
    "21:00".to_string()
}

fn default_business_timezone() -> String {
    "UTC".to_string()
}

fn default_follow_up_cooldown_minutes() -> u64 {
    360
}

fn default_max_follow_up_attempts() -> u32 {
    3
}

fn default_max_follow_ups_per_24h() -> u32 {
    1
}

fn default_reschedule_jitter_max_seconds() -> u64 {
    300
}

/// How the trace ledger reacts to records that break the reason-code invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceInvariantMode {
    /// Reject the record with an error.
    Strict,
    /// Repair the record (reason `UNKNOWN`, minimum deferral) and log a warning.
    Normalize,
}

impl Default for TraceInvariantMode {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Strict
        } else {
            Self::Normalize
        }
    }
}

impl TraceInvariantMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Normalize => "normalize",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "strict" => Some(Self::Strict),
            "normalize" => Some(Self::Normalize),
            _ => None,
        }
    }
}

/// Runtime configuration for the lifecycle pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LifecycleConfig {
    #[serde(default = "lifecycle_config_schema_version")]
    pub schema_version: u32,
    #[serde(default = "default_dedupe_ttl_minutes")]
    pub dedupe_ttl_minutes: u64,
    #[serde(default = "default_dedupe_cleanup_interval_minutes")]
    pub dedupe_cleanup_interval_minutes: u64,
    #[serde(default = "default_telemetry_retention_days")]
    pub telemetry_retention_days: u64,
    #[serde(default = "default_telemetry_start_time_ttl_minutes")]
    pub telemetry_start_time_ttl_minutes: u64,
    #[serde(default = "default_telemetry_start_time_cap")]
    pub telemetry_start_time_cap: usize,
    #[serde(default = "default_detail_max_chars")]
    pub detail_max_chars: usize,
    #[serde(default = "default_business_hours_start")]
    pub business_hours_start: String,
    #[serde(default = "default_business_hours_end")]
    pub business_hours_end: String,
    #[serde(default = "default_business_timezone")]
    pub business_timezone: String,
    #[serde(default = "default_follow_up_cooldown_minutes")]
    pub follow_up_cooldown_minutes: u64,
    #[serde(default = "default_max_follow_up_attempts")]
    pub max_follow_up_attempts: u32,
    #[serde(default = "default_max_follow_ups_per_24h")]
    pub max_follow_ups_per_24h: u32,
    #[serde(default = "default_reschedule_jitter_max_seconds")]
    pub reschedule_jitter_max_seconds: u64,
    #[serde(default)]
    pub trace_invariant_mode: TraceInvariantMode,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            schema_version: LIFECYCLE_CONFIG_SCHEMA_VERSION,
            dedupe_ttl_minutes: default_dedupe_ttl_minutes(),
            dedupe_cleanup_interval_minutes: default_dedupe_cleanup_interval_minutes(),
            telemetry_retention_days: default_telemetry_retention_days(),
            telemetry_start_time_ttl_minutes: default_telemetry_start_time_ttl_minutes(),
            telemetry_start_time_cap: default_telemetry_start_time_cap(),
            detail_max_chars: default_detail_max_chars(),
            business_hours_start: default_business_hours_start(),
            business_hours_end: default_business_hours_end(),
            business_timezone: default_business_timezone(),
            follow_up_cooldown_minutes: default_follow_up_cooldown_minutes(),
            max_follow_up_attempts: default_max_follow_up_attempts(),
            max_follow_ups_per_24h: default_max_follow_ups_per_24h(),
            reschedule_jitter_max_seconds: default_reschedule_jitter_max_seconds(),
            trace_invariant_mode: TraceInvariantMode::default(),
        }
    }
}

impl LifecycleConfig {
    pub fn dedupe_ttl(&self) -> Duration {
        minutes_to_duration(self.dedupe_ttl_minutes)
    }

    pub fn dedupe_cleanup_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.dedupe_cleanup_interval_minutes.saturating_mul(60))
    }

    pub fn telemetry_start_time_ttl(&self) -> Duration {
        minutes_to_duration(self.telemetry_start_time_ttl_minutes)
    }

    /// Builds the outbound gate policy, parsing the window and timezone.
    pub fn gate_policy(&self) -> Result<GatePolicy> {
        let window_start = parse_business_time("business_hours_start", &self.business_hours_start)?;
        let window_end = parse_business_time("business_hours_end", &self.business_hours_end)?;
        if window_start >= window_end {
            bail!(
                "business_hours_start '{}' must be earlier than business_hours_end '{}'",
                self.business_hours_start,
                self.business_hours_end
            );
        }
        let timezone = self
            .business_timezone
            .trim()
            .parse::<Tz>()
            .map_err(|_| anyhow!("unknown business_timezone '{}'", self.business_timezone))?;
        Ok(GatePolicy {
            window_start,
            window_end,
            timezone,
            cooldown: minutes_to_duration(self.follow_up_cooldown_minutes),
            max_follow_up_attempts: self.max_follow_up_attempts,
            max_follow_ups_per_24h: self.max_follow_ups_per_24h,
            reschedule_jitter_max_seconds: self.reschedule_jitter_max_seconds,
        })
    }
}

fn parse_business_time(field: &str, raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), BUSINESS_HOURS_FORMAT)
        .with_context(|| format!("{field} must use HH:MM format, got '{raw}'"))
}

/// Loads a lifecycle config file. A missing file yields the defaults.
pub fn load_lifecycle_config_file(path: &Path) -> Result<LifecycleConfig> {
    if !path.exists() {
        return Ok(LifecycleConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read lifecycle config {}", path.display()))?;
    let parsed = serde_json::from_str::<LifecycleConfig>(&raw)
        .with_context(|| format!("failed to parse lifecycle config {}", path.display()))?;
    validate_lifecycle_config(&parsed)
        .with_context(|| format!("invalid lifecycle config {}", path.display()))?;
    Ok(parsed)
}

pub fn validate_lifecycle_config(config: &LifecycleConfig) -> Result<()> {
    if config.schema_version != LIFECYCLE_CONFIG_SCHEMA_VERSION {
        bail!(
            "unsupported lifecycle config schema_version {} (expected {})",
            config.schema_version,
            LIFECYCLE_CONFIG_SCHEMA_VERSION
        );
    }
    if config.dedupe_ttl_minutes == 0 {
        bail!("dedupe_ttl_minutes must be greater than 0");
    }
    if config.dedupe_cleanup_interval_minutes == 0 {
        bail!("dedupe_cleanup_interval_minutes must be greater than 0");
    }
    if config.telemetry_retention_days == 0 {
        bail!("telemetry_retention_days must be greater than 0");
    }
    if config.telemetry_start_time_ttl_minutes == 0 {
        bail!("telemetry_start_time_ttl_minutes must be greater than 0");
    }
    if config.telemetry_start_time_cap == 0 {
        bail!("telemetry_start_time_cap must be greater than 0");
    }
    if config.detail_max_chars == 0 {
        bail!("detail_max_chars must be greater than 0");
    }
    if config.max_follow_up_attempts == 0 {
        bail!("max_follow_up_attempts must be greater than 0");
    }
    if config.max_follow_ups_per_24h == 0 {
        bail!("max_follow_ups_per_24h must be greater than 0");
    }
    config.gate_policy()?;
    Ok(())
}

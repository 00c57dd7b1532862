use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{ArgAction, ArgGroup, Parser, Subcommand};
use courier_lifecycle::TraceInvariantMode;

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_trace_invariant_mode(value: &str) -> Result<TraceInvariantMode, String> {
    TraceInvariantMode::parse(value)
        .ok_or_else(|| format!("unsupported trace invariant mode '{value}' (strict|normalize)"))
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| format!("expected an RFC 3339 timestamp: {error}"))
}

#[derive(Debug, Parser)]
#[command(
    name = "courier",
    about = "Inspect and maintain the message-lifecycle telemetry and decision trace store",
    version
)]
pub(crate) struct Cli {
    #[arg(
        long,
        env = "COURIER_DB",
        default_value = ".courier/lifecycle.sqlite",
        help = "SQLite database holding telemetry events, decision traces and dedupe keys"
    )]
    pub(crate) db: PathBuf,

    #[arg(
        long,
        env = "COURIER_CONFIG",
        default_value = ".courier/lifecycle.json",
        help = "Lifecycle config JSON file. A missing file means built-in defaults"
    )]
    pub(crate) config: PathBuf,

    #[arg(
        long,
        env = "COURIER_VERBOSE",
        default_value_t = false,
        action = ArgAction::SetTrue,
        help = "Log at info level unless RUST_LOG overrides it"
    )]
    pub(crate) verbose: bool,

    #[arg(
        long,
        env = "COURIER_JSON",
        default_value_t = false,
        action = ArgAction::SetTrue,
        help = "Print command output as pretty JSON"
    )]
    pub(crate) json: bool,

    #[arg(
        long = "business-timezone",
        env = "COURIER_BUSINESS_TIMEZONE",
        help = "IANA timezone overriding business_timezone from the config file"
    )]
    pub(crate) business_timezone: Option<String>,

    #[arg(
        long = "business-hours-start",
        env = "COURIER_BUSINESS_HOURS_START",
        help = "HH:MM overriding business_hours_start"
    )]
    pub(crate) business_hours_start: Option<String>,

    #[arg(
        long = "business-hours-end",
        env = "COURIER_BUSINESS_HOURS_END",
        help = "HH:MM overriding business_hours_end"
    )]
    pub(crate) business_hours_end: Option<String>,

    #[arg(
        long = "retention-days",
        env = "COURIER_RETENTION_DAYS",
        value_parser = parse_positive_u64,
        help = "Telemetry and trace retention in days, used by purge"
    )]
    pub(crate) retention_days: Option<u64>,

    #[arg(
        long = "trace-invariant-mode",
        env = "COURIER_TRACE_INVARIANT_MODE",
        value_parser = parse_trace_invariant_mode,
        help = "strict rejects malformed traces, normalize repairs them"
    )]
    pub(crate) trace_invariant_mode: Option<TraceInvariantMode>,

    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub(crate) enum CliCommand {
    /// Funnel counts, skip/error breakdowns and latency over a trailing window.
    Funnel {
        #[arg(
            long = "window-minutes",
            default_value_t = 60,
            value_parser = parse_positive_u64
        )]
        window_minutes: u64,
    },
    /// Ordered lifecycle of one message, or the recent journeys of a phone.
    #[command(group(
        ArgGroup::new("target")
            .required(true)
            .args(["message_id", "phone"])
    ))]
    Journey {
        #[arg(long = "message-id")]
        message_id: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long, default_value_t = 10, value_parser = parse_positive_usize)]
        limit: usize,
    },
    /// Most recent telemetry events for a phone, newest first.
    Events {
        #[arg(long)]
        phone: String,
        #[arg(long, default_value_t = 50, value_parser = parse_positive_usize)]
        limit: usize,
    },
    /// Decision traces recorded for one message.
    Traces {
        #[arg(long = "message-id")]
        message_id: String,
    },
    /// Why a contact can or cannot receive a follow-up right now.
    Explain {
        #[arg(long)]
        phone: String,
        #[arg(long = "session-file", help = "JSON session policy state for the contact")]
        session_file: PathBuf,
        #[arg(long, value_parser = parse_rfc3339, help = "Evaluation time (RFC 3339); defaults to now")]
        now: Option<DateTime<Utc>>,
    },
    /// Delete telemetry events and traces older than the retention window.
    Purge,
    /// Print the effective configuration after file loading and flag overlays.
    PrintConfig,
}

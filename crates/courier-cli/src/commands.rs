use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use courier_lifecycle::{
    load_lifecycle_config_file, render_gate_explanation, validate_lifecycle_config,
    LifecycleConfig, LifecyclePipeline,
};
use courier_store::SqliteLifecycleStore;
use courier_types::SessionPolicyState;
use serde::Serialize;

use crate::cli_args::{Cli, CliCommand};
use crate::render::{render_events, render_funnel, render_journey, render_journeys, render_traces};

/// Loads the config file and applies flag overlays on top of it.
pub(crate) fn resolve_lifecycle_config(cli: &Cli) -> Result<LifecycleConfig> {
    let mut config = load_lifecycle_config_file(&cli.config)?;
    if let Some(timezone) = &cli.business_timezone {
        config.business_timezone = timezone.trim().to_string();
    }
    if let Some(start) = &cli.business_hours_start {
        config.business_hours_start = start.trim().to_string();
    }
    if let Some(end) = &cli.business_hours_end {
        config.business_hours_end = end.trim().to_string();
    }
    if let Some(days) = cli.retention_days {
        config.telemetry_retention_days = days;
    }
    if let Some(mode) = cli.trace_invariant_mode {
        config.trace_invariant_mode = mode;
    }
    validate_lifecycle_config(&config).context("invalid lifecycle config after flag overrides")?;
    Ok(config)
}

fn load_session_file(path: &Path) -> Result<SessionPolicyState> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read session file {}", path.display()))?;
    serde_json::from_str::<SessionPolicyState>(&raw)
        .with_context(|| format!("failed to parse session file {}", path.display()))
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    let mut rendered =
        serde_json::to_string_pretty(value).context("failed to serialize command output")?;
    rendered.push('\n');
    Ok(rendered)
}

/// Runs one CLI invocation and returns what should be printed.
pub(crate) async fn run_cli(cli: Cli) -> Result<String> {
    let config = resolve_lifecycle_config(&cli)?;
    if cli.command == CliCommand::PrintConfig {
        return to_json(&config);
    }

    let store = SqliteLifecycleStore::new(&cli.db)
        .with_context(|| format!("failed to open lifecycle store {}", cli.db.display()))?;
    tracing::info!(db = %store.db_path().display(), "lifecycle store opened");
    let pipeline = LifecyclePipeline::new(config, Arc::new(store))
        .context("failed to start lifecycle pipeline")?;
    let output = execute_command(&pipeline, &cli.command, cli.json).await;
    pipeline.flush().await;
    output
}

async fn execute_command(
    pipeline: &LifecyclePipeline,
    command: &CliCommand,
    json: bool,
) -> Result<String> {
    match command {
        CliCommand::Funnel { window_minutes } => {
            let stats = pipeline
                .funnel_stats(*window_minutes)
                .await
                .context("failed to compute funnel stats")?;
            if json {
                to_json(&stats)
            } else {
                Ok(render_funnel(&stats))
            }
        }
        CliCommand::Journey {
            message_id: Some(message_id),
            ..
        } => {
            let journey = pipeline
                .message_journey(message_id)
                .await
                .with_context(|| format!("failed to load journey for message {message_id}"))?;
            match (journey, json) {
                (Some(journey), true) => to_json(&journey),
                (Some(journey), false) => Ok(render_journey(&journey)),
                (None, true) => to_json(&serde_json::Value::Null),
                (None, false) => Ok(format!("no telemetry events for message {message_id}\n")),
            }
        }
        CliCommand::Journey {
            phone: Some(phone),
            limit,
            ..
        } => {
            let journeys = pipeline
                .recent_journeys(phone, *limit)
                .await
                .context("failed to load recent journeys")?;
            if json {
                to_json(&journeys)
            } else {
                Ok(render_journeys(&journeys))
            }
        }
        CliCommand::Journey { .. } => {
            anyhow::bail!("journey requires --message-id or --phone")
        }
        CliCommand::Events { phone, limit } => {
            let events = pipeline
                .events_for_phone(phone, *limit)
                .await
                .context("failed to load telemetry events")?;
            if json {
                to_json(&events)
            } else {
                Ok(render_events(&events))
            }
        }
        CliCommand::Traces { message_id } => {
            let traces = pipeline
                .traces_for_message(message_id)
                .await
                .with_context(|| format!("failed to load decision traces for {message_id}"))?;
            if json {
                to_json(&traces)
            } else {
                Ok(render_traces(&traces))
            }
        }
        CliCommand::Explain {
            phone,
            session_file,
            now,
        } => {
            let session = load_session_file(session_file)?;
            let explanation = pipeline
                .explain_gate(phone, &session, now.unwrap_or_else(Utc::now))
                .await;
            if json {
                to_json(&explanation)
            } else {
                Ok(render_gate_explanation(&explanation))
            }
        }
        CliCommand::Purge => {
            let report = pipeline.purge_retention().await;
            if json {
                to_json(&report)
            } else {
                Ok(format!(
                    "purged {} telemetry events and {} decision traces older than {} days\n",
                    report.events_deleted,
                    report.traces_deleted,
                    pipeline.config().telemetry_retention_days
                ))
            }
        }
        CliCommand::PrintConfig => to_json(pipeline.config()),
    }
}

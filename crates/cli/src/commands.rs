use std::io::Read;

use anyhow::{Context, Result};
use serde_json::json;

use changeflow_core::{Config, CorrelationId, TrackingManager, TrackingToken};
use changeflow_webhook::parse_payload;

pub fn parse(input: &str, pretty: bool) -> Result<()> {
    let body = if input == "-" {
        let mut body = String::new();
        std::io::stdin()
            .read_to_string(&mut body)
            .context("failed to read payload from stdin")?;
        body
    } else {
        std::fs::read_to_string(input).with_context(|| format!("failed to read '{}'", input))?
    };

    let event = parse_payload(&body).context("payload rejected")?;
    tracing::info!(
        table = %event.table,
        op = %event.operation,
        source_id = %event.source_id,
        "Parsed change event"
    );

    let output = json!({
        "event": event,
        "role": event.actor.role(),
        "user_id": event.actor.user_id(),
        "changed_columns": event.changed_columns(),
    });
    print_json(&output, pretty)
}

pub fn encode_token(
    source: &str,
    correlation_id: Option<&str>,
    job_execution_id: Option<String>,
) -> Result<()> {
    let correlation_id = CorrelationId::resolve(correlation_id);
    let job_execution_id = job_execution_id.unwrap_or_else(TrackingManager::new_job_execution_id);

    let token = TrackingToken::new(source, correlation_id.as_str(), job_execution_id)
        .context("cannot build tracking token")?;
    println!("{}", token.encode());
    Ok(())
}

pub fn decode_token(raw: &str) -> Result<()> {
    let token = TrackingToken::decode(raw).with_context(|| format!("invalid tracking token '{}'", raw))?;
    print_json(&serde_json::to_value(&token)?, true)
}

pub fn show_config(profile: Option<&str>) -> Result<()> {
    let config = Config::for_profile(profile.unwrap_or_default());
    config.log_summary();
    config.validate().context("configuration is invalid")?;
    print_json(&serde_json::to_value(&config)?, true)
}

fn print_json(value: &serde_json::Value, pretty: bool) -> Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", text);
    Ok(())
}

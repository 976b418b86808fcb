//! Enqueue command handler

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde_json::Value;

use fieldsync_core::{Config, Engine, EntityKind, PersonRecord, QueueError, SubmitError};

use crate::output::Output;

/// Queue a mutation, then push it right away when the server answers
pub async fn enqueue(
    config: &Config,
    kind: EntityKind,
    payload: &str,
    known: Option<&Path>,
    force: bool,
    output: &Output,
) -> Result<()> {
    let payload: Value = serde_json::from_str(payload).context("Payload is not valid JSON")?;
    if !payload.is_object() {
        bail!("Payload must be a JSON object");
    }

    let engine = Engine::open(config)?;
    let known = match known {
        Some(path) => load_known(path, kind, engine.today())?,
        None => Vec::new(),
    };
    let id = match engine.submit_checked(kind, payload, &known, force) {
        Ok(id) => id,
        Err(SubmitError::LikelyDuplicate { existing }) => {
            let day = existing
                .day
                .map(|d| format!(" on {}", d))
                .unwrap_or_default();
            bail!(
                "Likely duplicate of {} (guardian {}){}.\n\
                 Use --force to record it anyway.",
                existing.name,
                existing.guardian,
                day
            );
        }
        Err(SubmitError::Queue(QueueError::Storage(e))) => {
            let hint = e
                .recovery_suggestion()
                .map(|s| format!("\n{}", s))
                .unwrap_or_default();
            bail!("Could not save the mutation: {}{}", e, hint);
        }
        Err(e) => return Err(e).context("Failed to queue mutation"),
    };

    if output.is_quiet() {
        println!("{}", id);
    } else {
        output.success(&format!("Queued {} {}", kind, id));
    }

    auto_sync(&engine, output).await;
    Ok(())
}

/// Push queued work if the server is reachable; failures stay queued
async fn auto_sync(engine: &Engine, output: &Output) {
    if !engine.refresh_connectivity().await {
        output.message("Offline; the mutation will be sent when the server is reachable");
        return;
    }

    match engine.drain().await {
        Ok(report) if report.backoff.is_some() => {
            output.message("Server unavailable; the mutation stays queued");
        }
        Ok(report) if !report.synced.is_empty() => {
            output.message(&format!("Sent {} queued mutation(s)", report.synced.len()));
        }
        Ok(_) => {}
        Err(e) => {
            if !output.is_quiet() {
                eprintln!("⚠ Auto-sync failed: {}", e);
            }
        }
    }
}

/// Read previously recorded people from a JSON array of payloads
///
/// Records without a `date` are taken to be from `today`.
fn load_known(path: &Path, kind: EntityKind, today: NaiveDate) -> Result<Vec<PersonRecord>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    let Some(items) = value.as_array() else {
        bail!("{} must contain a JSON array", path.display());
    };

    Ok(items
        .iter()
        .filter_map(|item| PersonRecord::from_payload(kind, item, today))
        .collect())
}

//! Sync command handler

use anyhow::Result;
use tracing::debug;

use fieldsync_core::{Config, SyncEvent};

use super::open_engine;
use crate::output::Output;

/// Send every queued mutation the server will take right now
pub async fn sync(config: &Config, output: &Output) -> Result<()> {
    let engine = open_engine(config).await?;
    let mut events = engine.take_events();

    output.message("Sending queued mutations...");
    let report = engine.drain().await?;

    if let Some(events) = events.as_mut() {
        while let Ok(event) = events.try_recv() {
            debug!(?event, "Sync event");
            if let SyncEvent::Failed {
                id,
                entity_type,
                reason,
            } = event
            {
                output.message(&format!("  ✗ {} {}: {}", entity_type, id, reason));
            }
        }
    }

    output.print_drain_report(&report);
    Ok(())
}

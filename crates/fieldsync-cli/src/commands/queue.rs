//! Queue command handlers

use anyhow::{Context, Result};

use fieldsync_core::{Config, LocalId, MutationStatus};

use super::open_queue;
use crate::output::Output;

/// List queued mutations, oldest first
pub fn list(config: &Config, failed_only: bool, output: &Output) -> Result<()> {
    let queue = open_queue(config)?;
    let mut mutations = queue.list().context("Failed to read queue")?;
    if failed_only {
        mutations.retain(|m| m.status == MutationStatus::Failed);
    }
    output.print_mutations(&mutations);
    Ok(())
}

/// Show one queued mutation
pub fn show(config: &Config, id: LocalId, output: &Output) -> Result<()> {
    let queue = open_queue(config)?;
    let mutation = queue
        .get(id)
        .context("Failed to read queue")?
        .with_context(|| format!("No queued mutation with id {}", id))?;
    output.print_mutation(&mutation);
    Ok(())
}

/// Put a failed mutation back in line
pub fn retry(config: &Config, id: LocalId, output: &Output) -> Result<()> {
    let queue = open_queue(config)?;
    queue.retry_failed(id)?;
    output.success(&format!("Mutation {} will be retried on the next sync", id));
    Ok(())
}

/// Drop a mutation without sending it
pub fn discard(config: &Config, id: LocalId, output: &Output) -> Result<()> {
    let queue = open_queue(config)?;
    let removed = queue.discard(id)?;
    output.success(&format!("Discarded {} {}", removed.entity_type, removed.id));
    Ok(())
}

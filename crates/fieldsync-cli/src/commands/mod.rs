//! Command handlers

pub mod config;
pub mod enqueue;
pub mod fetch;
pub mod queue;
pub mod status;
pub mod sync;

use std::sync::Arc;

use anyhow::{Context, Result};

use fieldsync_core::{open_store, Config, Engine, MutationQueue, SystemClock};

/// Open the engine and probe the server once
pub(crate) async fn open_engine(config: &Config) -> Result<Engine> {
    let engine = Engine::open(config)?;
    engine.refresh_connectivity().await;
    Ok(engine)
}

/// Open only the local queue; no server settings needed
pub(crate) fn open_queue(config: &Config) -> Result<MutationQueue> {
    let store = open_store(config)?;
    MutationQueue::open(store, Arc::new(SystemClock)).context("Failed to open mutation queue")
}

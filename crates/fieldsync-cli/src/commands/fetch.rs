//! Fetch command handler

use anyhow::Result;

use fieldsync_core::Config;

use super::open_engine;
use crate::output::Output;

/// Read a resource, falling back to the local cache when offline
pub async fn fetch(config: &Config, path: &str, output: &Output) -> Result<()> {
    let engine = open_engine(config).await?;
    if !engine.network().is_online() && !output.is_quiet() {
        eprintln!("Offline; serving cached data");
    }
    let value = engine.fetch(path).await?;
    output.print_value(&value);
    Ok(())
}

//! Status command handler

use anyhow::Result;

use fieldsync_core::Config;

use super::open_engine;
use crate::output::Output;

/// Show connectivity and queue counts
pub async fn show(config: &Config, output: &Output) -> Result<()> {
    let engine = open_engine(config).await?;
    let status = engine.status().current();
    output.print_status(&status, config.api_url.as_deref());
    Ok(())
}

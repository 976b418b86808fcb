//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use fieldsync_core::Config;

use crate::output::{Output, OutputFormat};

const VALID_KEYS: &str = "data_dir, api_url, health_url, auth_token, storage_backend, \
     cache_ttl_secs, poll_interval_secs, submit_timeout_secs, backoff_initial_ms, \
     backoff_max_secs, max_attempts, log_file";

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    let token = config.auth_token.as_ref().map(|_| "(set)");

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "api_url": config.api_url,
                    "health_url": config.health_url,
                    "auth_token": token,
                    "storage_backend": config.storage_backend.to_string(),
                    "cache_ttl_secs": config.cache_ttl_secs,
                    "poll_interval_secs": config.poll_interval_secs,
                    "submit_timeout_secs": config.submit_timeout_secs,
                    "backoff_initial_ms": config.backoff_initial_ms,
                    "backoff_max_secs": config.backoff_max_secs,
                    "max_attempts": config.max_attempts,
                    "log_file": config.log_file
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:            {}", config.data_dir.display());
            println!("  api_url:             {}", or_unset(config.api_url.as_deref()));
            println!("  health_url:          {}", or_unset(config.health_url.as_deref()));
            println!("  auth_token:          {}", or_unset(token));
            println!("  storage_backend:     {}", config.storage_backend);
            println!("  cache_ttl_secs:      {}", config.cache_ttl_secs);
            println!("  poll_interval_secs:  {}", config.poll_interval_secs);
            println!("  submit_timeout_secs: {}", config.submit_timeout_secs);
            println!("  backoff_initial_ms:  {}", config.backoff_initial_ms);
            println!("  backoff_max_secs:    {}", config.backoff_max_secs);
            println!(
                "  max_attempts:        {}",
                config
                    .max_attempts
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "(unlimited)".to_string())
            );
            println!(
                "  log_file:            {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    apply(&mut config, &key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    let shown = if key == "auth_token" { "(hidden)" } else { value.as_str() };
    output.success(&format!("Set {} = {}", key, shown));

    Ok(())
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "data_dir" => config.data_dir = value.into(),
        "api_url" => config.api_url = optional(value),
        "health_url" => config.health_url = optional(value),
        "auth_token" => config.auth_token = optional(value),
        "storage_backend" => {
            config.storage_backend = value.parse().map_err(anyhow::Error::msg)?;
        }
        "cache_ttl_secs" => config.cache_ttl_secs = number(key, value)?,
        "poll_interval_secs" => config.poll_interval_secs = number(key, value)?,
        "submit_timeout_secs" => config.submit_timeout_secs = number(key, value)?,
        "backoff_initial_ms" => config.backoff_initial_ms = number(key, value)?,
        "backoff_max_secs" => config.backoff_max_secs = number(key, value)?,
        "max_attempts" => {
            config.max_attempts = match optional(value) {
                Some(v) => Some(number(key, &v)?),
                None => None,
            };
        }
        "log_file" => config.log_file = optional(value).map(PathBuf::from),
        _ => bail!("Unknown configuration key: '{}'\nValid keys: {}", key, VALID_KEYS),
    }
    config.validate()
}

/// Empty or "none" clears an optional setting
fn optional(value: &str) -> Option<String> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value.to_string())
    }
}

fn number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid value for {}: expected a number", key))
}

fn or_unset(value: Option<&str>) -> &str {
    value.unwrap_or("(not set)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_core::StorageBackend;

    #[test]
    fn test_apply_known_keys() {
        let mut config = Config::default();
        apply(&mut config, "api_url", "https://field.example.org").unwrap();
        apply(&mut config, "storage_backend", "file").unwrap();
        apply(&mut config, "max_attempts", "5").unwrap();

        assert_eq!(config.api_url.as_deref(), Some("https://field.example.org"));
        assert_eq!(config.storage_backend, StorageBackend::File);
        assert_eq!(config.max_attempts, Some(5));

        apply(&mut config, "max_attempts", "none").unwrap();
        assert_eq!(config.max_attempts, None);
    }

    #[test]
    fn test_apply_rejects_bad_values() {
        let mut config = Config::default();
        assert!(apply(&mut config, "poll_interval_secs", "soon").is_err());
        assert!(apply(&mut config, "storage_backend", "postgres").is_err());
        assert!(apply(&mut config, "favorite_color", "blue").is_err());
    }

    #[test]
    fn test_apply_rejects_zero_retry_settings() {
        for key in ["backoff_initial_ms", "backoff_max_secs", "max_attempts"] {
            let mut config = Config::default();
            let err = apply(&mut config, key, "0").unwrap_err();
            assert!(err.to_string().contains(key));
        }

        let mut config = Config::default();
        apply(&mut config, "backoff_initial_ms", "250").unwrap();
        assert_eq!(config.backoff_initial_ms, 250);
    }
}

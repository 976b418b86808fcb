//! fieldsync CLI
//!
//! Record field data offline and send it to the server when a connection
//! is available.

use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use fieldsync_core::{Config, EntityKind, LocalId};

mod commands;
mod output;

use output::{Output, OutputFormat};

/// Environment variable that enables logging, e.g. `FIELDSYNC_LOG=debug`
const LOG_ENV: &str = "FIELDSYNC_LOG";

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "fieldsync - offline-first field data capture")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a create request for the server
    #[command(alias = "add")]
    Enqueue {
        /// Entity kind (session, attendee, screening, screened-child, location-update)
        kind: EntityKind,
        /// JSON payload
        payload: String,
        /// JSON array of records already on the server, checked for duplicates
        #[arg(long, value_name = "FILE")]
        known: Option<PathBuf>,
        /// Queue even when the record looks like a duplicate
        #[arg(short, long)]
        force: bool,
    },
    /// Inspect and manage the local queue
    Queue {
        #[command(subcommand)]
        command: Option<QueueCommands>,
    },
    /// Show connectivity and queue counts
    Status,
    /// Send queued mutations now
    Sync,
    /// Read a resource, using the cache when offline
    Fetch {
        /// API path, e.g. /api/sessions
        path: String,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// List queued mutations
    #[command(alias = "ls")]
    List {
        /// Only show mutations the server rejected
        #[arg(long)]
        failed: bool,
    },
    /// Show one queued mutation
    Show { id: LocalId },
    /// Put a failed mutation back in line
    Retry { id: LocalId },
    /// Remove a mutation without sending it
    #[command(alias = "rm")]
    Discard { id: LocalId },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (api_url, auth_token, storage_backend, ...)
        key: String,
        /// Configuration value ("none" clears optional keys)
        value: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_ref();

    // Config commands work even when the file does not parse into a usable setup
    if let Commands::Config { command } = &cli.command {
        return handle_config_command(command.clone(), config_path, &output);
    }

    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    init_logging(&config);

    match cli.command {
        Commands::Enqueue {
            kind,
            payload,
            known,
            force,
        } => {
            commands::enqueue::enqueue(&config, kind, &payload, known.as_deref(), force, &output)
                .await
        }
        Commands::Queue { command } => handle_queue_command(command, &config, &output),
        Commands::Status => commands::status::show(&config, &output).await,
        Commands::Sync => commands::sync::sync(&config, &output).await,
        Commands::Fetch { path } => commands::fetch::fetch(&config, &path, &output).await,
        Commands::Config { .. } => Ok(()),
    }
}

fn handle_queue_command(
    command: Option<QueueCommands>,
    config: &Config,
    output: &Output,
) -> Result<()> {
    match command.unwrap_or(QueueCommands::List { failed: false }) {
        QueueCommands::List { failed } => commands::queue::list(config, failed, output),
        QueueCommands::Show { id } => commands::queue::show(config, id, output),
        QueueCommands::Retry { id } => commands::queue::retry(config, id, output),
        QueueCommands::Discard { id } => commands::queue::discard(config, id, output),
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}

/// Initialize logging when FIELDSYNC_LOG is set
///
/// Logs go to `log_file` when configured so they don't interleave with
/// command output, otherwise to stderr.
fn init_logging(config: &Config) {
    let Ok(level) = std::env::var(LOG_ENV) else {
        return;
    };
    let level = if level.trim().is_empty() {
        "info".to_string()
    } else {
        level
    };
    let filter = EnvFilter::try_new(format!("fieldsync_core={level},fieldsync={level}"))
        .unwrap_or_else(|_| EnvFilter::new("fieldsync_core=info,fieldsync=info"));

    let file = config.log_file.as_ref().and_then(|path| {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        OpenOptions::new().create(true).append(true).open(path).ok()
    });
    let ansi = file.is_none();
    let writer = match file {
        Some(file) => BoxMakeWriter::new(file),
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(ansi)
        .with_writer(writer)
        .try_init();
}

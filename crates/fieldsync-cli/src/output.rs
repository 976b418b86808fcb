//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use fieldsync_core::sync::SkipReason;
use fieldsync_core::{DrainReport, MutationStatus, PendingMutation, SyncStatus};
use serde::Serialize;
use serde_json::Value;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print a single queued mutation
    pub fn print_mutation(&self, mutation: &PendingMutation) {
        match self.format {
            OutputFormat::Human => {
                println!("ID:          {}", mutation.id);
                println!("Kind:        {}", mutation.entity_type);
                println!("Endpoint:    {}", mutation.entity_type.endpoint());
                println!("Status:      {}", mutation.status);
                println!("Created:     {}", mutation.created_at.format("%Y-%m-%d %H:%M:%S"));
                println!("Retries:     {}", mutation.retry_count);
                if let Some(ref error) = mutation.last_error {
                    println!("Last error:  {}", error);
                }
                println!("Payload:     {}", mutation.payload);
            }
            OutputFormat::Json => print_json(mutation),
            OutputFormat::Quiet => println!("{}", mutation.id),
        }
    }

    /// Print the queue, oldest first
    pub fn print_mutations(&self, mutations: &[PendingMutation]) {
        match self.format {
            OutputFormat::Human => {
                if mutations.is_empty() {
                    println!("Queue is empty.");
                    return;
                }
                for m in mutations {
                    let error = match (m.status, m.last_error.as_deref()) {
                        (MutationStatus::Failed, Some(e)) | (MutationStatus::Pending, Some(e)) => {
                            format!(" | {}", truncate(e, 40))
                        }
                        _ => String::new(),
                    };
                    println!(
                        "{:>5} | {:<15} | {:<8} | {} | {}{}",
                        m.id,
                        m.entity_type,
                        m.status,
                        m.created_at.format("%Y-%m-%d %H:%M"),
                        truncate(&m.payload.to_string(), 40),
                        error
                    );
                }
                println!("\n{} mutation(s)", mutations.len());
            }
            OutputFormat::Json => print_json(&mutations),
            OutputFormat::Quiet => {
                for m in mutations {
                    println!("{}", m.id);
                }
            }
        }
    }

    /// Print connectivity and queue counts
    pub fn print_status(&self, status: &SyncStatus, api_url: Option<&str>) {
        match self.format {
            OutputFormat::Human => {
                println!("fieldsync status");
                println!("================");
                println!();
                println!(
                    "Network:  {}",
                    if status.is_online { "online" } else { "offline" }
                );
                if let Some(url) = api_url {
                    println!("Server:   {}", url);
                }
                println!("Pending:  {}", status.pending_count);
                println!("Failed:   {}", status.failed_count);
                if status.is_syncing {
                    println!("Syncing...");
                }
                if status.failed_count > 0 {
                    println!();
                    println!("Failed items need attention: fieldsync queue retry <id> or discard <id>");
                }
            }
            OutputFormat::Json => print_json(status),
            OutputFormat::Quiet => {
                println!("{} {}", status.pending_count, status.failed_count);
            }
        }
    }

    /// Print the outcome of a drain
    pub fn print_drain_report(&self, report: &DrainReport) {
        match self.format {
            OutputFormat::Human => {
                match report.skipped {
                    Some(SkipReason::Offline) if report.synced.is_empty() => {
                        println!("Offline; nothing was sent");
                        return;
                    }
                    Some(SkipReason::Offline) => println!("Connection lost during sync"),
                    Some(SkipReason::Unauthenticated) => {
                        println!("Not signed in; set auth_token to sync");
                        return;
                    }
                    Some(SkipReason::AlreadyRunning) => {
                        println!("Another sync is already running");
                        return;
                    }
                    None => {}
                }
                println!(
                    "Synced {} mutation(s), {} rejected",
                    report.synced.len(),
                    report.failed.len()
                );
                for id in &report.failed {
                    println!("  ✗ {} rejected by server", id);
                }
                if let Some(delay) = report.backoff {
                    println!("Server unreachable; next attempt in {}s", delay.as_secs().max(1));
                }
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({
                        "synced": report.synced,
                        "failed": report.failed,
                        "backoff_ms": report.backoff.map(|d| d.as_millis() as u64),
                        "skipped": report.skipped.map(|s| format!("{:?}", s).to_lowercase()),
                    })
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a fetched resource
    pub fn print_value(&self, value: &Value) {
        match self.format {
            OutputFormat::Quiet => println!("{}", value),
            _ => print_json(value),
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("Could not encode output: {}", e),
    }
}

/// Truncate a string to max characters, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

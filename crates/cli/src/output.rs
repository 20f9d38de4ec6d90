//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print rows as a table, or the underlying items as JSON
pub fn print_items<T: Serialize, R: Tabled>(
    items: &[T],
    to_row: impl Fn(&T) -> R,
    format: OutputFormat,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                print_warning("No items found");
                return Ok(());
            }
            let rows: Vec<R> = items.iter().map(to_row).collect();
            println!("{}", Table::new(rows).with(Style::rounded()));
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(items)?),
    }
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Format a millisecond count as `1h02m03s`
pub fn format_millis(millis: u64) -> String {
    let secs = millis / 1000;
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h{:02}m{:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m{:02}s", m, s)
    } else {
        format!("{}.{:01}s", s, (millis % 1000) / 100)
    }
}

/// Color a workload or component state
pub fn color_state(state: &str) -> String {
    match state.to_lowercase().as_str() {
        "ready" => state.blue().to_string(),
        "running" | "finished" | "healthy" => state.green().to_string(),
        "pausing" | "paused" | "degraded" => state.yellow().to_string(),
        "erred" | "terminated" | "unhealthy" => state.red().to_string(),
        _ => state.to_string(),
    }
}

//! Workload commands

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::Path;
use tabled::Tabled;

use crate::client::{ApiClient, Workload};
use crate::output::{color_state, format_millis, print_items, print_success, OutputFormat};

/// Row for the workloads table
#[derive(Tabled)]
struct WorkloadRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Sessions")]
    sessions: String,
    #[tabled(rename = "Trainings")]
    trainings: u64,
    #[tabled(rename = "Ticks")]
    ticks: u64,
    #[tabled(rename = "Elapsed")]
    elapsed: String,
}

impl From<&Workload> for WorkloadRow {
    fn from(w: &Workload) -> Self {
        let stats = &w.statistics;
        Self {
            id: w.id.clone(),
            name: w.name.clone(),
            kind: w.kind.clone(),
            state: color_state(&w.state),
            sessions: format!(
                "{}/{}",
                stats.num_active_sessions, stats.num_sampled_sessions
            ),
            trainings: stats.num_tasks_executed,
            ticks: stats.total_num_ticks,
            elapsed: format_millis(stats.time_elapsed_millis),
        }
    }
}

pub async fn list_workloads(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let workloads: Vec<Workload> = client.get("api/v1/workloads").await?;
    print_items(&workloads, |w| WorkloadRow::from(w), format)?;
    if format == OutputFormat::Table && !workloads.is_empty() {
        println!("\nTotal: {} workloads", workloads.len());
    }
    Ok(())
}

pub async fn show_workload(client: &ApiClient, id: &str, format: OutputFormat) -> Result<()> {
    let workload: Workload = client.get(&format!("api/v1/workloads/{}", id)).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&workload)?),
        OutputFormat::Table => print_details(&workload),
    }
    Ok(())
}

fn print_details(w: &Workload) {
    let stats = &w.statistics;
    println!("{} {} ({})", "Workload".bold(), w.id, w.name);
    println!("  Kind:              {}", w.kind);
    println!("  Seed:              {}", w.seed);
    println!("  State:             {}", color_state(&w.state));
    println!("  Registered:        {}", stats.registered_time);
    if let Some(start) = &stats.start_time {
        println!("  Started:           {}", start);
    }
    if let Some(end) = &stats.end_time {
        println!("  Ended:             {}", end);
    }
    println!(
        "  Sessions:          {} sampled of {}, {} created, {} active",
        stats.num_sampled_sessions,
        stats.total_num_sessions,
        stats.num_sessions_created,
        stats.num_active_sessions
    );
    println!(
        "  Trainings:         {} executed, {} active",
        stats.num_tasks_executed, stats.num_active_trainings
    );
    println!(
        "  Events:            {} processed, {} discarded",
        stats.num_events_processed, stats.num_discarded_events
    );
    println!(
        "  Session delays:    {}",
        stats.num_times_session_delayed_resource_contention
    );
    println!("  Ticks:             {}", stats.total_num_ticks);
    println!(
        "  Elapsed:           {} ({} paused)",
        format_millis(stats.time_elapsed_millis),
        format_millis(stats.time_spent_paused_millis)
    );
    if let Some(message) = &stats.error_message {
        println!("  Error:             {}", message.red());
    }
}

/// Register a template workload read from a JSON file
pub async fn register_workload(
    client: &ApiClient,
    path: &Path,
    name: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read template {}", path.display()))?;
    let mut template: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse template {}", path.display()))?;
    if let Some(name) = name {
        template["name"] = serde_json::Value::String(name);
    }

    let workload: Workload = client.post("api/v1/workloads", Some(&template)).await?;
    report(&workload, "registered", format)
}

/// Workload control actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Pause,
    Unpause,
    Stop,
}

impl Action {
    fn path_segment(self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Pause => "pause",
            Action::Unpause => "unpause",
            Action::Stop => "stop",
        }
    }

    fn past_tense(self) -> &'static str {
        match self {
            Action::Start => "started",
            Action::Pause => "pause requested",
            Action::Unpause => "unpaused",
            Action::Stop => "stopped",
        }
    }
}

pub async fn control_workload(
    client: &ApiClient,
    id: &str,
    action: Action,
    format: OutputFormat,
) -> Result<()> {
    let path = format!("api/v1/workloads/{}/{}", id, action.path_segment());
    let workload: Workload = client.post::<_, ()>(&path, None).await?;
    report(&workload, action.past_tense(), format)
}

fn report(workload: &Workload, what: &str, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(workload)?),
        OutputFormat::Table => print_success(&format!(
            "Workload {} {} (state: {})",
            workload.id,
            what,
            color_state(&workload.state)
        )),
    }
    Ok(())
}

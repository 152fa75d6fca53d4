//! Output formatting for CLI

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use specwright_common::{RunStatus, TaskStatus, TestOutcome};

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
}

/// Items that can be displayed as a table row
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

fn table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Render a list as a table, or `None` when it is empty
pub fn render_table<T: TableDisplay>(items: &[T]) -> Option<String> {
    if items.is_empty() {
        return None;
    }
    let mut table = table();
    table.set_header(T::headers());
    for item in items {
        table.add_row(item.row());
    }
    Some(table.to_string())
}

/// Print a serializable value in a structured format
pub fn print_structured<T: Serialize + ?Sized>(value: &T, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
        _ => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Table => match render_table(items) {
            Some(table) => println!("{table}"),
            None => println!("No items found."),
        },
        _ => print_structured(items, format)?,
    }
    Ok(())
}

/// Print a list under a heading, skipping empty lists
pub fn print_section<T: TableDisplay>(title: &str, items: &[T]) {
    if let Some(table) = render_table(items) {
        println!("\n{}", title.bold());
        println!("{table}");
    }
}

pub fn run_status(status: RunStatus) -> String {
    let text = status.to_string();
    match status {
        RunStatus::Completed => text.green().to_string(),
        RunStatus::Stuck | RunStatus::TimedOut => text.yellow().to_string(),
        RunStatus::Failed | RunStatus::Cancelled => text.red().to_string(),
        _ => text,
    }
}

pub fn task_status(status: TaskStatus) -> String {
    let text = status.to_string();
    match status {
        TaskStatus::Succeeded => text.green().to_string(),
        TaskStatus::Failed => text.red().to_string(),
        TaskStatus::Skipped => text.yellow().to_string(),
        _ => text,
    }
}

pub fn test_outcome(outcome: TestOutcome) -> String {
    let text = outcome.to_string();
    match outcome {
        TestOutcome::Passed => text.green().to_string(),
        TestOutcome::Failed => text.red().to_string(),
        TestOutcome::Flaky | TestOutcome::Skipped => text.yellow().to_string(),
    }
}

/// Format a ratio as a percentage
pub fn percent(rate: f64) -> String {
    format!("{:.1}%", rate * 100.0)
}

/// Print success message
pub fn print_success(message: &str) {
    println!("✅ {}", message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("❌ {}", message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("⚠️  {}", message);
}

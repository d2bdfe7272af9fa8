//! Output formatting for CLI commands.

use colored::Colorize;
use lab_agent::{ExecutionReport, Outcome};
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON format.
    Json,
}

impl OutputFormat {
    /// Anything other than `json` falls back to tables.
    pub fn parse(value: &str) -> Self {
        match value {
            "json" => Self::Json,
            _ => Self::Table,
        }
    }
}

/// Print data in the specified format.
pub fn print_output<T: Serialize + Tabled>(data: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if data.is_empty() {
                println!("{}", "No items found.".dimmed());
            } else {
                println!("{}", Table::new(data));
            }
        }
        OutputFormat::Json => println!("{}", format_json(data, "[]")),
    }
}

/// Print a single item as JSON.
pub fn print_single<T: Serialize>(data: &T) {
    println!("{}", format_json(data, "{}"));
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "Success:".green().bold(), message);
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "Info:".blue().bold(), message);
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "Warning:".yellow().bold(), message);
}

fn format_json<T: Serialize + ?Sized>(data: &T, fallback: &str) -> String {
    serde_json::to_string_pretty(data).unwrap_or_else(|_| fallback.to_string())
}

/// One row of an execution report.
#[derive(Debug, Serialize, Tabled)]
struct ReportRow {
    #[tabled(rename = "Tenant")]
    tenant: String,

    #[tabled(rename = "Outcome")]
    outcome: String,

    #[tabled(rename = "Steps")]
    steps: usize,

    #[tabled(rename = "Duration")]
    duration: String,

    #[tabled(rename = "Reason", display = "display_option")]
    reason: Option<String>,
}

pub fn display_option(opt: &Option<String>) -> String {
    opt.as_deref().unwrap_or("-").to_string()
}

fn outcome_cell(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Succeeded => outcome.label().green().to_string(),
        Outcome::Failed(_) => outcome.label().red().to_string(),
        Outcome::Skipped(_) => outcome.label().yellow().to_string(),
    }
}

/// Print a per-tenant report followed by a one-line tally.
pub fn print_report(report: &ExecutionReport, format: OutputFormat) {
    if format == OutputFormat::Json {
        print_single(report);
        return;
    }

    let rows: Vec<ReportRow> = report
        .tenants
        .values()
        .map(|t| ReportRow {
            tenant: t.tenant_id.to_string(),
            outcome: outcome_cell(&t.outcome),
            steps: t.steps.len(),
            duration: format!("{:.1}s", t.duration_ms as f64 / 1000.0),
            reason: t.outcome.reason().map(str::to_string),
        })
        .collect();

    if !rows.is_empty() {
        println!("{}", Table::new(&rows));
    }

    let counts = report.counts();
    let tally = format!(
        "{} succeeded, {} failed, {} skipped, {} unchanged ({} mode)",
        counts.succeeded, counts.failed, counts.skipped, counts.unchanged, report.mode
    );
    if report.is_success() {
        print_success(&tally);
    } else {
        print_warning(&tally);
    }
}

//! Report rendering

use anyhow::{Context, Result};
use clap::ValueEnum;
use colored::Colorize;
use probe_lib::models::{EngineReport, LatencySample, LatencySummary, StopReason};
use std::time::Duration;
use tabled::{settings::Style, Table, Tabled};

/// Output format for the final report
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

#[derive(Tabled)]
struct LatencyRow {
    #[tabled(rename = "Namespace")]
    namespace: String,
    #[tabled(rename = "Pod")]
    pod: String,
    #[tabled(rename = "Time to first log")]
    latency: String,
}

impl From<&LatencySample> for LatencyRow {
    fn from(sample: &LatencySample) -> Self {
        Self {
            namespace: sample.namespace.clone(),
            pod: sample.name.clone(),
            latency: format_latency(sample.latency),
        }
    }
}

/// Print the final report to stdout
pub fn print_report(report: &EngineReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            println!("{}", render_table(report));
            Ok(())
        }
        OutputFormat::Json => {
            let json =
                serde_json::to_string_pretty(report).context("Failed to serialize report")?;
            println!("{}", json);
            Ok(())
        }
    }
}

fn render_table(report: &EngineReport) -> String {
    let mut out = String::new();

    match &report.summary {
        LatencySummary::NoData => {
            out.push_str(&format!("{} No logged pods found.", "⚠".yellow().bold()));
        }
        LatencySummary::Stats {
            count,
            min,
            max,
            mean,
        } => {
            let rows: Vec<LatencyRow> = report.samples.iter().map(LatencyRow::from).collect();
            out.push_str(&Table::new(rows).with(Style::rounded()).to_string());
            out.push('\n');
            out.push_str(&format!("{} {}\n", "Pods:".bold(), count));
            out.push_str(&format!("{} {}\n", "Min latency:".bold(), color_latency(*min)));
            out.push_str(&format!("{} {}\n", "Max latency:".bold(), color_latency(*max)));
            out.push_str(&format!("{} {}", "Mean latency:".bold(), color_latency(*mean)));
        }
    }

    out.push_str(&format!(
        "\n{} {} after {} cycle(s)",
        "ℹ".blue().bold(),
        stop_reason_label(report.stop_reason),
        report.cycles
    ));
    out
}

fn stop_reason_label(reason: StopReason) -> &'static str {
    match reason {
        StopReason::Interrupted => "Stopped by signal",
        StopReason::EmptyQueueThreshold => "Stopped after no new pods appeared",
    }
}

/// Format a latency with millisecond precision
pub fn format_latency(latency: Duration) -> String {
    let secs = latency.as_secs_f64();
    if secs >= 60.0 {
        let whole = latency.as_secs();
        format!("{}m{:.3}s", whole / 60, secs - (whole - whole % 60) as f64)
    } else {
        format!("{:.3}s", secs)
    }
}

fn color_latency(latency: Duration) -> String {
    let formatted = format_latency(latency);
    if latency <= Duration::from_secs(10) {
        formatted.green().to_string()
    } else if latency <= Duration::from_secs(60) {
        formatted.yellow().to_string()
    } else {
        formatted.red().to_string()
    }
}

//! Run report output

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use storycheck_common::StoryFailure;
use storycheck_interpreter::RunReport;

pub const EXIT_PASSED: u8 = 0;
pub const EXIT_FAILED: u8 = 1;
pub const EXIT_CANCELLED: u8 = 2;
pub const EXIT_ERROR: u8 = 3;

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable summary
    #[default]
    Text,
    /// The run report as JSON
    Json,
}

pub fn exit_code(report: &RunReport) -> u8 {
    if report.cancelled {
        EXIT_CANCELLED
    } else if report.passed {
        EXIT_PASSED
    } else {
        EXIT_FAILED
    }
}

pub fn print_report(report: &RunReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
        }
        OutputFormat::Text => print_text(report),
    }
}

fn print_text(report: &RunReport) {
    let verdict = if report.cancelled {
        "CANCELLED".yellow().bold()
    } else if report.passed {
        "PASSED".green().bold()
    } else {
        "FAILED".red().bold()
    };

    println!();
    println!("{} {}", verdict, report.story.display());
    println!("  Run:      {}", report.run_id);
    println!("  Duration: {:.1}s", report.duration_ms as f64 / 1000.0);
    println!("  Results:  {}", report.results_dir.display());

    if report.errors.is_empty() {
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Section", "Step", "Prompt", "Error"]);
    for failure in &report.errors {
        table.add_row(failure_row(failure));
    }
    println!("{table}");
}

fn failure_row(failure: &StoryFailure) -> Vec<String> {
    vec![
        failure
            .section
            .map(|s| s.to_string())
            .unwrap_or_else(|| "run".to_string()),
        failure
            .step
            .map(|s| (s + 1).to_string())
            .unwrap_or_else(|| "-".to_string()),
        failure.prompt.clone().unwrap_or_default(),
        failure.message.clone(),
    ]
}

//! StoryCheck CLI
//!
//! Runs one markdown user story against a web3 app and reports the result.

use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use storycheck_common::{ResultsDir, StoryCheckConfig};
use storycheck_interpreter::{LazyGrounding, StoryPaths, StoryRunner};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod output;

use output::OutputFormat;

/// Filter used with --debug; keeps DevTools transport chatter out
const DEBUG_FILTER: &str = "debug,chromiumoxide=info,tungstenite=info,hyper=info,hyper_util=info";

#[derive(Parser)]
#[command(name = "storycheck")]
#[command(author, version, about = "Run a markdown user story against a web3 app on a local chain fork")]
struct Cli {
    /// Directory containing story.md
    story_dir: PathBuf,

    /// Root directory for run results
    #[arg(short, long, default_value = "results")]
    output_dir: PathBuf,

    /// Configuration file (defaults apply when it does not exist)
    #[arg(short, long, default_value = "storycheck.toml")]
    config: PathBuf,

    /// UI grounding model endpoint
    #[arg(long, env = "STORYCHECK_GROUNDING_ENDPOINT")]
    grounding_endpoint: Option<String>,

    /// Chromium executable
    #[arg(long, env = "STORYCHECK_CHROMIUM")]
    chromium: Option<PathBuf>,

    /// Show the browser window
    #[arg(long)]
    headed: bool,

    /// Do not record screencast frames
    #[arg(long)]
    no_video: bool,

    /// Report format
    #[arg(long, default_value = "text")]
    format: OutputFormat,

    /// Print the run report as JSON (same as --format json)
    #[arg(long)]
    json: bool,

    /// Write the run log as JSON lines
    #[arg(long)]
    json_log: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    load_env_files();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::from(output::EXIT_ERROR)
        }
    }
}

/// `.env`, then `.env.local` overriding it
fn load_env_files() {
    let _ = dotenvy::dotenv();
    let _ = dotenvy::from_filename_override(".env.local");
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = StoryCheckConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    apply_overrides(&mut config, &cli);

    let paths = StoryPaths::from_story_dir(&cli.story_dir, &cli.output_dir)?;
    let results = ResultsDir::create(&paths.results_dir)?;
    init_logging(cli.debug, cli.json_log, &results.log_path())?;
    info!("StoryCheck v{}", storycheck_common::VERSION);

    let grounding = Arc::new(LazyGrounding::new(config.grounding.clone()));
    let runner = StoryRunner::new(config, grounding);

    let cancel = runner.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; shutting down the fork and browser");
            cancel.cancel();
        }
    });

    let report = runner.run(&paths).await;
    let format = if cli.json { OutputFormat::Json } else { cli.format };
    output::print_report(&report, format);
    Ok(ExitCode::from(output::exit_code(&report)))
}

fn apply_overrides(config: &mut StoryCheckConfig, cli: &Cli) {
    if let Some(endpoint) = &cli.grounding_endpoint {
        config.grounding.endpoint = endpoint.clone();
    }
    if let Some(chromium) = &cli.chromium {
        config.browser.executable = Some(chromium.clone());
    }
    if cli.headed {
        config.browser.headless = false;
    }
    if cli.no_video {
        config.browser.record_video = false;
    }
}

/// Terminal output on stderr plus a copy in the results directory
fn init_logging(debug: bool, json_file: bool, log_path: &Path) -> anyhow::Result<()> {
    let filter = if debug {
        EnvFilter::new(DEBUG_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let file = Arc::new(
        File::create(log_path).with_context(|| format!("creating {}", log_path.display()))?,
    );
    let json_layer = json_file.then(|| fmt::layer().json().with_writer(file.clone()));
    let text_layer = (!json_file).then(|| fmt::layer().with_ansi(false).with_writer(file));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(json_layer)
        .with(text_layer)
        .with(filter)
        .init();
    Ok(())
}

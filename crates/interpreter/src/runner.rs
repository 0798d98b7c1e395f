//! Story runs
//!
//! A run parses the story, then nests the two scoped resources: the chain
//! fork around everything, and the browser session around the user steps
//! and expected results. Both are released on every exit path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use storycheck_chain::{ChainFork, ForkProcessManager};
use storycheck_common::{
    slugify, Manifest, Result, ResultsDir, SectionKind, StoryCheckConfig, StoryError, StoryFailure, UserStory,
    STORY_FILE,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::browser::BrowserSession;
use crate::grounding::UiGrounding;
use crate::scope::scoped;
use crate::sections::{self, CheckContext, StepContext};
use crate::story::StoryParser;
use crate::verifier::{VerifierEnv, VerifierRunner};

/// Where a story lives and where its results go
#[derive(Debug, Clone)]
pub struct StoryPaths {
    pub story_dir: PathBuf,
    pub story_file: PathBuf,
    pub results_dir: PathBuf,
}

impl StoryPaths {
    /// Results land in `<output_root>/<story directory name>`. Paths are made
    /// absolute so child processes can use them from any directory.
    pub fn from_story_dir(story_dir: &Path, output_root: &Path) -> Result<Self> {
        let story_file = story_dir.join(STORY_FILE);
        if !story_file.is_file() {
            return Err(StoryError::Config(format!(
                "no {} in {}",
                STORY_FILE,
                story_dir.display()
            )));
        }
        let name = story_dir
            .canonicalize()
            .ok()
            .as_deref()
            .and_then(Path::file_name)
            .map(|n| slugify(&n.to_string_lossy()))
            .unwrap_or_else(|| "story".to_string());

        Ok(Self {
            story_file: std::path::absolute(&story_file)?,
            story_dir: std::path::absolute(story_dir)?,
            results_dir: std::path::absolute(output_root.join(name))?,
        })
    }
}

/// Outcome of one run, saved as `result.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub story: PathBuf,
    pub results_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub passed: bool,
    pub cancelled: bool,
    pub errors: Vec<StoryFailure>,
}

pub struct StoryRunner {
    config: StoryCheckConfig,
    grounding: Arc<dyn UiGrounding>,
    cancel: CancellationToken,
}

impl StoryRunner {
    pub fn new(config: StoryCheckConfig, grounding: Arc<dyn UiGrounding>) -> Self {
        Self {
            config,
            grounding,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling this token stops the run and releases its resources
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run a story end to end. Never fails: errors end up in the report.
    pub async fn run(&self, paths: &StoryPaths) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();
        info!("Run {} of {}", run_id, paths.story_file.display());

        let (errors, cancelled) = match self.execute(paths).await {
            Ok(failures) => (failures, false),
            Err(e) => {
                error!("Run stopped: {}", e);
                let cancelled = matches!(e, StoryError::Cancelled);
                (vec![StoryFailure::fatal(&e)], cancelled)
            }
        };

        let report = RunReport {
            run_id,
            story: paths.story_file.clone(),
            results_dir: paths.results_dir.clone(),
            started_at,
            finished_at: Utc::now(),
            duration_ms: clock.elapsed().as_millis() as u64,
            passed: errors.is_empty(),
            cancelled,
            errors,
        };

        match ResultsDir::create(&paths.results_dir) {
            Ok(results) => {
                if let Err(e) = results.write_json(&results.result_path(), &report) {
                    warn!("Writing result.json failed: {}", e);
                }
            }
            Err(e) => warn!("Results directory unavailable: {}", e),
        }
        info!(
            "Run {} {} with {} error(s)",
            run_id,
            if report.passed { "passed" } else { "failed" },
            report.errors.len()
        );
        report
    }

    async fn execute(&self, paths: &StoryPaths) -> Result<Vec<StoryFailure>> {
        let story = StoryParser::new().parse_file(&paths.story_file)?;
        if story.is_empty() {
            warn!("{} has no prompts under any known heading", paths.story_file.display());
        }
        for kind in SectionKind::ALL {
            info!("{}: {} prompt(s)", kind, story.section(kind).len());
        }

        let results = ResultsDir::create(&paths.results_dir)?;
        let fork = ForkProcessManager::new(self.config.fork.clone())
            .with_config_out(results.fork_config_out());

        scoped(&fork, &self.cancel, async {
            let mut failures = sections::prerequisites()
                .run(&story.prerequisites, &fork)
                .await?;

            let session = BrowserSession::new(
                self.config.browser.clone(),
                fork.endpoints().await,
                self.config.fork.local_rpc_url(),
                results.clone(),
            );
            let browsed = scoped(
                &session,
                &self.cancel,
                self.drive_browser(&story, &session, paths, &results),
            )
            .await?;

            failures.extend(browsed);
            Ok(failures)
        })
        .await
    }

    async fn drive_browser(
        &self,
        story: &UserStory,
        session: &BrowserSession,
        paths: &StoryPaths,
        results: &ResultsDir,
    ) -> Result<Vec<StoryFailure>> {
        session.start().await?;

        let steps = StepContext::new(
            session.page().await?,
            self.grounding.clone(),
            results.clone(),
            &self.config.browser,
        );
        let mut failures = sections::user_steps().run(&story.user_steps, &steps).await?;

        let final_screenshot = match steps.capture_final().await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Final screenshot failed: {}", e);
                None
            }
        };
        let tx_snapshot = session.persist_transactions()?;
        let rpc_url = session.endpoints().map(|e| e.local_rpc_url.clone());
        let manifest = Manifest {
            final_screenshot,
            tx_snapshot,
            trace: results.trace_path(),
            local_rpc_url: rpc_url.clone(),
        };
        results.write_json(&results.manifest_path(), &manifest)?;

        let checks = CheckContext {
            story_file: paths.story_file.clone(),
            story_dir: paths.story_dir.clone(),
            transactions: session.transactions(),
            verifier: VerifierRunner::new(self.config.verifier.clone()),
            env: VerifierEnv::for_results(results, rpc_url),
        };
        failures.extend(
            sections::expected_results()
                .run(&story.expected_results, &checks)
                .await?,
        );

        Ok(failures)
    }
}

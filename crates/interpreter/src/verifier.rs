//! Expected-result verifier scripts
//!
//! A verifier is a script next to the story, run in its own process with the
//! results directory as its only argument. It reports on the last line of
//! stdout, either a bare JSON boolean or `{"passed": bool, "error": ...}`.
//! The process environment also carries:
//!
//! | variable                   | value                          |
//! |----------------------------|--------------------------------|
//! | `STORYCHECK_RESULTS_DIR`   | results directory              |
//! | `STORYCHECK_TX_LOG`        | `tx_log_snapshot.json`         |
//! | `STORYCHECK_MANIFEST`      | `manifest.json`                |
//! | `STORYCHECK_RPC_URL`       | local fork RPC URL, when known |

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use storycheck_common::{slugify, Prompt, ResultsDir, Result, StoryError, VerifierConfig};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// What a verifier reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifierOutcome {
    pub passed: bool,
    pub error: Option<String>,
}

impl VerifierOutcome {
    pub fn passed() -> Self {
        Self { passed: true, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            passed: false,
            error: Some(error.into()),
        }
    }
}

/// Inputs handed to every verifier
#[derive(Debug, Clone)]
pub struct VerifierEnv {
    pub results_dir: PathBuf,
    pub tx_log: PathBuf,
    pub manifest: PathBuf,
    pub rpc_url: Option<String>,
}

impl VerifierEnv {
    pub fn for_results(results: &ResultsDir, rpc_url: Option<String>) -> Self {
        Self {
            results_dir: results.root().to_path_buf(),
            tx_log: results.tx_snapshot_path(),
            manifest: results.manifest_path(),
            rpc_url,
        }
    }

    /// Same paths, anchored to the current directory
    pub fn absolute(&self) -> Result<Self> {
        Ok(Self {
            results_dir: std::path::absolute(&self.results_dir)?,
            tx_log: std::path::absolute(&self.tx_log)?,
            manifest: std::path::absolute(&self.manifest)?,
            rpc_url: self.rpc_url.clone(),
        })
    }
}

/// Locates and runs verifier scripts
#[derive(Debug, Clone)]
pub struct VerifierRunner {
    config: VerifierConfig,
}

impl VerifierRunner {
    pub fn new(config: VerifierConfig) -> Self {
        Self { config }
    }

    /// Script for a prompt: its link relative to the story directory, else
    /// `<story>/verifiers/<slug>.<ext>` for the first extension that exists
    pub fn resolve(&self, prompt: &Prompt, story_dir: &Path) -> Result<PathBuf> {
        if let Some(link) = &prompt.link {
            let path = story_dir.join(link);
            return if path.is_file() {
                Ok(path)
            } else {
                Err(StoryError::VerifierExecution(format!(
                    "verifier not found: {}",
                    path.display()
                )))
            };
        }

        let base = story_dir.join(&self.config.directory).join(slugify(&prompt.text));
        let candidates: Vec<PathBuf> = self
            .config
            .search_order
            .iter()
            .map(|ext| match ext.as_str() {
                "" => base.clone(),
                ext => base.with_extension(ext),
            })
            .collect();

        candidates
            .iter()
            .find(|path| path.is_file())
            .cloned()
            .ok_or_else(|| {
                StoryError::VerifierExecution(format!(
                    "no verifier for '{}' (looked for {}.{{{}}})",
                    prompt.text,
                    base.display(),
                    self.config.search_order.join(",")
                ))
            })
    }

    fn command_for(&self, script: &Path) -> Command {
        let interpreter = script
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| self.config.interpreters.get(ext));

        match interpreter {
            Some(program) => {
                let mut cmd = Command::new(program);
                cmd.arg(script);
                cmd
            }
            None => Command::new(script),
        }
    }

    /// Run a verifier. Every failure mode becomes a failed outcome.
    pub async fn run(&self, script: &Path, env: &VerifierEnv) -> VerifierOutcome {
        match self.execute(script, env).await {
            Ok(outcome) => outcome,
            Err(e) => VerifierOutcome::failed(e.to_string()),
        }
    }

    async fn execute(&self, script: &Path, env: &VerifierEnv) -> Result<VerifierOutcome> {
        // The process runs from the script's directory
        let script = std::path::absolute(script)?;
        let script = script.as_path();
        let env = env.absolute()?;

        let mut cmd = self.command_for(script);
        cmd.arg(&env.results_dir)
            .env("STORYCHECK_RESULTS_DIR", &env.results_dir)
            .env("STORYCHECK_TX_LOG", &env.tx_log)
            .env("STORYCHECK_MANIFEST", &env.manifest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(url) = &env.rpc_url {
            cmd.env("STORYCHECK_RPC_URL", url);
        }
        if let Some(dir) = script.parent() {
            cmd.current_dir(dir);
        }

        info!("Running verifier {}", script.display());
        let child = cmd.spawn().map_err(|e| {
            StoryError::VerifierExecution(format!("failed to launch {}: {}", script.display(), e))
        })?;

        let output = timeout(self.config.timeout(), child.wait_with_output())
            .await
            .map_err(|_| StoryError::Timeout {
                what: format!("verifier {}", script.display()),
                seconds: self.config.timeout_secs,
            })??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines() {
            debug!(target: "verifier", "{}", line);
        }

        if !output.status.success() {
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(StoryError::VerifierExecution(format!(
                "{} exited with {}: {}",
                script.display(),
                output.status,
                tail.join(" | ")
            )));
        }

        let outcome = interpret_output(&stdout)?;
        if !outcome.passed {
            warn!(
                "Verifier {} reported failure: {}",
                script.display(),
                outcome.error.as_deref().unwrap_or("no reason given")
            );
        }
        Ok(outcome)
    }
}

/// Parse the verdict from the last non-empty stdout line
pub fn interpret_output(stdout: &str) -> Result<VerifierOutcome> {
    let last = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| StoryError::VerifierExecution("verifier printed nothing".into()))?;

    let verdict: Value = serde_json::from_str(last).map_err(|e| {
        StoryError::VerifierExecution(format!("unreadable verdict '{}': {}", last, e))
    })?;

    match verdict {
        Value::Bool(true) => Ok(VerifierOutcome::passed()),
        Value::Bool(false) => Ok(VerifierOutcome::failed("verifier returned false")),
        Value::Object(map) => {
            let passed = map.get("passed").and_then(Value::as_bool).ok_or_else(|| {
                StoryError::VerifierExecution(format!("verdict has no boolean 'passed': {}", last))
            })?;
            let error = match map.get("error") {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(other) => Some(other.to_string()),
            };
            Ok(match (passed, error) {
                (true, _) => VerifierOutcome::passed(),
                (false, Some(error)) => VerifierOutcome::failed(error),
                (false, None) => VerifierOutcome::failed("verifier returned passed=false"),
            })
        }
        other => Err(StoryError::VerifierExecution(format!(
            "verdict must be a boolean or object, got {}",
            other
        ))),
    }
}

//! Expected results: check what the run produced

use async_trait::async_trait;
use std::path::PathBuf;
use storycheck_common::{Prompt, Result, SectionKind, Snapshot, StoryError};
use tracing::info;

use super::{StepInterpreter, StorySection};
use crate::classify::ActionClass;
use crate::snapshot;
use crate::verifier::{VerifierEnv, VerifierRunner};

/// Inputs for result checks, fixed once the user steps are done
pub struct CheckContext {
    pub story_file: PathBuf,
    pub story_dir: PathBuf,
    pub transactions: Snapshot,
    pub verifier: VerifierRunner,
    pub env: VerifierEnv,
}

/// Compare the run's transactions with the saved baseline
pub struct SnapshotStep;

#[async_trait]
impl StepInterpreter<CheckContext> for SnapshotStep {
    async fn interpret(&self, _prompt: &Prompt, ctx: &CheckContext) -> Result<()> {
        snapshot::check_or_record(&snapshot::baseline_path(&ctx.story_file), &ctx.transactions)
    }
}

/// Run the verifier script the prompt names
pub struct VerifierStep;

#[async_trait]
impl StepInterpreter<CheckContext> for VerifierStep {
    async fn interpret(&self, prompt: &Prompt, ctx: &CheckContext) -> Result<()> {
        let script = ctx.verifier.resolve(prompt, &ctx.story_dir)?;
        let outcome = ctx.verifier.run(&script, &ctx.env).await;
        if outcome.passed {
            info!("Verifier {} passed", script.display());
            return Ok(());
        }
        Err(StoryError::VerifierFailed {
            name: prompt.text.clone(),
            reason: outcome.error.unwrap_or_else(|| "verifier returned false".into()),
        })
    }
}

pub fn expected_results() -> StorySection<CheckContext> {
    StorySection::new(SectionKind::ExpectedResults)
        .handler(ActionClass::SnapshotMatch, SnapshotStep)
        .handler(ActionClass::Verifier, VerifierStep)
}

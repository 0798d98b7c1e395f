//! Prerequisites: bring up the chain fork

use async_trait::async_trait;
use storycheck_chain::{ChainFork, ForkRequest};
use storycheck_common::{Prompt, Result, SectionKind};
use tracing::info;

use super::{StepInterpreter, StorySection};
use crate::classify::ActionClass;

/// Context of the prerequisites section
pub type ForkContext = dyn ChainFork;

/// Chain forked when a prompt names none
pub const DEFAULT_CHAIN_ID: &str = "1";

/// Fork request described by a `Chain` prompt
pub fn chain_request(prompt: &Prompt) -> ForkRequest {
    let chain_id = prompt
        .parameter(&["id", "chain_id", "chain"])
        .unwrap_or(DEFAULT_CHAIN_ID);
    let mut request = ForkRequest::new(chain_id);
    request.block_number = prompt
        .parameter(&["block", "block_number"])
        .map(|b| b.replace('_', ""));
    request.rpc_url = prompt.parameter(&["rpc", "rpc_url"]).map(String::from);
    request
}

pub struct ChainStep;

#[async_trait]
impl StepInterpreter<ForkContext> for ChainStep {
    async fn interpret(&self, prompt: &Prompt, fork: &ForkContext) -> Result<()> {
        let endpoints = fork.start_fork(chain_request(prompt)).await?;
        info!(
            "Chain {} forked; local RPC at {}",
            endpoints.chain_id, endpoints.local_rpc_url
        );
        Ok(())
    }
}

pub fn prerequisites() -> StorySection<ForkContext> {
    StorySection::new(SectionKind::Prerequisites).handler(ActionClass::Chain, ChainStep)
}

//! StoryCheck chain fork
//!
//! Runs a local fork of a public chain for the duration of a story so the
//! app under test transacts against disposable state.

pub mod fork;

use async_trait::async_trait;
use storycheck_common::{ChainEndpoints, Result};

pub use fork::{ForkHandle, ForkProcessManager, ForkRequest, ForkState};

/// Something that can bring up a chain fork for a story
#[async_trait]
pub trait ChainFork: Send + Sync {
    /// Start the fork and wait until it answers JSON-RPC
    async fn start_fork(&self, request: ForkRequest) -> Result<ChainEndpoints>;

    /// Endpoints of the running fork, if any
    async fn endpoints(&self) -> Option<ChainEndpoints>;
}

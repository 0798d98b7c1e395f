//! StoryCheck Common Library
//!
//! Shared types, configuration, errors and results-directory layout for the
//! StoryCheck story runner.

pub mod artifacts;
pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use artifacts::{slugify, ResultsDir};
pub use config::{
    BrowserConfig, CanvasSize, DeviceProfile, ForkConfig, GroundingConfig, StoryCheckConfig,
    VerifierConfig,
};
pub use error::{Result, StoryError};
pub use types::*;

/// StoryCheck version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// File name of the story document inside a story directory
pub const STORY_FILE: &str = "story.md";

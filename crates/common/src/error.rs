//! Error types for StoryCheck

use thiserror::Error;

/// Result type alias using StoryCheck Error
pub type Result<T> = std::result::Result<T, StoryError>;

/// StoryCheck error types
#[derive(Error, Debug)]
pub enum StoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Story parse error: {0}")]
    Parse(String),

    #[error("Unknown chain id {0}: no RPC URL configured")]
    UnknownChain(String),

    #[error("Fork did not become ready within {seconds}s")]
    StartupTimeout { seconds: u64 },

    #[error("Fork process exited before becoming ready: {status}")]
    ForkExited { status: String },

    #[error("Cannot classify prompt: {0}")]
    Classification(String),

    #[error("RPC reroute failed: {0}")]
    RpcReroute(String),

    #[error("Snapshot mismatch: {summary}")]
    SnapshotMismatch {
        summary: String,
        diff: serde_json::Value,
    },

    #[error("Verifier {name} failed: {reason}")]
    VerifierFailed { name: String, reason: String },

    #[error("Verifier execution error: {0}")]
    VerifierExecution(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("UI grounding error: {0}")]
    Grounding(String),

    #[error("Step failed: {0}")]
    StepFailed(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("{what} timed out after {seconds}s")]
    Timeout { what: String, seconds: u64 },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Run cancelled")]
    Cancelled,
}

impl StoryError {
    /// Fatal errors abort the run. Everything else is recorded against
    /// the step that raised it and the section moves on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoryError::Parse(_)
                | StoryError::UnknownChain(_)
                | StoryError::StartupTimeout { .. }
                | StoryError::ForkExited { .. }
                | StoryError::InvalidStateTransition { .. }
                | StoryError::Config(_)
                | StoryError::Cancelled
        )
    }

    /// Structured detail attached to the failure record, if any.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            StoryError::SnapshotMismatch { diff, .. } => Some(diff.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(StoryError::UnknownChain("999".into()).is_fatal());
        assert!(StoryError::StartupTimeout { seconds: 30 }.is_fatal());
        assert!(StoryError::Cancelled.is_fatal());
        assert!(!StoryError::Grounding("no point".into()).is_fatal());
        assert!(!StoryError::VerifierExecution("exit 2".into()).is_fatal());
    }

    #[test]
    fn test_snapshot_mismatch_details() {
        let err = StoryError::SnapshotMismatch {
            summary: "1 transaction differs".into(),
            diff: serde_json::json!({"saved_snapshot": [], "new_snapshot": []}),
        };
        assert_eq!(err.to_string(), "Snapshot mismatch: 1 transaction differs");
        assert!(err.details().is_some());
        assert!(StoryError::Cancelled.details().is_none());
    }
}

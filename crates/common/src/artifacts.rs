//! Results directory layout
//!
//! Every file a run produces lives under one results directory:
//!
//! ```text
//! results/<story>/
//!   storycheck.log          combined run log
//!   anvil-out.json          fork accounts and config
//!   <ts>_<step>.png         pre-step screenshots
//!   <ts>_<step>_annotated.png
//!   final.png               last screenshot before checks
//!   tx_log_snapshot.json    captured wallet transactions
//!   manifest.json           pointers for verifier scripts
//!   trace.zip               DevTools trace
//!   videos/                 screencast frames
//!   result.json             run outcome
//! ```

use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Longest slug used in generated file names
const MAX_SLUG_LEN: usize = 60;

/// Handle to a run's results directory
#[derive(Debug, Clone)]
pub struct ResultsDir {
    root: PathBuf,
}

impl ResultsDir {
    /// Create the directory (and parents) if needed
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join("storycheck.log")
    }

    pub fn fork_config_out(&self) -> PathBuf {
        self.root.join("anvil-out.json")
    }

    pub fn tx_snapshot_path(&self) -> PathBuf {
        self.root.join("tx_log_snapshot.json")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    pub fn trace_path(&self) -> PathBuf {
        self.root.join("trace.zip")
    }

    pub fn videos_dir(&self) -> PathBuf {
        self.root.join("videos")
    }

    pub fn final_screenshot_path(&self) -> PathBuf {
        self.root.join("final.png")
    }

    pub fn result_path(&self) -> PathBuf {
        self.root.join("result.json")
    }

    /// `<timestamp>_<slug>[_<suffix>].png` for a step screenshot
    pub fn step_screenshot_path(&self, step_text: &str, suffix: Option<&str>) -> PathBuf {
        let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let slug = slugify(step_text);
        let name = match suffix {
            Some(suffix) => format!("{}_{}_{}.png", timestamp, slug, suffix),
            None => format!("{}_{}.png", timestamp, slug),
        };
        self.root.join(name)
    }

    /// Write a value as pretty JSON under the results directory
    pub fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Lower-case ASCII slug: alphanumerics kept, every other run becomes `_`.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_sep = false;
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    if slug.is_empty() {
        slug.push_str("step");
    }
    slug
}

//! Core types for StoryCheck

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Result, StoryError};

/// One list item of a story section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    /// Human-readable step text
    pub text: String,

    /// First link target in the item, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,

    /// `key: value` pairs from the item itself and its nested items
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

impl Prompt {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Lower-cased, whitespace-collapsed text used for classification.
    pub fn normalized(&self) -> String {
        self.text
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    /// Look up a parameter by any of the given keys, in order.
    pub fn parameter(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .find_map(|key| self.parameters.get(*key))
            .map(String::as_str)
    }
}

/// A parsed story: three ordered prompt lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStory {
    pub prerequisites: Vec<Prompt>,
    pub user_steps: Vec<Prompt>,
    pub expected_results: Vec<Prompt>,
}

impl UserStory {
    pub fn section(&self, kind: SectionKind) -> &[Prompt] {
        match kind {
            SectionKind::Prerequisites => &self.prerequisites,
            SectionKind::UserSteps => &self.user_steps,
            SectionKind::ExpectedResults => &self.expected_results,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prerequisites.is_empty() && self.user_steps.is_empty() && self.expected_results.is_empty()
    }
}

/// Story section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Prerequisites,
    UserSteps,
    ExpectedResults,
}

impl SectionKind {
    pub const ALL: [SectionKind; 3] = [
        SectionKind::Prerequisites,
        SectionKind::UserSteps,
        SectionKind::ExpectedResults,
    ];

    /// Heading text that introduces the section in a story document
    pub fn title(&self) -> &'static str {
        match self {
            SectionKind::Prerequisites => "Prerequisites",
            SectionKind::UserSteps => "User Steps",
            SectionKind::ExpectedResults => "Expected Results",
        }
    }
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// The wallet request that produced a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteTx {
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// One `eth_sendTransaction` observed by the mock wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    #[serde(rename = "writeTx")]
    pub write_tx: WriteTx,

    #[serde(rename = "writeTxResult", default)]
    pub write_tx_result: Option<serde_json::Value>,

    #[serde(rename = "writeTxException", default)]
    pub write_tx_exception: Option<serde_json::Value>,

    /// Fields the wallet reported that we do not interpret
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TransactionRecord {
    pub fn from_payload(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Ordered list of transactions captured during a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(pub Vec<TransactionRecord>);

impl Snapshot {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TransactionRecord> {
        self.0.iter()
    }

    /// Load a saved snapshot. `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// RPC endpoints of a running fork.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEndpoints {
    pub chain_id: String,
    /// Public RPC URL the app would normally call
    pub remote_rpc_url: String,
    /// RPC URL of the local fork
    pub local_rpc_url: String,
}

/// A recorded step failure, or a fatal error when `section` is empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryFailure {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<SectionKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl StoryFailure {
    pub fn at_step(section: SectionKind, step: usize, prompt: &Prompt, error: &StoryError) -> Self {
        Self {
            section: Some(section),
            step: Some(step),
            prompt: Some(prompt.text.clone()),
            message: error.to_string(),
            details: error.details(),
        }
    }

    pub fn fatal(error: &StoryError) -> Self {
        Self {
            section: None,
            step: None,
            prompt: None,
            message: error.to_string(),
            details: error.details(),
        }
    }
}

/// Artifacts handed to expected-result checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_screenshot: Option<PathBuf>,
    pub tx_snapshot: PathBuf,
    pub trace: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_rpc_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_normalized() {
        let prompt = Prompt::new("  Click   the\tConnect Wallet ");
        assert_eq!(prompt.normalized(), "click the connect wallet");
    }

    #[test]
    fn test_prompt_parameter_lookup_order() {
        let prompt = Prompt::new("Chain")
            .with_parameter("chain_id", "5")
            .with_parameter("id", "1");
        assert_eq!(prompt.parameter(&["id", "chain_id"]), Some("1"));
        assert_eq!(prompt.parameter(&["block"]), None);
    }

    #[test]
    fn test_transaction_record_keeps_unknown_fields() {
        let payload = r#"{"writeTx":{"method":"eth_sendTransaction","params":[{"to":"0x1"}]},"writeTxResult":"0xabc","writeTxException":null,"origin":"app"}"#;
        let record = TransactionRecord::from_payload(payload).unwrap();
        assert_eq!(record.write_tx.method, "eth_sendTransaction");
        assert_eq!(record.write_tx_result, Some(serde_json::json!("0xabc")));
        assert!(record.write_tx_exception.is_none());
        assert_eq!(record.extra.get("origin"), Some(&serde_json::json!("app")));

        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["origin"], "app");
        assert_eq!(back["writeTx"]["params"][0]["to"], "0x1");
    }

    #[test]
    fn test_snapshot_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Snapshot::load(&dir.path().join("none.json")).unwrap().is_none());
    }

    #[test]
    fn test_snapshot_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("story.snapshot.json");
        let record = TransactionRecord::from_payload(
            r#"{"writeTx":{"method":"eth_sendTransaction","params":[]},"writeTxResult":null,"writeTxException":{"code":4001}}"#,
        )
        .unwrap();
        let snapshot = Snapshot(vec![record]);
        snapshot.save(&path).unwrap();

        let loaded = Snapshot::load(&path).unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn test_section_titles() {
        assert_eq!(SectionKind::UserSteps.to_string(), "User Steps");
        assert_eq!(SectionKind::ALL.len(), 3);
    }
}

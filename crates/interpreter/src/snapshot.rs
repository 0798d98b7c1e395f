//! Transaction snapshot comparison
//!
//! Two snapshots match when they hold the same number of transactions and,
//! position by position:
//! - the wallet requests are identical once volatile fields are removed;
//! - the exceptions are identical whenever either side has one;
//! - both sides have a result, or neither does.
//!
//! Transaction hashes differ between runs (fresh wallet key, fresh fork), so
//! results are compared by presence only.

use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use storycheck_common::{Result, Snapshot, StoryError, TransactionRecord};
use tracing::{debug, info};

/// Request parameters that vary from run to run
const VOLATILE_PARAMS: &[&str] = &["gasLimit"];

/// Why one transaction pair differs
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TxMismatch {
    Request { index: usize },
    Exception { index: usize },
    ResultPresence { index: usize, saved: bool, current: bool },
}

/// Saved and current snapshots with what differs between them
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotDiff {
    pub saved_snapshot: Snapshot,
    pub new_snapshot: Snapshot,
    pub mismatches: Vec<TxMismatch>,
}

impl SnapshotDiff {
    pub fn summary(&self) -> String {
        if self.saved_snapshot.len() != self.new_snapshot.len() {
            format!(
                "expected {} transaction(s), saw {}",
                self.saved_snapshot.len(),
                self.new_snapshot.len()
            )
        } else {
            format!("{} transaction(s) differ", self.mismatches.len())
        }
    }

    pub fn into_error(self) -> Result<StoryError> {
        Ok(StoryError::SnapshotMismatch {
            summary: self.summary(),
            diff: serde_json::to_value(&self)?,
        })
    }
}

/// Baseline file kept next to the story: `story.md` -> `story.snapshot.json`
pub fn baseline_path(story_file: &Path) -> PathBuf {
    story_file.with_extension("snapshot.json")
}

/// Request with volatile parameters stripped, as canonical JSON
fn canonical_request(record: &TransactionRecord) -> String {
    let mut params = record.write_tx.params.clone();
    match &mut params {
        Value::Array(items) => items.iter_mut().for_each(strip_volatile),
        other => strip_volatile(other),
    }
    serde_json::json!({ "method": record.write_tx.method, "params": params }).to_string()
}

fn strip_volatile(value: &mut Value) {
    if let Value::Object(map) = value {
        for key in VOLATILE_PARAMS {
            map.remove(*key);
        }
    }
}

fn is_present(value: &Option<Value>) -> bool {
    !matches!(value, None | Some(Value::Null))
}

fn tx_mismatch(index: usize, saved: &TransactionRecord, current: &TransactionRecord) -> Option<TxMismatch> {
    if canonical_request(saved) != canonical_request(current) {
        return Some(TxMismatch::Request { index });
    }

    let saved_exc = &saved.write_tx_exception;
    let current_exc = &current.write_tx_exception;
    if (is_present(saved_exc) || is_present(current_exc)) && saved_exc != current_exc {
        return Some(TxMismatch::Exception { index });
    }

    let (saved_res, current_res) = (is_present(&saved.write_tx_result), is_present(&current.write_tx_result));
    if saved_res != current_res {
        return Some(TxMismatch::ResultPresence {
            index,
            saved: saved_res,
            current: current_res,
        });
    }

    None
}

/// `None` when the snapshots match
pub fn compare(saved: &Snapshot, current: &Snapshot) -> Option<SnapshotDiff> {
    let mismatches: Vec<TxMismatch> = if saved.len() != current.len() {
        Vec::new()
    } else {
        saved
            .iter()
            .zip(current.iter())
            .enumerate()
            .filter_map(|(index, (s, c))| tx_mismatch(index, s, c))
            .collect()
    };

    if saved.len() == current.len() && mismatches.is_empty() {
        return None;
    }

    Some(SnapshotDiff {
        saved_snapshot: saved.clone(),
        new_snapshot: current.clone(),
        mismatches,
    })
}

/// Compare against the saved baseline, or record it on first run
pub fn check_or_record(baseline: &Path, current: &Snapshot) -> Result<()> {
    match Snapshot::load(baseline)? {
        None => {
            info!(
                "No saved snapshot at {}; recording {} transaction(s) as the baseline",
                baseline.display(),
                current.len()
            );
            current.save(baseline)
        }
        Some(saved) => match compare(&saved, current) {
            None => {
                debug!("Snapshot matches {}", baseline.display());
                Ok(())
            }
            Some(diff) => Err(diff.into_error()?),
        },
    }
}

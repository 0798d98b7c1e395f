//! Prompt classification
//!
//! Each section owns an ordered rule list. The first rule whose matcher
//! accepts the normalized prompt text decides the action; sections may name
//! a default for prompts no rule accepts.

use serde::{Deserialize, Serialize};
use std::fmt;
use storycheck_common::{Prompt, SectionKind};

/// Action a prompt resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    Chain,
    Browse,
    Click,
    TypeText,
    KeyPress,
    Scroll,
    SnapshotMatch,
    Verifier,
}

impl fmt::Display for ActionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionClass::Chain => "chain",
            ActionClass::Browse => "browse",
            ActionClass::Click => "click",
            ActionClass::TypeText => "type_text",
            ActionClass::KeyPress => "key_press",
            ActionClass::Scroll => "scroll",
            ActionClass::SnapshotMatch => "snapshot_match",
            ActionClass::Verifier => "verifier",
        };
        f.write_str(name)
    }
}

/// Predicate over normalized prompt text
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Text starts with any of these
    Prefix(&'static [&'static str]),
    /// Text contains this anywhere
    Contains(&'static str),
}

impl Matcher {
    pub fn matches(&self, normalized: &str) -> bool {
        match self {
            Matcher::Prefix(prefixes) => prefixes.iter().any(|p| normalized.starts_with(*p)),
            Matcher::Contains(needle) => normalized.contains(needle),
        }
    }
}

/// Ordered `(matcher, class)` rules with an optional fallback
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<(Matcher, ActionClass)>,
    default: Option<ActionClass>,
}

impl Classifier {
    pub fn new(rules: Vec<(Matcher, ActionClass)>, default: Option<ActionClass>) -> Self {
        Self { rules, default }
    }

    /// Rules for a story section
    pub fn for_section(kind: SectionKind) -> Self {
        match kind {
            SectionKind::Prerequisites => {
                Self::new(vec![(Matcher::Prefix(&["chain"]), ActionClass::Chain)], None)
            }
            SectionKind::UserSteps => Self::new(
                vec![
                    (Matcher::Prefix(&["scroll"]), ActionClass::Scroll),
                    (Matcher::Prefix(&["press"]), ActionClass::KeyPress),
                    (Matcher::Prefix(&["type", "input", "enter"]), ActionClass::TypeText),
                    (Matcher::Prefix(&["browse"]), ActionClass::Browse),
                    (Matcher::Prefix(&["click", "select", "tap"]), ActionClass::Click),
                ],
                // Free-form steps usually name something on screen to click
                Some(ActionClass::Click),
            ),
            SectionKind::ExpectedResults => Self::new(
                vec![(Matcher::Contains("match snapshot"), ActionClass::SnapshotMatch)],
                Some(ActionClass::Verifier),
            ),
        }
    }

    /// `None` when no rule matches and the section has no default
    pub fn classify(&self, prompt: &Prompt) -> Option<ActionClass> {
        let normalized = prompt.normalized();
        self.rules
            .iter()
            .find(|(matcher, _)| matcher.matches(&normalized))
            .map(|(_, class)| *class)
            .or(self.default)
    }
}

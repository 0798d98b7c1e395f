//! Story document parser
//!
//! A story is a markdown file with three headed sections, each followed by a
//! list. Every list item becomes a [`Prompt`]:
//!
//! ```markdown
//! ## Prerequisites
//! - Chain
//!   - id: 1
//!   - block: 18000000
//!
//! ## User Steps
//! 1. Browse to [the app](https://app.example)
//! 2. Click "Connect Wallet"
//!
//! ## Expected Results
//! - [Tx success](verifiers/tx_success.py)
//! - Match snapshot
//! ```
//!
//! Headings are matched case-insensitively at any level. A section is empty
//! when its heading is missing or no list follows it before the next heading.

use once_cell::sync::Lazy;
use pulldown_cmark::{Event, Parser as MdParser, Tag, TagEnd};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use storycheck_common::{Prompt, Result, SectionKind, StoryError, UserStory};
use tracing::debug;

/// `key:value` pairs written inline after the first colon of an item
static INLINE_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_ ]*?)\s*:\s*(\S.*?)\s*$").expect("static regex"));

#[derive(Debug, Default)]
struct ListItem {
    text: String,
    link: Option<String>,
    children: Vec<ListItem>,
}

#[derive(Debug)]
enum Block {
    Heading(String),
    List(Vec<ListItem>),
}

/// Markdown story parser
#[derive(Debug, Clone, Copy, Default)]
pub struct StoryParser;

impl StoryParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse a story file
    pub fn parse_file(&self, path: &Path) -> Result<UserStory> {
        let bytes = std::fs::read(path)?;
        let text = std::str::from_utf8(&bytes)
            .map_err(|e| StoryError::Parse(format!("{} is not valid UTF-8: {}", path.display(), e)))?;
        Ok(self.parse(text))
    }

    /// Parse raw story bytes; they must be UTF-8
    pub fn parse_bytes(&self, bytes: &[u8]) -> Result<UserStory> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| StoryError::Parse(format!("story is not valid UTF-8: {}", e)))?;
        Ok(self.parse(text))
    }

    /// Parse story markdown
    pub fn parse(&self, markdown: &str) -> UserStory {
        let blocks = collect_blocks(markdown);
        let section = |kind: SectionKind| -> Vec<Prompt> {
            let prompts: Vec<Prompt> = section_items(&blocks, kind.title())
                .map(|items| items.iter().map(to_prompt).collect())
                .unwrap_or_default();
            debug!("Parsed {} prompt(s) for {}", prompts.len(), kind);
            prompts
        };

        UserStory {
            prerequisites: section(SectionKind::Prerequisites),
            user_steps: section(SectionKind::UserSteps),
            expected_results: section(SectionKind::ExpectedResults),
        }
    }
}

/// Reduce the event stream to headings and top-level lists
fn collect_blocks(markdown: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut heading: Option<String> = None;
    let mut list_depth = 0usize;
    let mut top_items: Vec<ListItem> = Vec::new();
    let mut item_stack: Vec<ListItem> = Vec::new();

    for event in MdParser::new(markdown) {
        match event {
            Event::Start(Tag::Heading { .. }) => heading = Some(String::new()),
            Event::End(TagEnd::Heading(_)) => {
                if let Some(text) = heading.take() {
                    blocks.push(Block::Heading(text.trim().to_string()));
                }
            }
            Event::Start(Tag::List(_)) => list_depth += 1,
            Event::End(TagEnd::List(_)) => {
                list_depth = list_depth.saturating_sub(1);
                if list_depth == 0 {
                    blocks.push(Block::List(std::mem::take(&mut top_items)));
                }
            }
            Event::Start(Tag::Item) => item_stack.push(ListItem::default()),
            Event::End(TagEnd::Item) => {
                if let Some(item) = item_stack.pop() {
                    match item_stack.last_mut() {
                        Some(parent) => parent.children.push(item),
                        None => top_items.push(item),
                    }
                }
            }
            Event::Start(Tag::Link { dest_url, .. }) => {
                if let Some(item) = item_stack.last_mut() {
                    if item.link.is_none() {
                        item.link = Some(dest_url.to_string());
                    }
                }
            }
            Event::Text(text) | Event::Code(text) => {
                if let Some(heading) = heading.as_mut() {
                    heading.push_str(&text);
                } else if let Some(item) = item_stack.last_mut() {
                    item.text.push_str(&text);
                }
            }
            Event::SoftBreak | Event::HardBreak => {
                if let Some(item) = item_stack.last_mut() {
                    item.text.push(' ');
                }
            }
            _ => {}
        }
    }

    blocks
}

/// Items of the first list after the titled heading, before the next heading
fn section_items<'a>(blocks: &'a [Block], title: &str) -> Option<&'a [ListItem]> {
    let start = blocks.iter().position(
        |block| matches!(block, Block::Heading(text) if text.eq_ignore_ascii_case(title)),
    )?;

    blocks[start + 1..]
        .iter()
        .take_while(|block| !matches!(block, Block::Heading(_)))
        .find_map(|block| match block {
            Block::List(items) => Some(items.as_slice()),
            Block::Heading(_) => None,
        })
}

fn to_prompt(item: &ListItem) -> Prompt {
    let text = item.text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut parameters = inline_parameters(&text);
    for child in &item.children {
        collect_nested_parameters(child, &mut parameters);
    }

    Prompt {
        text,
        link: item.link.clone(),
        parameters,
    }
}

/// `Chain: id:1, block:18000000` yields `id` and `block`
fn inline_parameters(text: &str) -> BTreeMap<String, String> {
    let mut parameters = BTreeMap::new();
    let Some((_, rest)) = text.split_once(':') else {
        return parameters;
    };
    for piece in rest.split(',') {
        if let Some((key, value)) = parse_pair(piece) {
            parameters.insert(key, value);
        }
    }
    parameters
}

/// Nested `key: value` items, depth first. Nested values win over inline ones.
fn collect_nested_parameters(item: &ListItem, parameters: &mut BTreeMap<String, String>) {
    if let Some((key, value)) = parse_pair(&item.text) {
        parameters.insert(key, value);
    }
    for child in &item.children {
        collect_nested_parameters(child, parameters);
    }
}

fn parse_pair(text: &str) -> Option<(String, String)> {
    let captures = INLINE_PARAM.captures(text)?;
    let key = captures[1].trim().to_lowercase().replace(' ', "_");
    Some((key, captures[2].to_string()))
}

//! The [`Block`] record and its [`BlockKind`].
//!
//! A block is a value: it carries no reference back to the document or to
//! the rendered element it was matched with, so sessions, caches and reports
//! can copy it freely.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of a convertible block.
///
/// The set is open through [`BlockKind::Custom`], which lets a caller plug a
/// matcher for a construct the built-in matchers don't know about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum BlockKind {
    /// `!!! note "Title"` style admonition.
    Admonition,
    /// `$$ … $$` display math.
    Math,
    /// Fenced code block.
    Code,
    /// ATX heading of the given level (1–6).
    Heading(u8),
    /// A caller-defined kind; rendered with the `block-{name}` class.
    Custom(String),
}

impl BlockKind {
    /// The stable name used in block ids and image alt text.
    pub fn name(&self) -> String {
        match self {
            BlockKind::Admonition => "admonition".into(),
            BlockKind::Math => "math".into(),
            BlockKind::Code => "code".into(),
            BlockKind::Heading(level) => format!("heading{level}"),
            BlockKind::Custom(name) => name.clone(),
        }
    }

    /// CSS selector matching every rendered block root of this kind, in
    /// document order. Used by the positional fallback, so it must not match
    /// elements rendered inside another block (a fence in an admonition body
    /// is a bare `<pre>`).
    pub fn selector(&self) -> String {
        match self {
            BlockKind::Admonition => ".admonition".into(),
            BlockKind::Math => ".math-block".into(),
            BlockKind::Code => "pre.code-block".into(),
            BlockKind::Heading(level) => format!("h{level}"),
            BlockKind::Custom(name) => format!(".block-{name}"),
        }
    }

    pub fn heading_level(&self) -> Option<u8> {
        match self {
            BlockKind::Heading(level) => Some(*level),
            _ => None,
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for BlockKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admonition" => Ok(BlockKind::Admonition),
            "math" => Ok(BlockKind::Math),
            "code" => Ok(BlockKind::Code),
            "" => Err("empty block kind".into()),
            other => match other.strip_prefix("heading").map(str::parse::<u8>) {
                Some(Ok(level @ 1..=6)) => Ok(BlockKind::Heading(level)),
                Some(_) => Err(format!("invalid heading kind '{other}'")),
                None => Ok(BlockKind::Custom(other.to_string())),
            },
        }
    }
}

impl From<BlockKind> for String {
    fn from(kind: BlockKind) -> Self {
        kind.name()
    }
}

impl TryFrom<String> for BlockKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A detected, convertible span of Markdown source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// `{kind}-{ordinal}`, stable across scans of identical content.
    pub id: String,
    pub kind: BlockKind,
    /// Raw source text of the block, delimiters included.
    pub content: String,
    /// Byte offset of the first byte of the block (inclusive).
    pub start_offset: usize,
    /// Byte offset one past the last byte of the block (exclusive).
    pub end_offset: usize,
    /// 1-based, display only.
    pub start_line: usize,
    /// 1-based, display only.
    pub end_line: usize,
    /// 0-based position among all retained blocks.
    pub sequence_index: usize,
    /// 1-based position among retained blocks of the same kind.
    pub ordinal: u32,
}

impl Block {
    pub fn len(&self) -> usize {
        self.end_offset - self.start_offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The visible text of a heading block (markers and closing hashes removed).
    pub fn heading_text(&self) -> Option<String> {
        self.kind.heading_level()?;
        let text = self.content.trim().trim_start_matches('#').trim();
        let text = text.trim_end_matches('#').trim_end();
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heading(content: &str) -> Block {
        Block {
            id: "heading2-1".into(),
            kind: BlockKind::Heading(2),
            content: content.into(),
            start_offset: 0,
            end_offset: content.len(),
            start_line: 1,
            end_line: 1,
            sequence_index: 0,
            ordinal: 1,
        }
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in [
            BlockKind::Admonition,
            BlockKind::Math,
            BlockKind::Code,
            BlockKind::Heading(3),
            BlockKind::Custom("mermaid".into()),
        ] {
            assert_eq!(kind.name().parse::<BlockKind>().unwrap(), kind);
        }
    }

    #[test]
    fn invalid_heading_level_rejected() {
        assert!("heading9".parse::<BlockKind>().is_err());
        assert!("headingx".parse::<BlockKind>().is_err());
    }

    #[test]
    fn selectors() {
        assert_eq!(BlockKind::Code.selector(), "pre.code-block");
        assert_eq!(BlockKind::Heading(4).selector(), "h4");
        assert_eq!(BlockKind::Custom("chart".into()).selector(), ".block-chart");
    }

    #[test]
    fn heading_text_strips_markers() {
        assert_eq!(heading("## Intro ##").heading_text().as_deref(), Some("Intro"));
        assert_eq!(heading("##   Spaced  ").heading_text().as_deref(), Some("Spaced"));
    }

    #[test]
    fn kind_serialises_as_name() {
        let json = serde_json::to_string(&BlockKind::Heading(2)).unwrap();
        assert_eq!(json, "\"heading2\"");
    }
}

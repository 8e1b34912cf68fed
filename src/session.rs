//! The state of one conversion, from scan to substitution.

use crate::block::Block;
use crate::markers::document_version;
use crate::output::{BlockOutcome, ConversionStats};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Lifecycle of a [`ConversionSession`].
///
/// `idle → scanning → correlating → capturing → uploading → ready`; any
/// non-idle state can fall to `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Scanning,
    Correlating,
    Capturing,
    Uploading,
    Ready,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Correlating => "correlating",
            Self::Capturing => "capturing",
            Self::Uploading => "uploading",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    /// A run is between start and a terminal state.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            Self::Scanning | Self::Correlating | Self::Capturing | Self::Uploading
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-block replacement state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementEntry {
    pub image_url: Option<String>,
    pub uploaded: bool,
    pub uploading: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionSession {
    /// The text the block offsets point into; never modified.
    pub source_text: String,
    pub document_version: String,
    pub blocks: Vec<Block>,
    pub replacements: BTreeMap<String, ReplacementEntry>,
    pub outcomes: Vec<BlockOutcome>,
    pub stats: ConversionStats,
    pub status: SessionStatus,
}

impl ConversionSession {
    pub fn new(source_text: impl Into<String>) -> Self {
        let source_text = source_text.into();
        Self {
            document_version: document_version(&source_text),
            source_text,
            blocks: Vec::new(),
            replacements: BTreeMap::new(),
            outcomes: Vec::new(),
            stats: ConversionStats::default(),
            status: SessionStatus::Scanning,
        }
    }

    pub fn set_blocks(&mut self, blocks: Vec<Block>) {
        self.replacements = blocks
            .iter()
            .map(|b| (b.id.clone(), ReplacementEntry::default()))
            .collect();
        self.blocks = blocks;
    }

    /// Blocks whose upload has started but not completed.
    pub fn pending_uploads(&self) -> usize {
        self.replacements
            .values()
            .filter(|r| r.uploading && !r.uploaded)
            .count()
    }

    pub fn mark_uploading(&mut self, block_id: &str) {
        if let Some(entry) = self.replacements.get_mut(block_id) {
            entry.uploading = true;
        }
    }

    pub fn mark_uploaded(&mut self, block_id: &str, url: &str) {
        if let Some(entry) = self.replacements.get_mut(block_id) {
            entry.image_url = Some(url.to_string());
            entry.uploaded = true;
            entry.uploading = false;
        }
    }

    pub fn mark_failed(&mut self, block_id: &str) {
        if let Some(entry) = self.replacements.get_mut(block_id) {
            entry.uploading = false;
        }
    }

    /// `BlockId → URL` for every resolved block.
    pub fn url_map(&self) -> HashMap<String, String> {
        self.replacements
            .iter()
            .filter_map(|(id, r)| r.image_url.as_ref().map(|u| (id.clone(), u.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::scan::scan;

    #[test]
    fn status_display_and_serde_agree() {
        for status in [
            SessionStatus::Idle,
            SessionStatus::Capturing,
            SessionStatus::Ready,
            SessionStatus::Failed,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
        assert!(SessionStatus::Uploading.is_running());
        assert!(!SessionStatus::Ready.is_running());
    }

    #[test]
    fn replacement_bookkeeping() {
        let doc = "```\na\n```\n\n$$b$$\n";
        let mut session = ConversionSession::new(doc);
        session.set_blocks(scan(doc));
        assert_eq!(session.replacements.len(), 2);

        session.mark_uploading("code-1");
        session.mark_uploading("math-1");
        assert_eq!(session.pending_uploads(), 2);

        session.mark_uploaded("code-1", "u");
        session.mark_failed("math-1");
        assert_eq!(session.pending_uploads(), 0);
        assert_eq!(session.url_map().get("code-1").map(String::as_str), Some("u"));
        assert!(!session.url_map().contains_key("math-1"));
    }
}

//! Result types produced by a conversion.

use crate::error::{BlockError, BlockWarning};
use serde::{Deserialize, Serialize};

/// How a resolved block got its URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlSource {
    /// Captured and uploaded in this run.
    Uploaded,
    /// Captured, but identical content was already in the upload cache.
    Cache,
    /// Already marked as uploaded for this document version; not captured.
    Marker,
}

/// Terminal result for one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockOutcome {
    pub block_id: String,
    pub kind: String,
    /// Image URL; `None` when the block failed.
    pub url: Option<String>,
    pub source: Option<UrlSource>,
    /// SHA-256 hex of the captured bytes, when a capture happened.
    pub content_hash: Option<String>,
    /// Upload retries used.
    pub retries: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<BlockWarning>,
    pub error: Option<BlockError>,
}

impl BlockOutcome {
    pub(crate) fn failed(block_id: &str, kind: &str, error: BlockError, duration_ms: u64) -> Self {
        Self {
            block_id: block_id.to_string(),
            kind: kind.to_string(),
            url: None,
            source: None,
            content_hash: None,
            retries: 0,
            duration_ms,
            warnings: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.url.is_some()
    }
}

/// Aggregate numbers for one conversion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionStats {
    pub total_blocks: usize,
    pub converted_blocks: usize,
    pub failed_blocks: usize,
    /// Blocks whose upload was served from the content cache.
    pub cached_blocks: usize,
    /// Blocks resolved from uploaded markers without a capture.
    pub reused_blocks: usize,
    /// Candidates dropped by the nesting filter.
    pub skipped_nested: usize,
    pub capture_duration_ms: u64,
    pub upload_duration_ms: u64,
    pub total_duration_ms: u64,
}

impl ConversionStats {
    /// "N of M blocks converted successfully".
    pub fn summary_line(&self) -> String {
        format!(
            "{} of {} blocks converted successfully",
            self.converted_blocks, self.total_blocks
        )
    }
}

/// What a finished conversion hands back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionReport {
    pub document_version: String,
    pub outcomes: Vec<BlockOutcome>,
    pub stats: ConversionStats,
}

/// Result of applying the replacements to the source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstitutionOutput {
    pub text: String,
    pub substituted_count: usize,
    pub total_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_line_reads_naturally() {
        let stats = ConversionStats {
            total_blocks: 4,
            converted_blocks: 3,
            failed_blocks: 1,
            ..Default::default()
        };
        assert_eq!(stats.summary_line(), "3 of 4 blocks converted successfully");
    }

    #[test]
    fn outcome_serialises_without_empty_warnings() {
        let outcome = BlockOutcome {
            block_id: "code-1".into(),
            kind: "code".into(),
            url: Some("u".into()),
            source: Some(UrlSource::Cache),
            content_hash: None,
            retries: 0,
            duration_ms: 3,
            warnings: Vec::new(),
            error: None,
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"source\":\"cache\""));
        assert!(!json.contains("warnings"));
        assert!(outcome.is_success());
    }
}

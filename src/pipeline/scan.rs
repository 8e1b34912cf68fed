//! Block scanning: locate convertible regions in raw Markdown.
//!
//! Each [`BlockMatcher`] scans the whole document on its own and may report
//! candidates that overlap another matcher's. The scanner then:
//!
//! 1. drops degenerate (zero-length) candidates,
//! 2. sorts by start offset (ties keep matcher order),
//! 3. discards candidates strictly contained in another one (the outer block
//!    is rendered as a single image, nested constructs included),
//! 4. discards partial overlaps and duplicate spans (earlier start wins),
//! 5. numbers the survivors per kind through the [`IdAllocator`].
//!
//! Offsets are byte offsets into the input `&str`, always on char boundaries.

use crate::block::{Block, BlockKind};
use crate::error::ScanError;
use crate::pipeline::ids::{block_id, IdAllocator, KindCounters};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// A raw match reported by a [`BlockMatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub kind: BlockKind,
    pub start: usize,
    pub end: usize,
}

impl Candidate {
    /// `true` when `other` lies inside this span and is not the same span.
    pub fn strictly_contains(&self, other: &Candidate) -> bool {
        self.start <= other.start
            && other.end <= self.end
            && (self.start, self.end) != (other.start, other.end)
    }
}

/// Locates one kind of block anywhere in a document.
pub trait BlockMatcher: Send + Sync {
    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Every candidate in `markdown`, in any order.
    fn find(&self, markdown: &str) -> Vec<Candidate>;
}

/// Which built-in matchers run during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    pub admonitions: bool,
    pub math: bool,
    pub code: bool,
    /// Inclusive heading level range to convert, e.g. `(2, 4)`. `None`
    /// disables heading conversion.
    pub heading_levels: Option<(u8, u8)>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            admonitions: true,
            math: true,
            code: true,
            heading_levels: None,
        }
    }
}

impl ScanConfig {
    /// Instantiate the enabled built-in matchers, in tie-break order.
    pub fn matchers(&self) -> Vec<Box<dyn BlockMatcher>> {
        let mut matchers: Vec<Box<dyn BlockMatcher>> = Vec::new();
        if self.admonitions {
            matchers.push(Box::new(AdmonitionMatcher));
        }
        if self.math {
            matchers.push(Box::new(MathMatcher));
        }
        if self.code {
            matchers.push(Box::new(CodeFenceMatcher));
        }
        if let Some((min, max)) = self.heading_levels {
            matchers.push(Box::new(HeadingMatcher::new(min, max)));
        }
        matchers
    }
}

/// Why a candidate did not become a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Strictly inside another candidate of the given kind.
    Nested { within: BlockKind },
    /// Starts inside an earlier block but extends past its end.
    Overlap,
    /// Same span as an earlier candidate from another matcher.
    Duplicate,
}

/// A candidate discarded by the nesting/overlap filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedCandidate {
    pub kind: BlockKind,
    pub start_offset: usize,
    pub end_offset: usize,
    pub reason: SkipReason,
}

/// Result of a scan, with the discarded candidates kept for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub blocks: Vec<Block>,
    pub skipped: Vec<SkippedCandidate>,
}

impl ScanReport {
    /// Number of candidates dropped because they sat inside another block.
    pub fn nested_count(&self) -> usize {
        self.skipped
            .iter()
            .filter(|s| matches!(s.reason, SkipReason::Nested { .. }))
            .count()
    }
}

/// A configured set of matchers.
pub struct BlockScanner {
    matchers: Vec<Box<dyn BlockMatcher>>,
}

impl BlockScanner {
    pub fn new(config: &ScanConfig) -> Self {
        Self {
            matchers: config.matchers(),
        }
    }

    /// Append a matcher; it ranks after the built-ins on ties.
    pub fn with_matcher(mut self, matcher: Box<dyn BlockMatcher>) -> Self {
        self.matchers.push(matcher);
        self
    }

    /// Scan `markdown`, numbering blocks through `ids` (which is reset first).
    pub fn scan(&self, markdown: &str, ids: &mut dyn IdAllocator) -> ScanReport {
        ids.reset();

        // (candidate, matcher rank)
        let mut candidates: Vec<(Candidate, usize)> = Vec::new();
        for (rank, matcher) in self.matchers.iter().enumerate() {
            for c in matcher.find(markdown) {
                if let Err(e) = check_candidate(matcher.name(), &c, markdown) {
                    trace!("{}", e);
                    continue;
                }
                candidates.push((c, rank));
            }
        }
        candidates.sort_by_key(|(c, rank)| (c.start, *rank));

        let mut skipped = Vec::new();

        // Pairwise containment check; n is the number of special blocks in
        // one document, so quadratic is fine.
        let mut outer: Vec<&Candidate> = Vec::with_capacity(candidates.len());
        for (c, _) in &candidates {
            let container = candidates
                .iter()
                .map(|(d, _)| d)
                .find(|d| d.strictly_contains(c));
            match container {
                Some(d) => skipped.push(SkippedCandidate {
                    kind: c.kind.clone(),
                    start_offset: c.start,
                    end_offset: c.end,
                    reason: SkipReason::Nested {
                        within: d.kind.clone(),
                    },
                }),
                None => outer.push(c),
            }
        }

        // Survivors are sorted and mutually non-nested, so the last retained
        // candidate always has the largest end.
        let mut retained: Vec<&Candidate> = Vec::with_capacity(outer.len());
        for c in outer {
            if let Some(last) = retained.last() {
                if c.start < last.end {
                    let reason = if (c.start, c.end) == (last.start, last.end) {
                        SkipReason::Duplicate
                    } else {
                        SkipReason::Overlap
                    };
                    skipped.push(SkippedCandidate {
                        kind: c.kind.clone(),
                        start_offset: c.start,
                        end_offset: c.end,
                        reason,
                    });
                    continue;
                }
            }
            retained.push(c);
        }

        let blocks: Vec<Block> = retained
            .into_iter()
            .enumerate()
            .map(|(sequence_index, c)| {
                let ordinal = ids.next(&c.kind);
                let content = &markdown[c.start..c.end];
                let start_line = line_of(markdown, c.start);
                let end_line = start_line + content.trim_end_matches(['\n', '\r']).matches('\n').count();
                Block {
                    id: block_id(&c.kind, ordinal),
                    kind: c.kind.clone(),
                    content: content.to_string(),
                    start_offset: c.start,
                    end_offset: c.end,
                    start_line,
                    end_line,
                    sequence_index,
                    ordinal,
                }
            })
            .collect();

        if !skipped.is_empty() {
            debug!(
                "Scan kept {} blocks, skipped {} candidates ({} nested)",
                blocks.len(),
                skipped.len(),
                skipped
                    .iter()
                    .filter(|s| matches!(s.reason, SkipReason::Nested { .. }))
                    .count()
            );
        }

        ScanReport { blocks, skipped }
    }
}

/// Scan with the default matchers and a fresh allocator.
pub fn scan(markdown: &str) -> Vec<Block> {
    scan_with(markdown, &ScanConfig::default(), &mut KindCounters::new()).blocks
}

/// Scan with an explicit configuration and allocator.
pub fn scan_with(markdown: &str, config: &ScanConfig, ids: &mut dyn IdAllocator) -> ScanReport {
    BlockScanner::new(config).scan(markdown, ids)
}

fn check_candidate(matcher: &'static str, c: &Candidate, markdown: &str) -> Result<(), ScanError> {
    let degenerate = c.start >= c.end
        || c.end > markdown.len()
        || !markdown.is_char_boundary(c.start)
        || !markdown.is_char_boundary(c.end);
    if degenerate {
        return Err(ScanError::Degenerate {
            matcher,
            offset: c.start,
        });
    }
    Ok(())
}

fn line_of(markdown: &str, offset: usize) -> usize {
    markdown[..offset].matches('\n').count() + 1
}

/// Lines with their starting byte offset; each slice keeps its `\n`.
fn lines_with_offsets(markdown: &str) -> Vec<(usize, &str)> {
    let mut offset = 0;
    markdown
        .split_inclusive('\n')
        .map(|line| {
            let start = offset;
            offset += line.len();
            (start, line)
        })
        .collect()
}

fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

fn is_indented(line: &str) -> bool {
    line.starts_with("    ") || line.starts_with('\t')
}

fn strip_newline(line: &str) -> &str {
    line.trim_end_matches('\n').trim_end_matches('\r')
}

// ── Admonitions ──────────────────────────────────────────────────────────────

static RE_ADMONITION_HEAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:!!!|\?\?\?\+?)[ \t]*[A-Za-z]").unwrap());

/// `!!! type "title"` through the first blank line that is not followed by
/// an indented continuation. The terminating blank line belongs to the
/// block; without one the admonition is not matched at all, so a missing
/// blank line never swallows the rest of the document.
pub struct AdmonitionMatcher;

impl BlockMatcher for AdmonitionMatcher {
    fn name(&self) -> &'static str {
        "admonition"
    }

    fn find(&self, markdown: &str) -> Vec<Candidate> {
        let lines = lines_with_offsets(markdown);
        let mut found = Vec::new();
        let mut i = 0;

        while i < lines.len() {
            let (start, head) = lines[i];
            if !RE_ADMONITION_HEAD.is_match(head) {
                i += 1;
                continue;
            }

            let mut end = None;
            let mut j = i + 1;
            while j < lines.len() {
                let (offset, line) = lines[j];
                if is_blank(line) {
                    let continues = lines
                        .get(j + 1)
                        .is_some_and(|(_, next)| !is_blank(next) && is_indented(next));
                    if !continues {
                        end = Some(offset + line.len());
                        break;
                    }
                }
                j += 1;
            }

            match end {
                Some(end) => {
                    found.push(Candidate {
                        kind: BlockKind::Admonition,
                        start,
                        end,
                    });
                    i = j + 1;
                }
                None => {
                    trace!("Unterminated admonition at byte {} ignored", start);
                    i += 1;
                }
            }
        }

        found
    }
}

// ── Display math ─────────────────────────────────────────────────────────────

static RE_DISPLAY_MATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\$\$(.+?)\$\$").unwrap());

/// Paired `$$ … $$` delimiters with a non-blank body.
pub struct MathMatcher;

impl BlockMatcher for MathMatcher {
    fn name(&self) -> &'static str {
        "math"
    }

    fn find(&self, markdown: &str) -> Vec<Candidate> {
        RE_DISPLAY_MATH
            .captures_iter(markdown)
            .filter(|caps| !caps[1].trim().is_empty())
            .filter_map(|caps| caps.get(0))
            .map(|m| Candidate {
                kind: BlockKind::Math,
                start: m.start(),
                end: m.end(),
            })
            .collect()
    }
}

// ── Fenced code ──────────────────────────────────────────────────────────────

/// ```` ``` ```` or `~~~` fences, any indentation, closed by a fence of the
/// same character that is at least as long. The span ends at the end of the
/// closing fence line, newline excluded.
pub struct CodeFenceMatcher;

fn opening_fence(line: &str) -> Option<(char, usize)> {
    let trimmed = strip_newline(line).trim_start_matches([' ', '\t']);
    let fence_char = trimmed.chars().next().filter(|c| *c == '`' || *c == '~')?;
    let len = trimmed.chars().take_while(|c| *c == fence_char).count();
    if len < 3 {
        return None;
    }
    let info = &trimmed[len..];
    if fence_char == '`' && info.contains('`') {
        return None;
    }
    Some((fence_char, len))
}

fn closes_fence(line: &str, fence_char: char, fence_len: usize) -> bool {
    let trimmed = strip_newline(line).trim_start_matches([' ', '\t']);
    let len = trimmed.chars().take_while(|c| *c == fence_char).count();
    len >= fence_len && trimmed[len..].trim().is_empty()
}

impl BlockMatcher for CodeFenceMatcher {
    fn name(&self) -> &'static str {
        "code"
    }

    fn find(&self, markdown: &str) -> Vec<Candidate> {
        let lines = lines_with_offsets(markdown);
        let mut found = Vec::new();
        let mut i = 0;

        while i < lines.len() {
            let (start, line) = lines[i];
            let Some((fence_char, fence_len)) = opening_fence(line) else {
                i += 1;
                continue;
            };

            let close = (i + 1..lines.len()).find(|&j| closes_fence(lines[j].1, fence_char, fence_len));
            match close {
                Some(j) => {
                    let (offset, closing) = lines[j];
                    found.push(Candidate {
                        kind: BlockKind::Code,
                        start,
                        end: offset + strip_newline(closing).len(),
                    });
                    i = j + 1;
                }
                None => {
                    // An unclosed fence runs to the end of the document when
                    // rendered; nothing after it can be a separate block.
                    trace!("Unterminated code fence at byte {} ignored", start);
                    break;
                }
            }
        }

        found
    }
}

// ── Headings ─────────────────────────────────────────────────────────────────

static RE_ATX_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(#{1,6})[ \t]+\S[^\n]*$").unwrap());

/// ATX headings whose level lies in an inclusive range.
pub struct HeadingMatcher {
    min: u8,
    max: u8,
}

impl HeadingMatcher {
    pub fn new(min: u8, max: u8) -> Self {
        let min = min.clamp(1, 6);
        Self {
            min,
            max: max.clamp(min, 6),
        }
    }
}

impl BlockMatcher for HeadingMatcher {
    fn name(&self) -> &'static str {
        "heading"
    }

    fn find(&self, markdown: &str) -> Vec<Candidate> {
        RE_ATX_HEADING
            .captures_iter(markdown)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let level = caps[1].len() as u8;
                if level < self.min || level > self.max {
                    return None;
                }
                let text = whole.as_str().trim_end_matches('\r');
                Some(Candidate {
                    kind: BlockKind::Heading(level),
                    start: whole.start(),
                    end: whole.start() + text.len(),
                })
            })
            .collect()
    }
}

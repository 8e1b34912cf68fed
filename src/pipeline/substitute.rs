//! Offset-safe text substitution.
//!
//! Every block carries byte offsets into the frozen source. Replacing spans
//! back-to-front means an edit never shifts the offsets of spans that are
//! still to be processed, so the block list is sorted by descending
//! `start_offset` here rather than trusting the caller's order.

use crate::block::Block;
use crate::output::SubstitutionOutput;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Image reference that replaces a block.
pub fn image_reference(block: &Block, url: &str) -> String {
    format!("![{}]({})", block.kind.name(), url)
}

/// Replace each block that has a URL in `replacements` with an image
/// reference. Blocks without a URL are left untouched.
pub fn apply(
    source: &str,
    blocks: &[Block],
    replacements: &HashMap<String, String>,
) -> SubstitutionOutput {
    let mut ordered: Vec<&Block> = blocks.iter().collect();
    ordered.sort_by(|a, b| b.start_offset.cmp(&a.start_offset));

    let mut text = source.to_string();
    let mut substituted_count = 0;
    // Start of the lowest span replaced so far; later spans must end before it.
    let mut floor = source.len();

    for block in ordered {
        let Some(url) = replacements.get(&block.id) else {
            continue;
        };

        let (start, end) = (block.start_offset, block.end_offset);
        if start >= end
            || end > floor
            || !source.is_char_boundary(start)
            || !source.is_char_boundary(end)
        {
            warn!(
                "Skipping {}: span {}..{} is not a valid range of the source",
                block.id, start, end
            );
            continue;
        }

        let span = &source[start..end];
        // Line breaks after the last visible character, including those of
        // whitespace-only lines, keep the block's separation from what follows.
        let trailing: String = span[span.trim_end().len()..]
            .chars()
            .filter(|c| matches!(c, '\n' | '\r'))
            .collect();
        let replacement = format!("{}{}", image_reference(block, url), trailing);
        text.replace_range(start..end, &replacement);
        floor = start;
        substituted_count += 1;
        debug!("Substituted {} ({} bytes → {})", block.id, end - start, replacement.len());
    }

    SubstitutionOutput {
        text,
        substituted_count,
        total_count: blocks.len(),
    }
}

//! Correlation: map each scanned block to its rendered element.
//!
//! Matching runs an explicit chain of [`MatchStrategy`] values per block and
//! stops at the first hit:
//!
//! 1. [`ByIdentity`]: the element stamped with `data-block-id="{id}"`.
//! 2. [`ByKindPosition`]: the `ordinal`-th element matching the kind's
//!    selector, assuming the renderer emits same-kind elements in document
//!    order.
//! 3. [`ByHeadingText`]: headings only: the first unclaimed `hN` whose
//!    trimmed text equals the heading's text. Duplicate heading text at one
//!    level is inherently ambiguous; first-available wins.
//!
//! An element claimed by one block is never handed to another.

use crate::block::Block;
use crate::dom::{attribute_selector, DomRoot, ElementKey, ElementRef};
use crate::error::{BlockshotError, MissingBlock};
use crate::render::IDENTITY_ATTRIBUTE;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// What a strategy can see while matching one block.
pub struct MatchContext<'a> {
    pub root: &'a dyn DomRoot,
    pub identity_attribute: &'a str,
    /// Elements already matched to earlier blocks.
    pub claimed: &'a HashSet<ElementKey>,
}

/// One way of finding a block's element.
pub trait MatchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn find(&self, block: &Block, cx: &MatchContext<'_>) -> Option<ElementRef>;
}

/// Primary: explicit identity attribute.
pub struct ByIdentity;

impl MatchStrategy for ByIdentity {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn find(&self, block: &Block, cx: &MatchContext<'_>) -> Option<ElementRef> {
        cx.root
            .query(&attribute_selector(cx.identity_attribute, &block.id))
            .filter(|el| !cx.claimed.contains(&el.key()))
    }
}

/// Fallback: position among same-kind elements.
pub struct ByKindPosition;

impl MatchStrategy for ByKindPosition {
    fn name(&self) -> &'static str {
        "position"
    }

    fn find(&self, block: &Block, cx: &MatchContext<'_>) -> Option<ElementRef> {
        let index = (block.ordinal as usize).checked_sub(1)?;
        cx.root
            .query_all(&block.kind.selector())
            .into_iter()
            .nth(index)
            .filter(|el| !cx.claimed.contains(&el.key()))
    }
}

/// Heading fallback: exact trimmed text among headings of the same level.
pub struct ByHeadingText;

impl MatchStrategy for ByHeadingText {
    fn name(&self) -> &'static str {
        "heading-text"
    }

    fn find(&self, block: &Block, cx: &MatchContext<'_>) -> Option<ElementRef> {
        let level = block.kind.heading_level()?;
        let text = block.heading_text()?;
        cx.root
            .query_all(&format!("h{level}"))
            .into_iter()
            .find(|el| !cx.claimed.contains(&el.key()) && el.text_content().trim() == text)
    }
}

/// The match (or miss) for one block.
#[derive(Debug, Clone)]
pub struct CorrelationEntry {
    pub block_id: String,
    pub kind: String,
    pub element: Option<ElementRef>,
    /// Name of the strategy that matched.
    pub strategy: Option<&'static str>,
}

/// Result of correlating a block list against a DOM.
#[derive(Debug, Clone, Default)]
pub struct Correlation {
    pub entries: Vec<CorrelationEntry>,
}

impl Correlation {
    pub fn get(&self, block_id: &str) -> Option<&ElementRef> {
        self.entries
            .iter()
            .find(|e| e.block_id == block_id)
            .and_then(|e| e.element.as_ref())
    }

    pub fn unmatched(&self) -> Vec<MissingBlock> {
        self.entries
            .iter()
            .filter(|e| e.element.is_none())
            .map(|e| MissingBlock {
                id: e.block_id.clone(),
                kind: e.kind.clone(),
            })
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.entries.iter().all(|e| e.element.is_some())
    }

    /// Every block matched, or [`BlockshotError::CorrelationFailed`] naming
    /// the ones that did not.
    pub fn into_matched(self) -> Result<HashMap<String, ElementRef>, BlockshotError> {
        let missing = self.unmatched();
        if !missing.is_empty() {
            return Err(BlockshotError::CorrelationFailed { missing });
        }
        Ok(self
            .entries
            .into_iter()
            .filter_map(|e| e.element.map(|el| (e.block_id, el)))
            .collect())
    }
}

/// Runs a strategy chain over a block list.
pub struct ElementCorrelator {
    identity_attribute: String,
    strategies: Vec<Box<dyn MatchStrategy>>,
}

impl Default for ElementCorrelator {
    fn default() -> Self {
        Self::new(IDENTITY_ATTRIBUTE)
    }
}

impl ElementCorrelator {
    /// Standard chain: identity → position → heading text.
    pub fn new(identity_attribute: impl Into<String>) -> Self {
        Self::with_strategies(
            identity_attribute,
            vec![Box::new(ByIdentity), Box::new(ByKindPosition), Box::new(ByHeadingText)],
        )
    }

    pub fn with_strategies(
        identity_attribute: impl Into<String>,
        strategies: Vec<Box<dyn MatchStrategy>>,
    ) -> Self {
        Self {
            identity_attribute: identity_attribute.into(),
            strategies,
        }
    }

    pub fn correlate(&self, blocks: &[Block], root: &dyn DomRoot) -> Correlation {
        let mut claimed = HashSet::new();
        let mut entries = Vec::with_capacity(blocks.len());

        for block in blocks {
            let mut hit = None;
            for strategy in &self.strategies {
                let cx = MatchContext {
                    root,
                    identity_attribute: &self.identity_attribute,
                    claimed: &claimed,
                };
                if let Some(el) = strategy.find(block, &cx) {
                    hit = Some((el, strategy.name()));
                    break;
                }
            }

            match &hit {
                Some((el, name)) => {
                    debug!("Block {} matched by {}", block.id, name);
                    claimed.insert(el.key());
                }
                None => warn!("Block {} ({}) has no rendered element", block.id, block.kind),
            }

            let (element, strategy) = match hit {
                Some((el, name)) => (Some(el), Some(name)),
                None => (None, None),
            };
            entries.push(CorrelationEntry {
                block_id: block.id.clone(),
                kind: block.kind.name(),
                element,
                strategy,
            });
        }

        Correlation { entries }
    }
}

/// Correlate with the standard chain and the default identity attribute.
pub fn correlate(blocks: &[Block], root: &dyn DomRoot) -> Correlation {
    ElementCorrelator::default().correlate(blocks, root)
}

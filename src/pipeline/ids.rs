//! Block id allocation shared by the scanner and the renderer.
//!
//! The renderer stamps `data-block-id` on every special element and the
//! correlator looks those ids up again, so both sides must number blocks the
//! same way. Instead of a global counter, each scan/render cycle takes an
//! explicit [`IdAllocator`] and calls [`IdAllocator::reset`] first.

use crate::block::BlockKind;
use std::collections::HashMap;

/// Hands out 1-based ordinals per block kind.
pub trait IdAllocator: Send {
    /// Forget every counter. Called at the start of each scan.
    fn reset(&mut self);

    /// Next ordinal for `kind`, starting at 1.
    fn next(&mut self, kind: &BlockKind) -> u32;
}

/// Default allocator: one monotonically increasing counter per kind.
#[derive(Debug, Default, Clone)]
pub struct KindCounters {
    counters: HashMap<BlockKind, u32>,
}

impl KindCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdAllocator for KindCounters {
    fn reset(&mut self) {
        self.counters.clear();
    }

    fn next(&mut self, kind: &BlockKind) -> u32 {
        let counter = self.counters.entry(kind.clone()).or_insert(0);
        *counter += 1;
        *counter
    }
}

/// Format a block id from its kind and ordinal.
pub fn block_id(kind: &BlockKind, ordinal: u32) -> String {
    format!("{}-{}", kind.name(), ordinal)
}

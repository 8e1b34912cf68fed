//! Pipeline stages for block-to-image conversion.
//!
//! Each submodule implements exactly one transformation step, so each is
//! testable on its own and a host can swap collaborators (DOM, rasterizer,
//! image host) without touching the others.
//!
//! ## Data Flow
//!
//! ```text
//! scan ──▶ correlate ──▶ capture ──▶ encode ──▶ cache/upload ──▶ substitute
//! (blocks)  (elements)   (bytes)    (validated)  (URLs)           (Markdown)
//! ```
//!
//! 1. [`ids`]       : per-kind ordinal allocator shared by scanner and renderer
//! 2. [`scan`]      : locate blocks, filter nesting and overlap, assign ids
//! 3. [`correlate`] : strategy chain mapping each block to a DOM element
//! 4. [`capture`]   : temporary style overrides around one rasterization
//! 5. [`encode`]    : decode data URLs, sniff format, read dimensions
//! 6. [`cache`]     : SHA-256 content-addressed URL cache with TTL
//! 7. [`upload`]    : uploader trait, retry/backoff, availability polling;
//!    the only stage with network I/O
//! 8. [`substitute`]: descending-offset rewrite of the source text

pub mod cache;
pub mod capture;
pub mod correlate;
pub mod encode;
pub mod ids;
pub mod scan;
pub mod substitute;
pub mod upload;

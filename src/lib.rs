//! # blockshot
//!
//! Turn the rich blocks of a Markdown document (admonitions, display math,
//! fenced code, optionally headings) into uploaded images, and substitute
//! image references back into the Markdown.
//!
//! ## Why this crate?
//!
//! Publishing targets such as WeChat official accounts strip anything beyond
//! basic Markdown: admonitions lose their boxes, formulas show up as raw
//! TeX, code loses its highlighting. Shipping those blocks as images keeps
//! them intact. The hard part is doing it reliably: every block must map to
//! the right rendered element, be captured exactly once, and land back at
//! the right byte offsets without disturbing the text around it.
//!
//! ## Pipeline Overview
//!
//! ```text
//! Markdown
//!  │
//!  ├─ 1. Scan        locate blocks, assign stable ids (code-1, math-2, …)
//!  ├─ 2. Correlate   match each block to its rendered element
//!  ├─ 3. Capture     rasterize each element (style overrides, always restored)
//!  ├─ 4. Upload      content-addressed cache, retry with backoff
//!  └─ 5. Substitute  back-to-front rewrite of the frozen source text
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(feature = "chrome")]
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use blockshot::browser::ChromeSession;
//! use blockshot::pipeline::upload::DirUploader;
//! use blockshot::{render, html_page, Collaborators, ConversionConfig, ConversionOrchestrator, MemoryStore};
//! use std::sync::Arc;
//!
//! let markdown = std::fs::read_to_string("post.md")?;
//! let page = html_page(&render(&markdown), 677, None);
//! let chrome = ChromeSession::open(page, 677).await?;
//!
//! let orchestrator = ConversionOrchestrator::new(
//!     ConversionConfig::default(),
//!     Collaborators::new(Arc::new(chrome.raster()), Arc::new(DirUploader::new("images"))),
//!     Arc::new(MemoryStore::new()),
//! );
//! let (output, report) = orchestrator.convert_document(&markdown, &chrome.dom()).await?;
//! println!("{}", output.text);
//! eprintln!("{}", report.stats.summary_line());
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature  | Default | Description |
//! |----------|---------|-------------|
//! | `cli`    | on      | Enables the `blockshot` binary (clap + anyhow + tracing-subscriber + indicatif) |
//! | `chrome` | on      | Headless Chrome DOM and rasterizer ([`browser`]) |
//!
//! Disable both when embedding the library with your own DOM and rasterizer:
//! ```toml
//! blockshot = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod block;
#[cfg(feature = "chrome")]
pub mod browser;
pub mod config;
pub mod convert;
pub mod dom;
pub mod error;
pub mod markers;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod render;
pub mod session;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use block::{Block, BlockKind};
pub use config::{ConversionConfig, ConversionConfigBuilder};
pub use convert::{write_output, Collaborators, ConversionOrchestrator};
pub use dom::{DomElement, DomRoot, ElementRef, MemoryDom, MemoryElement};
pub use error::{BlockError, BlockWarning, BlockshotError, DomError, MissingBlock};
pub use markers::{document_version, UploadedMarkers};
pub use output::{BlockOutcome, ConversionReport, ConversionStats, SubstitutionOutput, UrlSource};
pub use pipeline::correlate::{correlate, Correlation, ElementCorrelator};
pub use pipeline::scan::{scan, scan_with, BlockScanner, ScanConfig, ScanReport};
pub use progress::{
    ConversionProgressCallback, LogNotifier, NoopNotifier, NoopProgressCallback, Notifier, ProgressCallback,
};
pub use render::{html_page, render, render_with, RenderedDocument};
pub use session::{ConversionSession, ReplacementEntry, SessionStatus};
pub use store::{JsonFileStore, KvStore, MemoryStore};

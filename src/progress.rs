//! Progress events and user-facing notifications.
//!
//! Two hooks with different audiences:
//!
//! * [`ConversionProgressCallback`]: fine-grained per-block events for
//!   progress bars and dashboards. Injected via
//!   [`crate::config::ConversionConfigBuilder::progress_callback`].
//! * [`Notifier`]: the few human-readable messages a user should see
//!   (batch summary, fatal errors), fire-and-forget. Injected as an
//!   orchestrator collaborator.
//!
//! # Why callbacks instead of channels?
//!
//! Callers can forward events to a channel, a WebSocket, or a terminal
//! progress bar without the library knowing how the host communicates. Both
//! traits are `Send + Sync` because uploads run concurrently.
//!
//! # Example
//!
//! ```rust
//! use blockshot::{ConversionProgressCallback, ConversionConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl ConversionProgressCallback for CountingCallback {
//!     fn on_block_complete(&self, block_id: &str, total_blocks: usize, url: &str) {
//!         let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{block_id} → {url} ({done}/{total_blocks})");
//!     }
//! }
//!
//! let config = ConversionConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { completed: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;
use tracing::{error, info};

/// Called by the orchestrator as it processes each block.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Block events may arrive concurrently and out of
/// document order.
pub trait ConversionProgressCallback: Send + Sync {
    /// Called once after scanning, before any block is captured.
    fn on_conversion_start(&self, total_blocks: usize) {
        let _ = total_blocks;
    }

    /// Called just before a block is captured.
    ///
    /// # Arguments
    /// * `block_id`    : e.g. `code-2`
    /// * `index`       : 0-based position in document order
    /// * `total_blocks`: blocks in the document
    fn on_block_start(&self, block_id: &str, index: usize, total_blocks: usize) {
        let _ = (block_id, index, total_blocks);
    }

    /// Called when a block has its URL.
    fn on_block_complete(&self, block_id: &str, total_blocks: usize, url: &str) {
        let _ = (block_id, total_blocks, url);
    }

    /// Called when a block failed to capture or upload.
    fn on_block_error(&self, block_id: &str, total_blocks: usize, error: &str) {
        let _ = (block_id, total_blocks, error);
    }

    /// Called once after every block has a terminal outcome.
    fn on_conversion_complete(&self, total_blocks: usize, success_count: usize) {
        let _ = (total_blocks, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ConversionConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;

/// User-facing notifications.
pub trait Notifier: Send + Sync {
    fn success(&self, message: &str);
    fn error(&self, message: &str);
    fn info(&self, message: &str);
}

/// Discards every notification.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn success(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
    fn info(&self, _message: &str) {}
}

/// Routes notifications into the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn success(&self, message: &str) {
        info!("{}", message);
    }

    fn error(&self, message: &str) {
        error!("{}", message);
    }

    fn info(&self, message: &str) {
        info!("{}", message);
    }
}

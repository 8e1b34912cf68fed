//! Error types for the blockshot library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`BlockshotError`]: **Fatal**: the batch cannot proceed at all
//!   (a block has no rendered counterpart, another session is still
//!   uploading, the configuration is invalid). Returned as
//!   `Err(BlockshotError)` from the orchestrator entry points.
//!
//! * [`BlockError`]: **Non-fatal**: a single block failed to capture or
//!   upload, but every other block is fine. Stored inside
//!   [`crate::output::BlockOutcome`] so callers can substitute the blocks
//!   that did succeed.
//!
//! [`BlockWarning`] covers conditions that are worth reporting but leave the
//! block resolved (an image URL that was not yet fetchable, a capture that
//! came out suspiciously small).

use std::path::PathBuf;
use thiserror::Error;

/// A block that could not be matched to a rendered element.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MissingBlock {
    pub id: String,
    pub kind: String,
}

/// All fatal errors returned by the blockshot library.
///
/// Block-level failures use [`BlockError`] and are stored in
/// [`crate::output::BlockOutcome`] rather than propagated here.
#[derive(Debug, Error)]
pub enum BlockshotError {
    // ── Pipeline errors ───────────────────────────────────────────────────
    /// One or more blocks have no element in the rendered document.
    #[error(
        "{} block(s) could not be located in the rendered preview: {}\n\
Reload the preview and retry the conversion.",
        missing.len(),
        format_missing(missing)
    )]
    CorrelationFailed { missing: Vec<MissingBlock> },

    /// A previous session still has uploads in flight.
    #[error("A conversion is already uploading ({pending} block(s) pending); wait for it to finish or discard it")]
    SessionBusy { pending: usize },

    /// The session is not in a state that allows the requested operation.
    #[error("Conversion session is '{status}', expected 'ready'")]
    NotReady { status: String },

    /// No conversion session exists.
    #[error("No conversion session is active")]
    NoSession,

    /// The session was discarded while it was running; its results were dropped.
    #[error("Conversion was discarded before it completed")]
    Cancelled,

    // ── Collaborator errors ───────────────────────────────────────────────
    /// The headless browser could not be started or driven.
    #[error("Browser error: {0}")]
    Browser(String),

    /// The key-value store backing the cache could not be read or written.
    #[error("Store error for '{path}': {detail}")]
    Store { path: PathBuf, detail: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Input Markdown file was not found.
    #[error("Markdown file not found: '{path}'")]
    InputNotFound { path: PathBuf },

    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_missing(missing: &[MissingBlock]) -> String {
    missing
        .iter()
        .map(|m| format!("{} ({})", m.id, m.kind))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A non-fatal error for a single block.
///
/// The batch continues; the block stays unresolved and is left untouched by
/// the text substitution.
#[derive(Debug, Clone, Error, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum BlockError {
    /// Rasterisation failed or produced unusable output.
    #[error("Block {id}: capture failed: {detail}")]
    CaptureFailed { id: String, detail: String },

    /// Upload failed after retries.
    #[error("Block {id}: upload failed after {retries} retries: {detail}")]
    UploadFailed {
        id: String,
        retries: u32,
        detail: String,
    },

    /// A DOM operation needed for the capture failed.
    #[error("Block {id}: DOM operation failed: {detail}")]
    Dom { id: String, detail: String },
}

/// A condition worth reporting that still leaves the block resolved.
#[derive(Debug, Clone, Error, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum BlockWarning {
    /// The uploaded image was not fetchable within the polling budget.
    #[error("Block {id}: image not yet available at {url} after {attempts} checks")]
    AvailabilityTimeout {
        id: String,
        url: String,
        attempts: u32,
    },

    /// The capture was smaller than the plausibility threshold.
    #[error("Block {id}: capture is only {bytes} bytes")]
    SuspiciouslySmall { id: String, bytes: usize },
}

/// A failed DOM operation reported by a [`crate::dom::DomElement`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct DomError(pub String);

/// Internal guard raised by a matcher; logged and skipped, never surfaced.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScanError {
    #[error("matcher '{matcher}' produced an empty candidate at byte {offset}")]
    Degenerate { matcher: &'static str, offset: usize },
}

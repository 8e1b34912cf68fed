//! The conversion orchestrator: scan → correlate → capture → upload → ready,
//! then substitute on request.
//!
//! ## Why a session object?
//!
//! Substitution happens later than conversion (the host shows a preview,
//! the user confirms). Between the two, the block offsets must keep pointing
//! into the exact text they were computed from, and the host must not start
//! a second conversion while uploads are still in flight. The orchestrator
//! owns one [`ConversionSession`] that freezes the source text and tracks
//! per-block upload state for both purposes.
//!
//! ## Cancellation
//!
//! [`ConversionOrchestrator::discard`] bumps a generation counter. A running
//! conversion checks its generation before every commit; once it no longer
//! matches, in-flight captures and uploads are allowed to finish but their
//! results are dropped and the run returns [`BlockshotError::Cancelled`].

use crate::block::Block;
use crate::config::ConversionConfig;
use crate::dom::{DomRoot, ElementRef};
use crate::error::{BlockError, BlockWarning, BlockshotError};
use crate::markers::UploadedMarkers;
use crate::output::{BlockOutcome, ConversionReport, ConversionStats, SubstitutionOutput, UrlSource};
use crate::pipeline::cache::UploadCache;
use crate::pipeline::capture::{capture, CaptureOptions, CapturedImage, RasterBackend};
use crate::pipeline::correlate::ElementCorrelator;
use crate::pipeline::ids::KindCounters;
use crate::pipeline::scan::scan_with;
use crate::pipeline::substitute;
use crate::pipeline::upload::{
    upload_with_retry, wait_until_available, AlwaysAvailable, AvailabilityProbe, UploadExhausted,
    Uploader,
};
use crate::progress::{LogNotifier, Notifier};
use crate::session::{ConversionSession, SessionStatus};
use crate::store::KvStore;
use futures::stream::{self, StreamExt};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

/// The host-provided services a conversion runs against.
#[derive(Clone)]
pub struct Collaborators {
    pub raster: Arc<dyn RasterBackend>,
    pub uploader: Arc<dyn Uploader>,
    pub probe: Arc<dyn AvailabilityProbe>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    /// Rasterizer and uploader; no availability polling, notifications go to the log.
    pub fn new(raster: Arc<dyn RasterBackend>, uploader: Arc<dyn Uploader>) -> Self {
        Self {
            raster,
            uploader,
            probe: Arc::new(AlwaysAvailable),
            notifier: Arc::new(LogNotifier),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn AvailabilityProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }
}

/// A block whose capture succeeded, waiting for upload.
struct Captured {
    block: Block,
    image: CapturedImage,
    capture_ms: u64,
}

pub struct ConversionOrchestrator {
    config: ConversionConfig,
    collaborators: Collaborators,
    cache: UploadCache,
    markers: UploadedMarkers,
    session: Mutex<Option<ConversionSession>>,
    generation: AtomicU64,
    status_tx: watch::Sender<SessionStatus>,
}

impl ConversionOrchestrator {
    /// `store` backs both the upload cache and the uploaded markers.
    pub fn new(config: ConversionConfig, collaborators: Collaborators, store: Arc<dyn KvStore>) -> Self {
        let ttl = Duration::from_secs(config.cache_ttl_secs);
        let (status_tx, _) = watch::channel(SessionStatus::Idle);
        Self {
            cache: UploadCache::new(Arc::clone(&store), ttl),
            markers: UploadedMarkers::new(store, ttl),
            config,
            collaborators,
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
            status_tx,
        }
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    pub fn cache(&self) -> &UploadCache {
        &self.cache
    }

    pub fn markers(&self) -> &UploadedMarkers {
        &self.markers
    }

    pub fn status(&self) -> SessionStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    /// Status changes as a `Stream`, starting with the current status.
    pub fn status_stream(&self) -> WatchStream<SessionStatus> {
        WatchStream::new(self.status_tx.subscribe())
    }

    /// Snapshot of the current session.
    pub fn session(&self) -> Option<ConversionSession> {
        self.lock_session().ok().and_then(|s| s.clone())
    }

    /// Drop the current session. A conversion still running stops committing
    /// and returns [`BlockshotError::Cancelled`].
    pub fn discard(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.lock_session().ok();
        if let Some(session) = guard.as_mut() {
            if session.take().is_some() {
                info!("Conversion session discarded");
            }
        }
        self.status_tx.send_replace(SessionStatus::Idle);
    }

    /// Substitute every resolved block into the frozen source text.
    ///
    /// Requires a `ready` session; the session is cleared afterwards.
    pub fn apply_substitution(&self) -> Result<SubstitutionOutput, BlockshotError> {
        let mut guard = self.lock_session()?;
        let session = guard.as_ref().ok_or(BlockshotError::NoSession)?;
        if session.status != SessionStatus::Ready {
            return Err(BlockshotError::NotReady {
                status: session.status.to_string(),
            });
        }

        let output = substitute::apply(&session.source_text, &session.blocks, &session.url_map());
        info!(
            "Substituted {}/{} blocks",
            output.substituted_count, output.total_count
        );
        *guard = None;
        self.status_tx.send_replace(SessionStatus::Idle);
        Ok(output)
    }

    /// Run a conversion and substitute in one call.
    pub async fn convert_document(
        &self,
        markdown: &str,
        root: &dyn DomRoot,
    ) -> Result<(SubstitutionOutput, ConversionReport), BlockshotError> {
        let report = self.start_conversion(markdown, root).await?;
        let output = self.apply_substitution()?;
        Ok((output, report))
    }

    /// Convert every block of `markdown`, capturing from `root`.
    ///
    /// Returns `Ok` once every block has a terminal outcome, even if some
    /// failed; the session is then `ready` for [`Self::apply_substitution`].
    ///
    /// # Errors
    /// - [`BlockshotError::SessionBusy`] while a previous session has uploads
    ///   in flight
    /// - [`BlockshotError::CorrelationFailed`] when any block has no rendered
    ///   element
    /// - [`BlockshotError::Cancelled`] when [`Self::discard`] (or a newer
    ///   conversion) superseded this one
    pub async fn start_conversion(
        &self,
        markdown: &str,
        root: &dyn DomRoot,
    ) -> Result<ConversionReport, BlockshotError> {
        let total_start = Instant::now();

        // ── Step 1: Guard and open a session ────────────────────────────────
        let generation = {
            let mut guard = self.lock_session()?;
            if let Some(current) = guard.as_ref() {
                let pending = current.pending_uploads();
                if pending > 0 {
                    warn!("Refusing to start: {} upload(s) still pending", pending);
                    return Err(BlockshotError::SessionBusy { pending });
                }
            }
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *guard = Some(ConversionSession::new(markdown));
            self.status_tx.send_replace(SessionStatus::Scanning);
            generation
        };

        // ── Step 2: Scan ────────────────────────────────────────────────────
        let report = scan_with(markdown, &self.config.scan, &mut KindCounters::new());
        let blocks = report.blocks;
        let total = blocks.len();
        let skipped_nested = report.skipped.len();
        info!("Found {} convertible block(s)", total);

        let version = self.commit(generation, |s| {
            s.set_blocks(blocks.clone());
            s.document_version.clone()
        })?;

        let cb = self.config.progress_callback.as_ref();
        if let Some(cb) = cb {
            cb.on_conversion_start(total);
        }

        if blocks.is_empty() {
            let stats = ConversionStats {
                skipped_nested,
                total_duration_ms: total_start.elapsed().as_millis() as u64,
                ..ConversionStats::default()
            };
            self.commit_status(generation, SessionStatus::Ready, |s| {
                s.stats = stats.clone();
            })?;
            self.collaborators.notifier.info("No convertible blocks found");
            if let Some(cb) = cb {
                cb.on_conversion_complete(0, 0);
            }
            return Ok(ConversionReport {
                document_version: version,
                outcomes: Vec::new(),
                stats,
            });
        }

        // ── Step 3: Resolve marked blocks, correlate the rest ───────────────
        let mut outcomes: Vec<BlockOutcome> = Vec::with_capacity(total);
        let mut to_capture: Vec<Block> = Vec::with_capacity(total);
        for block in &blocks {
            match self.markers.url_for(&version, &block.id) {
                Some(url) => {
                    debug!("Block {} already uploaded → {}", block.id, url);
                    if let Some(cb) = cb {
                        cb.on_block_complete(&block.id, total, &url);
                    }
                    outcomes.push(BlockOutcome {
                        block_id: block.id.clone(),
                        kind: block.kind.name(),
                        url: Some(url),
                        source: Some(UrlSource::Marker),
                        content_hash: None,
                        retries: 0,
                        duration_ms: 0,
                        warnings: Vec::new(),
                        error: None,
                    });
                }
                None => to_capture.push(block.clone()),
            }
        }

        self.set_status(generation, SessionStatus::Correlating)?;
        let correlator = ElementCorrelator::new(self.config.identity_attribute.as_str());
        let elements = match correlator.correlate(&to_capture, root).into_matched() {
            Ok(elements) => elements,
            Err(e) => {
                warn!("{}", e);
                self.set_status(generation, SessionStatus::Failed)?;
                self.collaborators.notifier.error(&e.to_string());
                return Err(e);
            }
        };

        // ── Step 4: Capture ─────────────────────────────────────────────────
        self.set_status(generation, SessionStatus::Capturing)?;
        let capture_start = Instant::now();
        let options = CaptureOptions::from_config(&self.config);
        let jobs: Vec<(Block, ElementRef)> = to_capture
            .into_iter()
            .filter_map(|b| elements.get(&b.id).cloned().map(|el| (b, el)))
            .collect();

        let captures = self.capture_all(jobs, &options, total).await;
        let capture_duration_ms = capture_start.elapsed().as_millis() as u64;
        self.check_generation(generation)?;

        let mut captured = Vec::with_capacity(captures.len());
        for result in captures {
            match result {
                Ok(c) => captured.push(c),
                Err((block, e, ms)) => {
                    warn!("{}", e);
                    if let Some(cb) = cb {
                        cb.on_block_error(&block.id, total, &e.to_string());
                    }
                    outcomes.push(BlockOutcome::failed(&block.id, &block.kind.name(), e, ms));
                }
            }
        }

        // ── Step 5: Upload ──────────────────────────────────────────────────
        self.commit_status(generation, SessionStatus::Uploading, |s| {
            for c in &captured {
                s.mark_uploading(&c.block.id);
            }
        })?;

        let upload_start = Instant::now();
        let uploaded: Vec<BlockOutcome> = stream::iter(captured.into_iter().map(|c| self.upload_one(c, total)))
            .buffer_unordered(self.config.upload_concurrency)
            .collect()
            .await;
        let upload_duration_ms = upload_start.elapsed().as_millis() as u64;
        outcomes.extend(uploaded);

        // ── Step 6: Join barrier and commit ─────────────────────────────────
        let order: std::collections::HashMap<&str, usize> = blocks
            .iter()
            .map(|b| (b.id.as_str(), b.sequence_index))
            .collect();
        outcomes.sort_by_key(|o| order.get(o.block_id.as_str()).copied().unwrap_or(usize::MAX));

        let converted = outcomes.iter().filter(|o| o.is_success()).count();
        let stats = ConversionStats {
            total_blocks: total,
            converted_blocks: converted,
            failed_blocks: total - converted,
            cached_blocks: outcomes
                .iter()
                .filter(|o| o.source == Some(UrlSource::Cache))
                .count(),
            reused_blocks: outcomes
                .iter()
                .filter(|o| o.source == Some(UrlSource::Marker))
                .count(),
            skipped_nested,
            capture_duration_ms,
            upload_duration_ms,
            total_duration_ms: total_start.elapsed().as_millis() as u64,
        };

        self.commit_status(generation, SessionStatus::Ready, |s| {
            for o in &outcomes {
                match &o.url {
                    Some(url) => s.mark_uploaded(&o.block_id, url),
                    None => s.mark_failed(&o.block_id),
                }
            }
            s.outcomes = outcomes.clone();
            s.stats = stats.clone();
        })?;
        for o in &outcomes {
            if let (Some(url), Some(UrlSource::Uploaded | UrlSource::Cache)) = (&o.url, o.source) {
                self.markers.record(&version, &o.block_id, url);
            }
        }

        info!(
            "Conversion complete: {}/{} blocks, {}ms total",
            converted, total, stats.total_duration_ms
        );
        let summary = stats.summary_line();
        if stats.failed_blocks == 0 {
            self.collaborators.notifier.success(&summary);
        } else {
            self.collaborators.notifier.error(&summary);
        }
        if let Some(cb) = cb {
            cb.on_conversion_complete(total, converted);
        }

        Ok(ConversionReport {
            document_version: version,
            outcomes,
            stats,
        })
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    async fn capture_all(
        &self,
        jobs: Vec<(Block, ElementRef)>,
        options: &CaptureOptions,
        total: usize,
    ) -> Vec<Result<Captured, (Block, BlockError, u64)>> {
        let raster = self.collaborators.raster.as_ref();
        let cb = self.config.progress_callback.as_ref();
        stream::iter(jobs.into_iter().map(|(block, element)| async move {
            if let Some(cb) = cb {
                cb.on_block_start(&block.id, block.sequence_index, total);
            }
            let start = Instant::now();
            let result = capture(&block.id, &element, options, raster).await;
            let ms = start.elapsed().as_millis() as u64;
            match result {
                Ok(image) => Ok(Captured {
                    block,
                    image,
                    capture_ms: ms,
                }),
                Err(e) => Err((block, e, ms)),
            }
        }))
        .buffer_unordered(self.config.capture_concurrency)
        .collect()
        .await
    }

    async fn upload_one(&self, captured: Captured, total: usize) -> BlockOutcome {
        let Captured {
            block,
            image,
            capture_ms,
        } = captured;
        let start = Instant::now();
        let kind = block.kind.name();
        let uploader = self.collaborators.uploader.as_ref();
        let config = &self.config;
        let ext = image.image.extension();
        let bytes = &image.image.bytes;
        let block_id = block.id.as_str();

        let lookup = self
            .cache
            .get_or_upload(bytes, &kind, |hash| async move {
                let filename = format!("{}-{}.{}", block_id, &hash[..12], ext);
                upload_with_retry(
                    uploader,
                    bytes,
                    &filename,
                    &config.upload_category,
                    config.max_retries,
                    config.retry_backoff_ms,
                )
                .await
                .map(|attempt| attempt.url)
            })
            .await;

        let mut warnings: Vec<BlockWarning> = image.warning.into_iter().collect();
        let cb = config.progress_callback.as_ref();
        let duration_ms = capture_ms + start.elapsed().as_millis() as u64;

        match lookup {
            Ok(lookup) => {
                if !lookup.cached && config.availability_attempts > 0 {
                    let available = wait_until_available(
                        self.collaborators.probe.as_ref(),
                        &lookup.url,
                        config.availability_attempts,
                        Duration::from_millis(config.availability_interval_ms),
                    )
                    .await;
                    if !available {
                        let w = BlockWarning::AvailabilityTimeout {
                            id: block.id.clone(),
                            url: lookup.url.clone(),
                            attempts: config.availability_attempts,
                        };
                        warn!("{}", w);
                        warnings.push(w);
                    }
                }
                if let Some(cb) = cb {
                    cb.on_block_complete(&block.id, total, &lookup.url);
                }
                BlockOutcome {
                    block_id: block.id.clone(),
                    kind,
                    url: Some(lookup.url),
                    source: Some(if lookup.cached {
                        UrlSource::Cache
                    } else {
                        UrlSource::Uploaded
                    }),
                    content_hash: Some(lookup.hash),
                    retries: 0,
                    duration_ms: capture_ms + start.elapsed().as_millis() as u64,
                    warnings,
                    error: None,
                }
            }
            Err(UploadExhausted { retries, detail }) => {
                let e = BlockError::UploadFailed {
                    id: block.id.clone(),
                    retries,
                    detail,
                };
                warn!("{}", e);
                if let Some(cb) = cb {
                    cb.on_block_error(&block.id, total, &e.to_string());
                }
                let mut outcome = BlockOutcome::failed(&block.id, &kind, e, duration_ms);
                outcome.retries = retries;
                outcome.warnings = warnings;
                outcome
            }
        }
    }

    fn lock_session(&self) -> Result<MutexGuard<'_, Option<ConversionSession>>, BlockshotError> {
        self.session
            .lock()
            .map_err(|_| BlockshotError::Internal("session lock poisoned".into()))
    }

    fn check_generation(&self, generation: u64) -> Result<(), BlockshotError> {
        if self.generation.load(Ordering::SeqCst) != generation {
            info!("Conversion superseded; dropping its results");
            return Err(BlockshotError::Cancelled);
        }
        Ok(())
    }

    /// Mutate the session if this run is still current.
    fn commit<T>(
        &self,
        generation: u64,
        f: impl FnOnce(&mut ConversionSession) -> T,
    ) -> Result<T, BlockshotError> {
        let mut guard = self.lock_session()?;
        self.check_generation(generation)?;
        let session = guard.as_mut().ok_or(BlockshotError::Cancelled)?;
        Ok(f(session))
    }

    /// Like [`Self::commit`], then move to `status`. The watch channel is
    /// updated before the lock is released so a concurrent
    /// [`Self::discard`] always has the last word.
    fn commit_status<T>(
        &self,
        generation: u64,
        status: SessionStatus,
        f: impl FnOnce(&mut ConversionSession) -> T,
    ) -> Result<T, BlockshotError> {
        let mut guard = self.lock_session()?;
        self.check_generation(generation)?;
        let session = guard.as_mut().ok_or(BlockshotError::Cancelled)?;
        let out = f(session);
        session.status = status;
        self.status_tx.send_replace(status);
        Ok(out)
    }

    fn set_status(&self, generation: u64, status: SessionStatus) -> Result<(), BlockshotError> {
        self.commit_status(generation, status, |_| ())
    }
}

/// Write `text` to `path` atomically (temp file + rename).
pub async fn write_output(path: &Path, text: &str) -> Result<(), BlockshotError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BlockshotError::OutputWriteFailed {
                    path: path.to_path_buf(),
                    source: e,
                })?;
        }
    }

    let tmp_path = path.with_extension("md.tmp");
    tokio::fs::write(&tmp_path, text)
        .await
        .map_err(|e| BlockshotError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| BlockshotError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })
}

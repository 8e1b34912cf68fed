//! Integration tests for the conversion orchestrator.
//!
//! Every collaborator is in-process: the DOM is a `MemoryDom` built from the
//! reference renderer, the rasterizer paints a solid PNG, and uploaders
//! record what they were asked to do.

use async_trait::async_trait;
use blockshot::pipeline::capture::RasterBackend;
use blockshot::pipeline::upload::{AvailabilityProbe, DirUploader, Uploader};
use blockshot::{
    render, BlockshotError, Collaborators, ConversionConfig, ConversionOrchestrator,
    ConversionProgressCallback, DomElement, DomError, ElementRef, JsonFileStore, MemoryDom, MemoryStore,
    BlockError, BlockWarning, Notifier, SessionStatus, UrlSource,
};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};
use tokio_test::{assert_err, assert_ok};

// ── Test collaborators ───────────────────────────────────────────────────────

/// Holds a collaborator inside its call until the test opens it.
struct Gate {
    entered: Notify,
    release: Semaphore,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: Notify::new(),
            release: Semaphore::new(0),
        })
    }

    async fn pass(&self) {
        self.entered.notify_one();
        let _permit = self.release.acquire().await.unwrap();
    }

    /// Lets every waiting and future caller through, one at a time.
    fn open(&self) {
        self.release.add_permits(1);
    }
}

fn png(shade: u8) -> Vec<u8> {
    let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(6, 3, Rgba([shade, shade, shade, 255])));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

/// Paints one colour per block kind, so identical kinds hash identically.
struct KindRaster {
    gate: Option<Arc<Gate>>,
    fail_for: Option<&'static str>,
}

impl KindRaster {
    fn new() -> Self {
        Self {
            gate: None,
            fail_for: None,
        }
    }
}

#[async_trait]
impl RasterBackend for KindRaster {
    async fn rasterize(&self, element: &ElementRef, _ratio: f32) -> Result<Vec<u8>, DomError> {
        if let Some(gate) = &self.gate {
            gate.pass().await;
        }
        let id = element.attribute("data-block-id").unwrap_or_default();
        if self.fail_for == Some(id.as_str()) {
            return Err(DomError(format!("{id} is off-screen")));
        }
        let shade = match id.split('-').next() {
            Some("code") => 10,
            Some("math") => 120,
            _ => 240,
        };
        Ok(png(shade))
    }
}

#[derive(Default)]
struct CountingUploader {
    calls: AtomicUsize,
    gate: Option<Arc<Gate>>,
    /// Filenames starting with this prefix are rejected.
    reject: Option<&'static str>,
}

#[async_trait]
impl Uploader for CountingUploader {
    async fn upload(&self, _bytes: Vec<u8>, filename: &str, category: &str) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.pass().await;
        }
        if self.reject.is_some_and(|prefix| filename.starts_with(prefix)) {
            return Err("HTTP 413 payload too large".into());
        }
        Ok(format!("https://img.test/{category}/{filename}"))
    }
}

struct NeverAvailable {
    probes: AtomicUsize,
}

#[async_trait]
impl AvailabilityProbe for NeverAvailable {
    async fn is_available(&self, _url: &str) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        false
    }
}

#[derive(Default)]
struct RecordingNotifier {
    messages: Mutex<Vec<(&'static str, String)>>,
}

impl Notifier for RecordingNotifier {
    fn success(&self, message: &str) {
        self.messages.lock().unwrap().push(("success", message.to_string()));
    }
    fn error(&self, message: &str) {
        self.messages.lock().unwrap().push(("error", message.to_string()));
    }
    fn info(&self, message: &str) {
        self.messages.lock().unwrap().push(("info", message.to_string()));
    }
}

#[derive(Default)]
struct CountingProgress {
    started: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    finished: Mutex<Option<(usize, usize)>>,
}

impl ConversionProgressCallback for CountingProgress {
    fn on_block_start(&self, _block_id: &str, _index: usize, _total: usize) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }
    fn on_block_complete(&self, _block_id: &str, _total: usize, _url: &str) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
    fn on_block_error(&self, _block_id: &str, _total: usize, _error: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
    fn on_conversion_complete(&self, total: usize, success: usize) {
        *self.finished.lock().unwrap() = Some((total, success));
    }
}

fn fast_config() -> ConversionConfig {
    ConversionConfig::builder()
        .settle_delay_ms(0)
        .min_plausible_bytes(0)
        .retry_backoff_ms(0)
        .build()
        .unwrap()
}

fn orchestrator_with(
    config: ConversionConfig,
    raster: KindRaster,
    uploader: Arc<CountingUploader>,
) -> ConversionOrchestrator {
    ConversionOrchestrator::new(
        config,
        Collaborators::new(Arc::new(raster), uploader),
        Arc::new(MemoryStore::new()),
    )
}

const DOC: &str = "# Notes\n\n\
!!! tip \"Remember\"\n    Keep it short.\n\n\
$$\nE = mc^2\n$$\n\n\
```rust\nfn main() {}\n```\n\n\
Plain closing paragraph.\n";

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn converts_every_block_and_preserves_prose() {
    let uploader = Arc::new(CountingUploader::default());
    let orch = orchestrator_with(fast_config(), KindRaster::new(), Arc::clone(&uploader));
    let dom = MemoryDom::from_rendered(&render(DOC));

    let (output, report) = orch.convert_document(DOC, &dom).await.unwrap();

    assert_eq!(report.stats.total_blocks, 3);
    assert_eq!(report.stats.converted_blocks, 3);
    assert_eq!(output.substituted_count, 3);
    assert!(output.text.starts_with("# Notes\n\n![admonition](https://img.test/blockshot/admonition-1-"));
    assert!(output.text.contains("![math](https://img.test/blockshot/math-1-"));
    assert!(output.text.contains("![code](https://img.test/blockshot/code-1-"));
    assert!(output.text.ends_with(".png)\n\nPlain closing paragraph.\n"));
    assert!(!output.text.contains("E = mc^2"));

    let ids: Vec<_> = report.outcomes.iter().map(|o| o.block_id.as_str()).collect();
    assert_eq!(ids, ["admonition-1", "math-1", "code-1"]);
}

#[tokio::test]
async fn identical_blocks_upload_once() {
    let doc = "```\nsame\n```\n\nbetween\n\n```\nsame\n```\n";
    let uploader = Arc::new(CountingUploader::default());
    let orch = orchestrator_with(fast_config(), KindRaster::new(), Arc::clone(&uploader));
    let dom = MemoryDom::from_rendered(&render(doc));

    let (output, report) = orch.convert_document(doc, &dom).await.unwrap();

    assert_eq!(uploader.calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.stats.converted_blocks, 2);
    assert_eq!(report.stats.cached_blocks, 1);
    let urls: Vec<_> = report.outcomes.iter().filter_map(|o| o.url.clone()).collect();
    assert_eq!(urls[0], urls[1]);
    assert_eq!(output.text.matches(urls[0].as_str()).count(), 2);
}

#[tokio::test]
async fn one_failed_capture_leaves_its_block_untouched() {
    let raster = KindRaster {
        fail_for: Some("math-1"),
        ..KindRaster::new()
    };
    let uploader = Arc::new(CountingUploader::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let orch = ConversionOrchestrator::new(
        fast_config(),
        Collaborators::new(Arc::new(raster), uploader).with_notifier(Arc::clone(&notifier) as Arc<dyn Notifier>),
        Arc::new(MemoryStore::new()),
    );
    let dom = MemoryDom::from_rendered(&render(DOC));

    let (output, report) = orch.convert_document(DOC, &dom).await.unwrap();

    assert_eq!(output.substituted_count, output.total_count - 1);
    assert!(output.text.contains("$$\nE = mc^2\n$$"));
    assert_eq!(report.stats.failed_blocks, 1);
    let math = report.outcomes.iter().find(|o| o.block_id == "math-1").unwrap();
    assert!(math.error.as_ref().unwrap().to_string().contains("off-screen"));

    let messages = notifier.messages.lock().unwrap();
    assert_eq!(messages.last().unwrap(), &("error", "2 of 3 blocks converted successfully".to_string()));
}

#[tokio::test]
async fn document_without_blocks_is_ready_immediately() {
    let doc = "Just prose.\n\nNothing to capture.\n";
    let uploader = Arc::new(CountingUploader::default());
    let orch = orchestrator_with(fast_config(), KindRaster::new(), Arc::clone(&uploader));

    let report = assert_ok!(orch.start_conversion(doc, &MemoryDom::new()).await);
    assert_eq!(report.stats.total_blocks, 0);
    assert_eq!(orch.status(), SessionStatus::Ready);

    let output = orch.apply_substitution().unwrap();
    assert_eq!(output.text, doc);
    assert_eq!(output.substituted_count, 0);
    assert_eq!(uploader.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_element_fails_the_whole_run() {
    let uploader = Arc::new(CountingUploader::default());
    let orch = orchestrator_with(fast_config(), KindRaster::new(), Arc::clone(&uploader));

    let err = assert_err!(orch.start_conversion(DOC, &MemoryDom::new()).await);
    match err {
        BlockshotError::CorrelationFailed { missing } => {
            let ids: Vec<_> = missing.iter().map(|m| m.id.as_str()).collect();
            assert_eq!(ids, ["admonition-1", "math-1", "code-1"]);
        }
        other => panic!("expected CorrelationFailed, got {other:?}"),
    }
    assert_eq!(orch.status(), SessionStatus::Failed);
    assert_eq!(uploader.calls.load(Ordering::SeqCst), 0);
    assert!(matches!(
        orch.apply_substitution(),
        Err(BlockshotError::NotReady { .. })
    ));
}

#[tokio::test]
async fn second_start_is_rejected_while_uploads_are_pending() {
    let gate = Gate::new();
    let uploader = Arc::new(CountingUploader {
        gate: Some(Arc::clone(&gate)),
        ..CountingUploader::default()
    });
    let orch = orchestrator_with(fast_config(), KindRaster::new(), Arc::clone(&uploader));
    let dom = MemoryDom::from_rendered(&render(DOC));

    let (first, second) = tokio::join!(orch.start_conversion(DOC, &dom), async {
        gate.entered.notified().await;
        let second = orch.start_conversion(DOC, &dom).await;
        gate.open();
        second
    });

    assert_ok!(first);
    assert!(matches!(second, Err(BlockshotError::SessionBusy { pending }) if pending > 0));
    assert_eq!(orch.status(), SessionStatus::Ready);
    assert_eq!(uploader.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn discard_cancels_a_running_conversion() {
    let gate = Gate::new();
    let raster = KindRaster {
        gate: Some(Arc::clone(&gate)),
        ..KindRaster::new()
    };
    let uploader = Arc::new(CountingUploader::default());
    let orch = orchestrator_with(fast_config(), raster, Arc::clone(&uploader));
    let dom = MemoryDom::from_rendered(&render(DOC));

    let (result, ()) = tokio::join!(orch.start_conversion(DOC, &dom), async {
        gate.entered.notified().await;
        orch.discard();
        gate.open();
    });

    assert!(matches!(result, Err(BlockshotError::Cancelled)));
    assert_eq!(orch.status(), SessionStatus::Idle);
    assert!(orch.session().is_none());
    assert_eq!(uploader.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn one_rejected_upload_leaves_its_block_untouched() {
    let doc = "$$\na\n$$\n\n```\nb\n```\n";
    let uploader = Arc::new(CountingUploader {
        reject: Some("math-"),
        ..CountingUploader::default()
    });
    let config = ConversionConfig::builder()
        .settle_delay_ms(0)
        .min_plausible_bytes(0)
        .retry_backoff_ms(0)
        .max_retries(1)
        .build()
        .unwrap();
    let orch = orchestrator_with(config, KindRaster::new(), Arc::clone(&uploader));
    let dom = MemoryDom::from_rendered(&render(doc));

    let (output, report) = orch.convert_document(doc, &dom).await.unwrap();

    assert_eq!(output.substituted_count, output.total_count - 1);
    assert!(output.text.starts_with("$$\na\n$$\n\n![code]("));
    assert_eq!(report.stats.failed_blocks, 1);
    // One initial attempt plus one retry for math, one upload for code.
    assert_eq!(uploader.calls.load(Ordering::SeqCst), 3);

    let math = &report.outcomes[0];
    assert_eq!(math.block_id, "math-1");
    assert_eq!(math.retries, 1);
    assert!(math.url.is_none());
    match &math.error {
        Some(BlockError::UploadFailed { id, retries, detail }) => {
            assert_eq!((id.as_str(), *retries), ("math-1", 1));
            assert!(detail.contains("413"));
        }
        other => panic!("expected UploadFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn unavailable_url_is_still_substituted_with_a_warning() {
    let doc = "$$x$$\n";
    let probe = Arc::new(NeverAvailable {
        probes: AtomicUsize::new(0),
    });
    let config = ConversionConfig::builder()
        .settle_delay_ms(0)
        .min_plausible_bytes(0)
        .availability_attempts(3)
        .availability_interval_ms(1)
        .build()
        .unwrap();
    let orch = ConversionOrchestrator::new(
        config,
        Collaborators::new(Arc::new(KindRaster::new()), Arc::new(CountingUploader::default()))
            .with_probe(Arc::clone(&probe) as Arc<dyn AvailabilityProbe>),
        Arc::new(MemoryStore::new()),
    );
    let dom = MemoryDom::from_rendered(&render(doc));

    let (output, report) = orch.convert_document(doc, &dom).await.unwrap();

    assert_eq!(probe.probes.load(Ordering::SeqCst), 3);
    assert_eq!(report.stats.failed_blocks, 0);
    let outcome = &report.outcomes[0];
    let url = outcome.url.clone().unwrap();
    assert_eq!(output.text, format!("![math]({url})\n"));
    assert_eq!(
        outcome.warnings,
        vec![BlockWarning::AvailabilityTimeout {
            id: "math-1".into(),
            url,
            attempts: 3,
        }]
    );
}

#[tokio::test]
async fn status_is_observable() {
    use tokio_stream::StreamExt;

    let orch = orchestrator_with(
        fast_config(),
        KindRaster::new(),
        Arc::new(CountingUploader::default()),
    );
    let mut stream = orch.status_stream();
    assert_eq!(stream.next().await, Some(SessionStatus::Idle));

    let mut rx = orch.subscribe();
    let dom = MemoryDom::from_rendered(&render(DOC));
    orch.start_conversion(DOC, &dom).await.unwrap();

    assert!(rx.has_changed().unwrap());
    assert_eq!(*rx.borrow_and_update(), SessionStatus::Ready);
    assert_eq!(stream.next().await, Some(SessionStatus::Ready));

    orch.apply_substitution().unwrap();
    assert_eq!(*rx.borrow_and_update(), SessionStatus::Idle);
}

#[tokio::test]
async fn progress_callback_sees_every_block() {
    let progress = Arc::new(CountingProgress::default());
    let config = ConversionConfig::builder()
        .settle_delay_ms(0)
        .min_plausible_bytes(0)
        .progress_callback(Arc::clone(&progress) as Arc<dyn ConversionProgressCallback>)
        .build()
        .unwrap();
    let raster = KindRaster {
        fail_for: Some("code-1"),
        ..KindRaster::new()
    };
    let orch = orchestrator_with(config, raster, Arc::new(CountingUploader::default()));
    let dom = MemoryDom::from_rendered(&render(DOC));

    orch.start_conversion(DOC, &dom).await.unwrap();

    assert_eq!(progress.started.load(Ordering::SeqCst), 3);
    assert_eq!(progress.completed.load(Ordering::SeqCst), 2);
    assert_eq!(progress.failed.load(Ordering::SeqCst), 1);
    assert_eq!(*progress.finished.lock().unwrap(), Some((3, 2)));
}

#[tokio::test]
async fn state_file_carries_markers_and_cache_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state.json");
    let dom = MemoryDom::from_rendered(&render(DOC));

    let first = Arc::new(CountingUploader::default());
    let orch = ConversionOrchestrator::new(
        fast_config(),
        Collaborators::new(Arc::new(KindRaster::new()), Arc::clone(&first) as Arc<dyn Uploader>),
        Arc::new(JsonFileStore::open(&state).unwrap()),
    );
    let (first_output, _) = orch.convert_document(DOC, &dom).await.unwrap();
    assert_eq!(first.calls.load(Ordering::SeqCst), 3);
    drop(orch);

    // Same document in a fresh process: every block resolves from markers.
    let second = Arc::new(CountingUploader::default());
    let orch = ConversionOrchestrator::new(
        fast_config(),
        Collaborators::new(Arc::new(KindRaster::new()), Arc::clone(&second) as Arc<dyn Uploader>),
        Arc::new(JsonFileStore::open(&state).unwrap()),
    );
    let (output, report) = orch.convert_document(DOC, &dom).await.unwrap();
    assert_eq!(output.text, first_output.text);
    assert_eq!(report.stats.reused_blocks, 3);
    assert!(report.outcomes.iter().all(|o| o.source == Some(UrlSource::Marker)));

    // Edited document: new version, so no markers, but images come from the cache.
    let edited = format!("{DOC}\nOne more line.\n");
    let dom = MemoryDom::from_rendered(&render(&edited));
    let (_, report) = orch.convert_document(&edited, &dom).await.unwrap();
    assert_eq!(report.stats.cached_blocks, 3);
    assert_eq!(second.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn dir_uploader_writes_image_files() {
    let dir = tempfile::tempdir().unwrap();
    let uploader = DirUploader::new(dir.path().join("images")).with_base_url("https://cdn.test/img");
    let orch = ConversionOrchestrator::new(
        fast_config(),
        Collaborators::new(Arc::new(KindRaster::new()), Arc::new(uploader)),
        Arc::new(MemoryStore::new()),
    );
    let doc = "$$x$$\n";
    let dom = MemoryDom::from_rendered(&render(doc));

    let (output, report) = orch.convert_document(doc, &dom).await.unwrap();
    let url = report.outcomes[0].url.clone().unwrap();
    assert!(url.starts_with("https://cdn.test/img/blockshot/math-1-"));
    assert_eq!(output.text, format!("![math]({url})\n"));

    let files: Vec<_> = std::fs::read_dir(dir.path().join("images").join("blockshot"))
        .unwrap()
        .collect();
    assert_eq!(files.len(), 1);
}

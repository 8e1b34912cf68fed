//! Block rasterization: turn one rendered element into image bytes.
//!
//! Capturing needs temporary layout overrides on the live element: an
//! explicit width so the image matches the article column, neutralised
//! margins so the bitmap is not padded, and a scroll so lazily painted
//! content is on screen. The overrides are undone by a [`StyleGuard`] whose
//! `Drop` restores the original inline values, so the page is left as it was
//! whether the capture succeeds, fails, or the future is dropped mid-way.

use crate::config::ConversionConfig;
use crate::dom::ElementRef;
use crate::error::{BlockError, BlockWarning, DomError};
use crate::pipeline::encode::{normalise_capture, EncodedImage};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// The rasterization primitive: element → image bytes.
///
/// Output may be raw PNG/JPEG bytes or a base64 `data:` URL.
#[async_trait]
pub trait RasterBackend: Send + Sync {
    async fn rasterize(&self, element: &ElementRef, pixel_ratio: f32) -> Result<Vec<u8>, DomError>;
}

/// Per-capture settings, derived from [`ConversionConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOptions {
    /// Explicit CSS width in pixels applied during the capture.
    pub width: Option<u32>,
    pub pixel_ratio: f32,
    /// Layout settle time between applying overrides and capturing.
    pub settle_delay: Duration,
    /// Inline style overrides applied during the capture.
    pub neutralize: Vec<(String, String)>,
    /// Captures smaller than this are reported as suspicious.
    pub min_plausible_bytes: usize,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self::from_config(&ConversionConfig::default())
    }
}

impl CaptureOptions {
    pub fn from_config(config: &ConversionConfig) -> Self {
        Self {
            width: config.capture_width,
            pixel_ratio: config.pixel_ratio,
            settle_delay: Duration::from_millis(config.settle_delay_ms),
            neutralize: config.neutralize_styles.clone(),
            min_plausible_bytes: config.min_plausible_bytes,
        }
    }

    fn overrides(&self) -> Vec<(String, String)> {
        let mut overrides = Vec::with_capacity(self.neutralize.len() + 1);
        if let Some(width) = self.width {
            overrides.push(("width".to_string(), format!("{width}px")));
        }
        overrides.extend(self.neutralize.iter().cloned());
        overrides
    }
}

/// A validated capture plus anything worth reporting about it.
#[derive(Debug, Clone)]
pub struct CapturedImage {
    pub image: EncodedImage,
    pub warning: Option<BlockWarning>,
}

/// Restores saved inline styles on drop.
struct StyleGuard<'a> {
    element: &'a ElementRef,
    saved: Vec<(String, Option<String>)>,
}

impl<'a> StyleGuard<'a> {
    fn new(element: &'a ElementRef) -> Self {
        Self {
            element,
            saved: Vec::new(),
        }
    }

    fn set(&mut self, property: &str, value: &str) -> Result<(), DomError> {
        if !self.saved.iter().any(|(p, _)| p == property) {
            self.saved
                .push((property.to_string(), self.element.inline_style(property)));
        }
        self.element.set_inline_style(property, Some(value))
    }
}

impl Drop for StyleGuard<'_> {
    fn drop(&mut self) {
        for (property, original) in self.saved.drain(..).rev() {
            if let Err(e) = self.element.set_inline_style(&property, original.as_deref()) {
                warn!("Failed to restore inline {} after capture: {}", property, e);
            }
        }
    }
}

/// Capture `element` as an image for block `block_id`.
///
/// Failures are block-scoped: the caller records them and moves on.
pub async fn capture(
    block_id: &str,
    element: &ElementRef,
    options: &CaptureOptions,
    backend: &dyn RasterBackend,
) -> Result<CapturedImage, BlockError> {
    let dom_err = |e: DomError| BlockError::Dom {
        id: block_id.to_string(),
        detail: e.to_string(),
    };

    let mut guard = StyleGuard::new(element);
    for (property, value) in options.overrides() {
        guard.set(&property, &value).map_err(dom_err)?;
    }

    if !options.settle_delay.is_zero() {
        tokio::time::sleep(options.settle_delay).await;
    }
    element.scroll_into_view().map_err(dom_err)?;

    let raw = backend
        .rasterize(element, options.pixel_ratio)
        .await
        .map_err(|e| BlockError::CaptureFailed {
            id: block_id.to_string(),
            detail: e.to_string(),
        })?;
    drop(guard);

    let image = normalise_capture(&raw).map_err(|detail| BlockError::CaptureFailed {
        id: block_id.to_string(),
        detail,
    })?;

    let warning = if image.bytes.len() < options.min_plausible_bytes {
        warn!(
            "Block {}: capture is only {} bytes ({}x{} px); the element may be blank",
            block_id,
            image.bytes.len(),
            image.width,
            image.height
        );
        Some(BlockWarning::SuspiciouslySmall {
            id: block_id.to_string(),
            bytes: image.bytes.len(),
        })
    } else {
        debug!("Block {}: captured {} bytes", block_id, image.bytes.len());
        None
    };

    Ok(CapturedImage { image, warning })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::MemoryElement;
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    fn png(size: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(size, size, Rgba([0, 0, 255, 255])));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        buf
    }

    /// Records the element's width at capture time.
    struct Recording {
        seen_width: Mutex<Option<String>>,
        result: Result<Vec<u8>, DomError>,
    }

    #[async_trait]
    impl RasterBackend for Recording {
        async fn rasterize(&self, element: &ElementRef, _pixel_ratio: f32) -> Result<Vec<u8>, DomError> {
            *self.seen_width.lock().unwrap() = element.inline_style("width");
            self.result.clone()
        }
    }

    fn options() -> CaptureOptions {
        CaptureOptions {
            width: Some(640),
            pixel_ratio: 2.0,
            settle_delay: Duration::ZERO,
            neutralize: vec![("margin".into(), "0".into())],
            min_plausible_bytes: 0,
        }
    }

    #[tokio::test]
    async fn overrides_apply_during_capture_and_restore_after() {
        let el: ElementRef = Arc::new(MemoryElement::new("pre").with_style("width", "50%"));
        let backend = Recording {
            seen_width: Mutex::new(None),
            result: Ok(png(8)),
        };

        let captured = capture("code-1", &el, &options(), &backend).await.expect("capture");
        assert_eq!(backend.seen_width.lock().unwrap().as_deref(), Some("640px"));
        assert_eq!(el.inline_style("width").as_deref(), Some("50%"));
        assert_eq!(el.inline_style("margin"), None);
        assert_eq!(captured.image.width, 8);
        assert!(captured.warning.is_none());
    }

    #[tokio::test]
    async fn styles_restored_when_rasterizer_fails() {
        let el: ElementRef = Arc::new(MemoryElement::new("div"));
        let backend = Recording {
            seen_width: Mutex::new(None),
            result: Err(DomError("node detached".into())),
        };

        let err = capture("math-1", &el, &options(), &backend).await.unwrap_err();
        assert!(matches!(err, BlockError::CaptureFailed { ref id, .. } if id == "math-1"));
        assert_eq!(el.inline_style("width"), None);
        assert_eq!(el.inline_style("margin"), None);
    }

    #[tokio::test]
    async fn garbage_output_is_a_capture_failure() {
        let el: ElementRef = Arc::new(MemoryElement::new("div"));
        let backend = Recording {
            seen_width: Mutex::new(None),
            result: Ok(b"<html>".to_vec()),
        };
        assert!(capture("admonition-1", &el, &options(), &backend).await.is_err());
    }

    #[tokio::test]
    async fn tiny_output_is_only_a_warning() {
        let el: ElementRef = Arc::new(MemoryElement::new("div"));
        let backend = Recording {
            seen_width: Mutex::new(None),
            result: Ok(png(1)),
        };
        let opts = CaptureOptions {
            min_plausible_bytes: 10_000,
            ..options()
        };
        let captured = capture("code-3", &el, &opts, &backend).await.expect("still ok");
        assert!(matches!(captured.warning, Some(BlockWarning::SuspiciouslySmall { .. })));
    }
}

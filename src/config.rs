//! Configuration types for block-to-image conversion.
//!
//! All conversion behaviour is controlled through [`ConversionConfig`], built
//! via its [`ConversionConfigBuilder`]. Keeping every knob in one struct makes
//! it trivial to share configs across tasks, log them, and diff two runs to
//! understand why their outputs differ.
//!
//! # Design choice: builder over constructor
//! Most callers only change one or two of the knobs below. The builder lets
//! them set those and rely on documented defaults for the rest, with
//! out-of-range values clamped at the setter and cross-field constraints
//! checked once in [`ConversionConfigBuilder::build`].

use crate::error::BlockshotError;
use crate::pipeline::scan::ScanConfig;
use crate::progress::ProgressCallback;
use crate::render::IDENTITY_ATTRIBUTE;
use std::fmt;

/// Three days, the default lifetime of cache entries and upload markers.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3 * 24 * 60 * 60;

/// Configuration for a conversion.
///
/// # Example
/// ```rust
/// use blockshot::ConversionConfig;
///
/// let config = ConversionConfig::builder()
///     .pixel_ratio(3.0)
///     .capture_width(Some(677))
///     .upload_concurrency(8)
///     .build()
///     .unwrap();
/// assert_eq!(config.upload_concurrency, 8);
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    /// Device pixel ratio used for rasterisation. Range: 1–4. Default: 2.0.
    ///
    /// Article images are viewed on high-density phone screens; at 1.0 text
    /// in code blocks and formulas looks blurry.
    pub pixel_ratio: f32,

    /// Explicit CSS width (px) applied to each element while it is captured.
    /// `None` keeps the element's laid-out width.
    pub capture_width: Option<u32>,

    /// Wait after applying capture overrides, in ms. Default: 100.
    pub settle_delay_ms: u64,

    /// Inline styles applied during capture. Default: `margin: 0`.
    ///
    /// Element margins would otherwise be painted into the bitmap as blank
    /// borders.
    pub neutralize_styles: Vec<(String, String)>,

    /// Captures below this size are reported as suspicious. Default: 256 bytes.
    pub min_plausible_bytes: usize,

    /// Concurrent captures. Default: 1.
    ///
    /// Captures mutate the shared DOM (inline width, scroll position), so
    /// running them in parallel against one page makes them interfere.
    pub capture_concurrency: usize,

    /// Concurrent uploads. Default: 4.
    pub upload_concurrency: usize,

    /// Upload retries after the first attempt. Default: 2.
    pub max_retries: u32,

    /// Initial retry delay in ms; doubles per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Availability probes after an upload; 0 disables polling. Default: 0.
    pub availability_attempts: u32,

    /// Delay between availability probes in ms. Default: 1000.
    pub availability_interval_ms: u64,

    /// Lifetime of upload cache entries and markers. Default: 3 days.
    pub cache_ttl_secs: u64,

    /// Category passed to the uploader. Default: "blockshot".
    pub upload_category: String,

    /// Attribute the renderer stamps block ids into. Default: `data-block-id`.
    pub identity_attribute: String,

    /// Which block kinds are scanned.
    pub scan: ScanConfig,

    /// Optional progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            pixel_ratio: 2.0,
            capture_width: None,
            settle_delay_ms: 100,
            neutralize_styles: vec![("margin".to_string(), "0".to_string())],
            min_plausible_bytes: 256,
            capture_concurrency: 1,
            upload_concurrency: 4,
            max_retries: 2,
            retry_backoff_ms: 500,
            availability_attempts: 0,
            availability_interval_ms: 1000,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            upload_category: "blockshot".to_string(),
            identity_attribute: IDENTITY_ATTRIBUTE.to_string(),
            scan: ScanConfig::default(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("pixel_ratio", &self.pixel_ratio)
            .field("capture_width", &self.capture_width)
            .field("settle_delay_ms", &self.settle_delay_ms)
            .field("neutralize_styles", &self.neutralize_styles)
            .field("capture_concurrency", &self.capture_concurrency)
            .field("upload_concurrency", &self.upload_concurrency)
            .field("max_retries", &self.max_retries)
            .field("availability_attempts", &self.availability_attempts)
            .field("cache_ttl_secs", &self.cache_ttl_secs)
            .field("upload_category", &self.upload_category)
            .field("identity_attribute", &self.identity_attribute)
            .field("scan", &self.scan)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ConversionProgressCallback>"),
            )
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ConversionConfig`].
#[derive(Debug)]
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl ConversionConfigBuilder {
    pub fn pixel_ratio(mut self, ratio: f32) -> Self {
        self.config.pixel_ratio = if ratio.is_finite() { ratio.clamp(1.0, 4.0) } else { 2.0 };
        self
    }

    pub fn capture_width(mut self, width: Option<u32>) -> Self {
        self.config.capture_width = width;
        self
    }

    pub fn settle_delay_ms(mut self, ms: u64) -> Self {
        self.config.settle_delay_ms = ms;
        self
    }

    pub fn neutralize_style(mut self, property: impl Into<String>, value: impl Into<String>) -> Self {
        let property = property.into();
        self.config.neutralize_styles.retain(|(p, _)| *p != property);
        self.config.neutralize_styles.push((property, value.into()));
        self
    }

    pub fn neutralize_styles(mut self, styles: Vec<(String, String)>) -> Self {
        self.config.neutralize_styles = styles;
        self
    }

    pub fn min_plausible_bytes(mut self, bytes: usize) -> Self {
        self.config.min_plausible_bytes = bytes;
        self
    }

    pub fn capture_concurrency(mut self, n: usize) -> Self {
        self.config.capture_concurrency = n.max(1);
        self
    }

    pub fn upload_concurrency(mut self, n: usize) -> Self {
        self.config.upload_concurrency = n.max(1);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn availability_attempts(mut self, n: u32) -> Self {
        self.config.availability_attempts = n;
        self
    }

    pub fn availability_interval_ms(mut self, ms: u64) -> Self {
        self.config.availability_interval_ms = ms;
        self
    }

    pub fn cache_ttl_secs(mut self, secs: u64) -> Self {
        self.config.cache_ttl_secs = secs;
        self
    }

    pub fn upload_category(mut self, category: impl Into<String>) -> Self {
        self.config.upload_category = category.into();
        self
    }

    pub fn identity_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.config.identity_attribute = attribute.into();
        self
    }

    pub fn scan(mut self, scan: ScanConfig) -> Self {
        self.config.scan = scan;
        self
    }

    /// Enable heading blocks for levels `min..=max` (clamped to 2–6).
    pub fn headings(mut self, min: u8, max: u8) -> Self {
        let min = min.clamp(2, 6);
        self.config.scan.heading_levels = Some((min, max.clamp(min, 6)));
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, BlockshotError> {
        let c = &self.config;
        if !(1.0..=4.0).contains(&c.pixel_ratio) {
            return Err(BlockshotError::InvalidConfig(format!(
                "pixel ratio must be 1–4, got {}",
                c.pixel_ratio
            )));
        }
        if c.capture_width == Some(0) {
            return Err(BlockshotError::InvalidConfig(
                "capture width must be > 0".into(),
            ));
        }
        if c.capture_concurrency == 0 || c.upload_concurrency == 0 {
            return Err(BlockshotError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if c.cache_ttl_secs == 0 {
            return Err(BlockshotError::InvalidConfig(
                "cache TTL must be > 0".into(),
            ));
        }
        let attr_ok = !c.identity_attribute.is_empty()
            && c
                .identity_attribute
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
        if !attr_ok {
            return Err(BlockshotError::InvalidConfig(format!(
                "identity attribute '{}' is not a valid attribute name",
                c.identity_attribute
            )));
        }
        if let Some((min, max)) = c.scan.heading_levels {
            if !(1..=6).contains(&min) || !(1..=6).contains(&max) || min > max {
                return Err(BlockshotError::InvalidConfig(format!(
                    "heading levels must satisfy 1 ≤ min ≤ max ≤ 6, got {min}..{max}"
                )));
            }
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ConversionConfig::default();
        assert_eq!(c.pixel_ratio, 2.0);
        assert_eq!(c.capture_concurrency, 1);
        assert_eq!(c.upload_concurrency, 4);
        assert_eq!(c.neutralize_styles, vec![("margin".to_string(), "0".to_string())]);
        assert_eq!(c.cache_ttl_secs, 259_200);
        assert_eq!(c.identity_attribute, "data-block-id");
        assert!(c.scan.heading_levels.is_none());
    }

    #[test]
    fn setters_clamp() {
        let c = ConversionConfig::builder()
            .pixel_ratio(9.0)
            .upload_concurrency(0)
            .headings(1, 9)
            .build()
            .unwrap();
        assert_eq!(c.pixel_ratio, 4.0);
        assert_eq!(c.upload_concurrency, 1);
        assert_eq!(c.scan.heading_levels, Some((2, 6)));
    }

    #[test]
    fn neutralize_style_replaces_same_property() {
        let c = ConversionConfig::builder()
            .neutralize_style("margin", "4px")
            .neutralize_style("box-shadow", "none")
            .build()
            .unwrap();
        assert_eq!(
            c.neutralize_styles,
            vec![
                ("margin".to_string(), "4px".to_string()),
                ("box-shadow".to_string(), "none".to_string())
            ]
        );
    }

    #[test]
    fn build_rejects_bad_values() {
        assert!(ConversionConfig::builder().capture_width(Some(0)).build().is_err());
        assert!(ConversionConfig::builder().cache_ttl_secs(0).build().is_err());
        assert!(ConversionConfig::builder()
            .identity_attribute("data block")
            .build()
            .is_err());
        let scan = ScanConfig {
            heading_levels: Some((4, 2)),
            ..ScanConfig::default()
        };
        assert!(matches!(
            ConversionConfig::builder().scan(scan).build(),
            Err(BlockshotError::InvalidConfig(_))
        ));
    }
}

//! Image upload: push captured bytes to an image host and get a URL back.
//!
//! ## Retry Strategy
//!
//! Image hosts throttle bursts of uploads with 429/503 responses. Exponential
//! backoff (`retry_backoff_ms * 2^attempt`) spaces retries out: with a 500 ms
//! base and 2 retries the waits are 500 ms → 1 s.
//!
//! ## Availability polling
//!
//! Some CDNs accept an upload before the URL is fetchable. When
//! `availability_attempts > 0` the orchestrator polls the URL with an
//! [`AvailabilityProbe`] until it answers or the budget is spent; an
//! exhausted budget is a warning, not a failure, because the upload itself
//! succeeded.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Uploads one image and returns its public URL.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, filename: &str, category: &str) -> Result<String, String>;
}

/// Checks whether an uploaded URL is fetchable yet.
#[async_trait]
pub trait AvailabilityProbe: Send + Sync {
    async fn is_available(&self, url: &str) -> bool;
}

/// Outcome of [`upload_with_retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadAttempt {
    pub url: String,
    /// Retries used before success.
    pub retries: u32,
}

/// Error of [`upload_with_retry`] once every attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadExhausted {
    pub retries: u32,
    pub detail: String,
}

/// Call `uploader` up to `max_retries + 1` times with exponential backoff.
pub async fn upload_with_retry(
    uploader: &dyn Uploader,
    bytes: &[u8],
    filename: &str,
    category: &str,
    max_retries: u32,
    backoff_ms: u64,
) -> Result<UploadAttempt, UploadExhausted> {
    let mut last_err: Option<String> = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let backoff = backoff_ms * 2u64.pow(attempt - 1);
            warn!(
                "{}: upload retry {}/{} after {}ms",
                filename, attempt, max_retries, backoff
            );
            sleep(Duration::from_millis(backoff)).await;
        }

        match uploader.upload(bytes.to_vec(), filename, category).await {
            Ok(url) => {
                debug!("{}: uploaded → {}", filename, url);
                return Ok(UploadAttempt { url, retries: attempt });
            }
            Err(e) => {
                warn!("{}: upload attempt {} failed: {}", filename, attempt + 1, e);
                last_err = Some(e);
            }
        }
    }

    Err(UploadExhausted {
        retries: max_retries,
        detail: last_err.unwrap_or_else(|| "Unknown error".to_string()),
    })
}

/// Poll `url` up to `attempts` times, `interval` apart.
///
/// Returns `true` as soon as the probe succeeds; `attempts == 0` skips
/// polling and reports available.
pub async fn wait_until_available(
    probe: &dyn AvailabilityProbe,
    url: &str,
    attempts: u32,
    interval: Duration,
) -> bool {
    for attempt in 0..attempts {
        if probe.is_available(url).await {
            return true;
        }
        if attempt + 1 < attempts {
            sleep(interval).await;
        }
    }
    attempts == 0
}

// ── HTTP image host ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: String,
}

/// Multipart POST to an image host that answers `{"url": "..."}`.
///
/// The image goes in the `file` field and the category in `category`.
pub struct HttpUploader {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpUploader {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token: None,
        })
    }

    /// Send `Authorization: Bearer {token}` with every upload.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, bytes: Vec<u8>, filename: &str, category: &str) -> Result<String, String> {
        let mime = if filename.ends_with(".jpg") { "image/jpeg" } else { "image/png" };
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime)
            .map_err(|e| e.to_string())?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("category", category.to_string());

        let mut request = self.client.post(&self.endpoint).multipart(form);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                format!("timed out uploading to {}", self.endpoint)
            } else {
                e.to_string()
            }
        })?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }

        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| format!("unexpected upload response: {e}"))?;
        if body.url.is_empty() {
            return Err("upload response has an empty url".into());
        }
        Ok(body.url)
    }
}

/// HEAD request; any 2xx counts as available.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AvailabilityProbe for HttpProbe {
    async fn is_available(&self, url: &str) -> bool {
        match self.client.head(url).send().await {
            Ok(r) => r.status().is_success(),
            Err(e) => {
                debug!("Probe {}: {}", url, e);
                false
            }
        }
    }
}

/// A probe that never polls.
pub struct AlwaysAvailable;

#[async_trait]
impl AvailabilityProbe for AlwaysAvailable {
    async fn is_available(&self, _url: &str) -> bool {
        true
    }
}

// ── Local directory ─────────────────────────────────────────────────────────

/// Writes images into `{dir}/{category}/{filename}` and returns a URL
/// built from `base_url` (or a `file://` URL when none is set).
pub struct DirUploader {
    dir: PathBuf,
    base_url: Option<String>,
}

impl DirUploader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }
}

#[async_trait]
impl Uploader for DirUploader {
    async fn upload(&self, bytes: Vec<u8>, filename: &str, category: &str) -> Result<String, String> {
        let dir = self.dir.join(category);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| format!("cannot create {}: {e}", dir.display()))?;
        let path = dir.join(filename);
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| format!("cannot write {}: {e}", path.display()))?;

        Ok(match &self.base_url {
            Some(base) => format!("{base}/{category}/{filename}"),
            None => {
                let abs = std::path::absolute(&path).unwrap_or(path);
                format!("file://{}", abs.display())
            }
        })
    }
}

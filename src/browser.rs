//! Headless Chrome backend: a real DOM and a real rasterizer.
//!
//! [`ChromeSession::open`] writes a rendered page to a temp directory, opens
//! it in a headless tab and hands out a [`ChromeDom`] (for correlation and
//! style overrides) and a [`ChromeRaster`] (for captures).
//!
//! ## Element handles
//!
//! DevTools remote objects are awkward to keep around, so elements are
//! registered in a page-side table instead: every element a query returns is
//! given a numeric key (`window.__blockshot.els[key]`), and all later calls
//! address it through that key. Keys are stable for the lifetime of the page,
//! which is exactly what the correlator needs to avoid double-claiming.
//!
//! ## Blocking
//!
//! `headless_chrome` is synchronous. DOM calls are short and run inline;
//! screenshots go through `spawn_blocking` so a slow capture does not stall
//! the runtime.

use crate::dom::{DomElement, DomRoot, ElementKey, ElementRef};
use crate::error::{BlockshotError, DomError};
use crate::pipeline::capture::RasterBackend;
use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page;
use headless_chrome::{Browser, LaunchOptionsBuilder, Tab};
use serde::Deserialize;
use std::ffi::OsStr;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info};

const REGISTRY: &str = "(window.__blockshot = window.__blockshot || { seq: 0, els: {} })";

fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

fn eval(tab: &Tab, script: &str) -> Result<Option<serde_json::Value>, DomError> {
    tab.evaluate(script, false)
        .map(|r| r.value)
        .map_err(|e| DomError(e.to_string()))
}

/// A headless browser with one page loaded.
pub struct ChromeSession {
    // Kept alive for the tab's lifetime.
    _browser: Browser,
    tab: Arc<Tab>,
    _dir: TempDir,
}

impl ChromeSession {
    /// Launch Chrome and load `html` at a window width of `width` px.
    pub async fn open(html: String, width: u32) -> Result<Self, BlockshotError> {
        tokio::task::spawn_blocking(move || Self::launch(&html, width))
            .await
            .map_err(|e| BlockshotError::Internal(format!("browser launch task panicked: {e}")))?
    }

    fn launch(html: &str, width: u32) -> Result<Self, BlockshotError> {
        let browser_err = |e: String| BlockshotError::Browser(e);

        let dir = TempDir::new().map_err(|e| BlockshotError::Internal(e.to_string()))?;
        let page: PathBuf = dir.path().join("page.html");
        std::fs::write(&page, html).map_err(|e| BlockshotError::Internal(e.to_string()))?;

        let options = LaunchOptionsBuilder::default()
            .headless(true)
            .window_size(Some((width, 900)))
            .args(vec![OsStr::new("--hide-scrollbars"), OsStr::new("--disable-gpu")])
            .build()
            .map_err(|e| browser_err(e.to_string()))?;
        let browser = Browser::new(options).map_err(|e| browser_err(e.to_string()))?;
        let tab = browser.new_tab().map_err(|e| browser_err(e.to_string()))?;

        tab.navigate_to(&format!("file://{}", page.display()))
            .map_err(|e| browser_err(e.to_string()))?;
        tab.wait_until_navigated()
            .map_err(|e| browser_err(e.to_string()))?;
        tab.evaluate("document.fonts.ready.then(() => true)", true)
            .map_err(|e| browser_err(e.to_string()))?;

        info!("Loaded {} in headless Chrome", page.display());
        Ok(Self {
            _browser: browser,
            tab,
            _dir: dir,
        })
    }

    pub fn dom(&self) -> ChromeDom {
        ChromeDom {
            tab: Arc::clone(&self.tab),
        }
    }

    pub fn raster(&self) -> ChromeRaster {
        ChromeRaster {
            tab: Arc::clone(&self.tab),
        }
    }
}

/// The loaded page's document.
pub struct ChromeDom {
    tab: Arc<Tab>,
}

impl DomRoot for ChromeDom {
    fn query_all(&self, selector: &str) -> Vec<ElementRef> {
        let script = format!(
            "(() => {{ const r = {REGISTRY}; \
             return JSON.stringify(Array.from(document.querySelectorAll({sel})).map(el => {{ \
               if (!el.__blockshotKey) {{ el.__blockshotKey = ++r.seq; r.els[el.__blockshotKey] = el; }} \
               return el.__blockshotKey; }})); }})()",
            sel = js_string(selector)
        );
        let keys: Vec<ElementKey> = match eval(&self.tab, &script) {
            Ok(Some(serde_json::Value::String(json))) => serde_json::from_str(&json).unwrap_or_default(),
            Ok(_) => Vec::new(),
            Err(e) => {
                debug!("Query '{}' failed: {}", selector, e);
                Vec::new()
            }
        };
        keys.into_iter()
            .map(|key| {
                Arc::new(ChromeElement {
                    tab: Arc::clone(&self.tab),
                    key,
                }) as ElementRef
            })
            .collect()
    }
}

/// An element registered in the page-side table.
pub struct ChromeElement {
    tab: Arc<Tab>,
    key: ElementKey,
}

impl fmt::Debug for ChromeElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChromeElement").field("key", &self.key).finish()
    }
}

impl ChromeElement {
    fn call(&self, body: &str) -> Result<Option<serde_json::Value>, DomError> {
        let script = format!(
            "(() => {{ const el = {REGISTRY}.els[{key}]; \
             if (!el) throw new Error('element {key} is gone'); {body} }})()",
            key = self.key
        );
        eval(&self.tab, &script)
    }

    fn call_string(&self, body: &str) -> Option<String> {
        match self.call(body) {
            Ok(Some(serde_json::Value::String(s))) => Some(s),
            _ => None,
        }
    }
}

impl DomElement for ChromeElement {
    fn key(&self) -> ElementKey {
        self.key
    }

    fn tag_name(&self) -> String {
        self.call_string("return el.tagName.toLowerCase();")
            .unwrap_or_default()
    }

    fn text_content(&self) -> String {
        self.call_string("return el.textContent || '';")
            .unwrap_or_default()
    }

    fn attribute(&self, name: &str) -> Option<String> {
        self.call_string(&format!("return el.getAttribute({});", js_string(name)))
    }

    fn inline_style(&self, property: &str) -> Option<String> {
        self.call_string(&format!(
            "return el.style.getPropertyValue({});",
            js_string(property)
        ))
        .filter(|v| !v.is_empty())
    }

    fn set_inline_style(&self, property: &str, value: Option<&str>) -> Result<(), DomError> {
        let body = match value {
            Some(v) => format!(
                "el.style.setProperty({}, {}); return true;",
                js_string(property),
                js_string(v)
            ),
            None => format!("el.style.removeProperty({}); return true;", js_string(property)),
        };
        self.call(&body).map(|_| ())
    }

    fn scroll_into_view(&self) -> Result<(), DomError> {
        self.call("el.scrollIntoView({ block: 'center' }); return true;")
            .map(|_| ())
    }
}

#[derive(Debug, Deserialize)]
struct Rect {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

/// Clipped DevTools screenshots of single elements.
pub struct ChromeRaster {
    tab: Arc<Tab>,
}

#[async_trait]
impl RasterBackend for ChromeRaster {
    async fn rasterize(&self, element: &ElementRef, pixel_ratio: f32) -> Result<Vec<u8>, DomError> {
        let tab = Arc::clone(&self.tab);
        let key = element.key();

        tokio::task::spawn_blocking(move || {
            let script = format!(
                "(() => {{ const el = {REGISTRY}.els[{key}]; \
                 if (!el) throw new Error('element {key} is gone'); \
                 const r = el.getBoundingClientRect(); \
                 return JSON.stringify({{ x: r.left + window.scrollX, y: r.top + window.scrollY, \
                   width: r.width, height: r.height }}); }})()"
            );
            let rect: Rect = match eval(&tab, &script)? {
                Some(serde_json::Value::String(json)) => {
                    serde_json::from_str(&json).map_err(|e| DomError(e.to_string()))?
                }
                other => return Err(DomError(format!("unexpected bounding box: {other:?}"))),
            };
            if rect.width < 1.0 || rect.height < 1.0 {
                return Err(DomError(format!(
                    "element has no visible area ({}x{})",
                    rect.width, rect.height
                )));
            }

            let clip = Page::Viewport {
                x: rect.x,
                y: rect.y,
                width: rect.width,
                height: rect.height,
                scale: pixel_ratio as f64,
            };
            tab.capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, Some(clip), true)
                .map_err(|e| DomError(e.to_string()))
        })
        .await
        .map_err(|e| DomError(format!("capture task panicked: {e}")))?
    }
}

//! The DOM query surface the correlator and rasterizer work against.
//!
//! The live document belongs to the host (a browser tab, a headless Chrome
//! session, a test fixture). The pipeline only needs a handful of queries and
//! style mutations, captured by [`DomRoot`] and [`DomElement`].
//!
//! [`MemoryDom`] is a flat in-memory snapshot of the elements a
//! [`crate::render::RenderedDocument`] stamped. It lets `blockshot check`
//! verify scanner/renderer agreement without a browser, and backs the tests.

use crate::error::DomError;
use crate::render::RenderedDocument;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Identity of an element within one [`DomRoot`], used to avoid matching
/// the same element to two blocks.
pub type ElementKey = u64;

/// Shared handle to a rendered element.
pub type ElementRef = Arc<dyn DomElement>;

/// A rendered element.
pub trait DomElement: Send + Sync + fmt::Debug {
    fn key(&self) -> ElementKey;

    /// Lower-case tag name, e.g. `pre`.
    fn tag_name(&self) -> String;

    fn text_content(&self) -> String;

    fn attribute(&self, name: &str) -> Option<String>;

    /// Current inline value of a style property, `None` when unset.
    fn inline_style(&self, property: &str) -> Option<String>;

    /// Set (or with `None`, remove) an inline style property.
    fn set_inline_style(&self, property: &str, value: Option<&str>) -> Result<(), DomError>;

    fn scroll_into_view(&self) -> Result<(), DomError>;
}

/// The root of a rendered document.
pub trait DomRoot: Send + Sync {
    /// All elements matching a CSS selector, in document order.
    fn query_all(&self, selector: &str) -> Vec<ElementRef>;

    /// First element matching a CSS selector.
    fn query(&self, selector: &str) -> Option<ElementRef> {
        self.query_all(selector).into_iter().next()
    }
}

/// CSS selector for an exact attribute value.
pub fn attribute_selector(attribute: &str, value: &str) -> String {
    format!("[{}=\"{}\"]", attribute, value.replace('\\', "\\\\").replace('"', "\\\""))
}

// ── In-memory snapshot ───────────────────────────────────────────────────────

/// One element of a [`MemoryDom`].
pub struct MemoryElement {
    key: ElementKey,
    tag: String,
    classes: Vec<String>,
    attributes: HashMap<String, String>,
    text: String,
    styles: Mutex<HashMap<String, String>>,
    scrolls: Mutex<usize>,
}

impl MemoryElement {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            key: 0,
            tag: tag.into().to_ascii_lowercase(),
            classes: Vec::new(),
            attributes: HashMap::new(),
            text: String::new(),
            styles: Mutex::new(HashMap::new()),
            scrolls: Mutex::new(0),
        }
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.classes.push(class.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_style(self, property: &str, value: &str) -> Self {
        if let Ok(mut styles) = self.styles.lock() {
            styles.insert(property.to_string(), value.to_string());
        }
        self
    }

    /// How many times `scroll_into_view` was called.
    pub fn scroll_count(&self) -> usize {
        self.scrolls.lock().map(|n| *n).unwrap_or(0)
    }

    fn matches_simple(&self, selector: &str) -> bool {
        let selector = selector.trim();
        if selector.is_empty() {
            return false;
        }

        // [name="value"]
        if let Some(inner) = selector.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            return match inner.split_once('=') {
                Some((name, value)) => {
                    let value = value.trim_matches('"').replace("\\\"", "\"").replace("\\\\", "\\");
                    self.attributes.get(name.trim()) == Some(&value)
                }
                None => self.attributes.contains_key(inner.trim()),
            };
        }

        // tag.class.class or .class
        let mut parts = selector.split('.');
        let tag = parts.next().unwrap_or_default();
        if !tag.is_empty() && !tag.eq_ignore_ascii_case(&self.tag) {
            return false;
        }
        parts.all(|class| self.classes.iter().any(|c| c == class))
    }

    /// Supports `tag`, `.class`, `tag.class`, `[attr="value"]` and comma lists.
    pub fn matches(&self, selector: &str) -> bool {
        selector.split(',').any(|s| self.matches_simple(s))
    }
}

impl fmt::Debug for MemoryElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryElement")
            .field("key", &self.key)
            .field("tag", &self.tag)
            .field("classes", &self.classes)
            .field("attributes", &self.attributes)
            .finish()
    }
}

impl DomElement for MemoryElement {
    fn key(&self) -> ElementKey {
        self.key
    }

    fn tag_name(&self) -> String {
        self.tag.clone()
    }

    fn text_content(&self) -> String {
        self.text.clone()
    }

    fn attribute(&self, name: &str) -> Option<String> {
        self.attributes.get(name).cloned()
    }

    fn inline_style(&self, property: &str) -> Option<String> {
        self.styles.lock().ok()?.get(property).cloned()
    }

    fn set_inline_style(&self, property: &str, value: Option<&str>) -> Result<(), DomError> {
        let mut styles = self
            .styles
            .lock()
            .map_err(|_| DomError("style map poisoned".into()))?;
        match value {
            Some(v) => {
                styles.insert(property.to_string(), v.to_string());
            }
            None => {
                styles.remove(property);
            }
        }
        Ok(())
    }

    fn scroll_into_view(&self) -> Result<(), DomError> {
        let mut n = self
            .scrolls
            .lock()
            .map_err(|_| DomError("scroll counter poisoned".into()))?;
        *n += 1;
        Ok(())
    }
}

/// A flat, ordered list of elements answering simple selectors.
#[derive(Debug, Default)]
pub struct MemoryDom {
    elements: Vec<Arc<MemoryElement>>,
}

impl MemoryDom {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an element; document order is insertion order.
    pub fn push(&mut self, mut element: MemoryElement) -> Arc<MemoryElement> {
        element.key = self.elements.len() as ElementKey;
        let element = Arc::new(element);
        self.elements.push(Arc::clone(&element));
        element
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Snapshot the elements a render pass stamped.
    pub fn from_rendered(doc: &RenderedDocument) -> Self {
        let mut dom = Self::new();
        for el in &doc.elements {
            let mut element = MemoryElement::new(&el.tag)
                .with_attribute(&doc.identity_attribute, &el.id)
                .with_text(&el.text);
            for class in &el.classes {
                element = element.with_class(class);
            }
            dom.push(element);
        }
        dom
    }
}

impl DomRoot for MemoryDom {
    fn query_all(&self, selector: &str) -> Vec<ElementRef> {
        self.elements
            .iter()
            .filter(|e| e.matches(selector))
            .map(|e| Arc::clone(e) as ElementRef)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MemoryDom {
        let mut dom = MemoryDom::new();
        dom.push(MemoryElement::new("pre").with_class("code-block").with_attribute("data-block-id", "code-1"));
        dom.push(MemoryElement::new("div").with_class("admonition").with_class("note"));
        dom.push(MemoryElement::new("h2").with_text("Intro"));
        dom.push(MemoryElement::new("pre"));
        dom
    }

    #[test]
    fn selector_forms() {
        let dom = sample();
        assert_eq!(dom.query_all("pre").len(), 2);
        assert_eq!(dom.query_all("pre.code-block").len(), 1);
        assert_eq!(dom.query_all(".admonition").len(), 1);
        assert_eq!(dom.query_all(".admonition.note").len(), 1);
        assert_eq!(dom.query_all("h2, .admonition").len(), 2);
        assert_eq!(dom.query_all(&attribute_selector("data-block-id", "code-1")).len(), 1);
        assert!(dom.query(&attribute_selector("data-block-id", "code-2")).is_none());
    }

    #[test]
    fn document_order_is_insertion_order() {
        let dom = sample();
        let keys: Vec<_> = dom.query_all("pre").iter().map(|e| e.key()).collect();
        assert_eq!(keys, vec![0, 3]);
    }

    #[test]
    fn inline_styles_set_and_remove() {
        let el = MemoryElement::new("div").with_style("width", "100%");
        assert_eq!(el.inline_style("width").as_deref(), Some("100%"));
        el.set_inline_style("width", Some("640px")).unwrap();
        assert_eq!(el.inline_style("width").as_deref(), Some("640px"));
        el.set_inline_style("width", None).unwrap();
        assert_eq!(el.inline_style("width"), None);
    }
}

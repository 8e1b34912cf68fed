//! Reference Markdown → HTML renderer that stamps block identities.
//!
//! The correlator's primary strategy looks elements up by
//! `data-block-id="{kind}-{ordinal}"`. That only works if the renderer
//! numbers blocks exactly like the scanner, so [`render_with`] runs the
//! scanner itself against the caller's [`IdAllocator`] and renders every
//! block span as a dedicated element. Everything between blocks goes through
//! pulldown-cmark unchanged.
//!
//! Hosts with their own renderer only need to honour the same contract: one
//! root element per block, carrying the identity attribute.

use crate::block::{Block, BlockKind};
use crate::pipeline::ids::{IdAllocator, KindCounters};
use crate::pipeline::scan::{BlockScanner, ScanConfig};
use once_cell::sync::Lazy;
use pulldown_cmark::{html, Options, Parser};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Default identity attribute.
pub const IDENTITY_ATTRIBUTE: &str = "data-block-id";

/// An element the renderer stamped with an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedElement {
    pub id: String,
    pub kind: BlockKind,
    pub tag: String,
    pub classes: Vec<String>,
    /// Plain text of the element, as `textContent` would report it.
    pub text: String,
}

/// Output of a render pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedDocument {
    /// HTML fragment (no `<html>`/`<body>` wrapper).
    pub html: String,
    pub identity_attribute: String,
    pub elements: Vec<RenderedElement>,
    pub blocks: Vec<Block>,
}

/// Render with the default scan configuration and a fresh allocator.
pub fn render(markdown: &str) -> RenderedDocument {
    render_with(markdown, &ScanConfig::default(), &mut KindCounters::new(), IDENTITY_ATTRIBUTE)
}

/// Render `markdown`, numbering blocks through `ids`.
pub fn render_with(
    markdown: &str,
    config: &ScanConfig,
    ids: &mut dyn IdAllocator,
    identity_attribute: &str,
) -> RenderedDocument {
    let report = BlockScanner::new(config).scan(markdown, ids);

    let mut out = String::with_capacity(markdown.len() * 2);
    let mut elements = Vec::with_capacity(report.blocks.len());
    let mut cursor = 0;

    for block in &report.blocks {
        push_markdown(&mut out, &markdown[cursor..block.start_offset]);
        let element = push_block(&mut out, block, identity_attribute);
        elements.push(element);
        cursor = block.end_offset;
    }
    push_markdown(&mut out, &markdown[cursor..]);

    RenderedDocument {
        html: out,
        identity_attribute: identity_attribute.to_string(),
        elements,
        blocks: report.blocks,
    }
}

/// Wrap a rendered fragment into a standalone page for a headless browser.
///
/// The body is laid out at `width` CSS pixels, roughly the WeChat article
/// column, so captured blocks match what readers see.
pub fn html_page(doc: &RenderedDocument, width: u32, extra_css: Option<&str>) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">\
<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
<style>{}\nbody {{ width: {}px; }}\n{}</style></head>\
<body>\n{}</body></html>\n",
        BASE_CSS,
        width,
        extra_css.unwrap_or(""),
        doc.html
    )
}

const BASE_CSS: &str = r#"
body { font-family: -apple-system, BlinkMacSystemFont, "PingFang SC", "Microsoft YaHei", sans-serif;
       line-height: 1.75; color: #333; background: #fff; margin: 0 auto; padding: 16px; }
pre { background: #f6f8fa; padding: 12px; border-radius: 6px; overflow-x: auto; font-size: 13px; }
code { font-family: "SFMono-Regular", Consolas, Menlo, monospace; }
.admonition { border-left: 4px solid #448aff; background: #f5f9ff; padding: 8px 16px; margin: 16px 0; }
.admonition-title { font-weight: 600; margin: 0 0 8px; }
.admonition.warning { border-color: #ff9100; background: #fff8ef; }
.admonition.danger { border-color: #ff1744; background: #fff3f5; }
.math-block { text-align: center; padding: 8px 0; overflow-x: auto; }
"#;

fn push_markdown(out: &mut String, text: &str) {
    if text.trim().is_empty() {
        return;
    }
    let options = Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH | Options::ENABLE_FOOTNOTES;
    html::push_html(out, Parser::new_ext(text, options));
}

static RE_ADMONITION_HEAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^(?:!!!|\?\?\?\+?)[ \t]*([A-Za-z][\w-]*)(?:[ \t]+"([^"]*)")?"#).unwrap()
});

fn push_block(out: &mut String, block: &Block, attribute: &str) -> RenderedElement {
    let id_attr = format!("{}=\"{}\"", attribute, escape_html(&block.id));

    let (tag, classes, text) = match &block.kind {
        BlockKind::Admonition => {
            let (head, body) = block
                .content
                .split_once('\n')
                .unwrap_or((block.content.as_str(), ""));
            let (kind, title) = match RE_ADMONITION_HEAD.captures(head) {
                Some(caps) => {
                    let kind = caps[1].to_ascii_lowercase();
                    let title = caps
                        .get(2)
                        .map(|t| t.as_str().to_string())
                        .unwrap_or_else(|| capitalise(&kind));
                    (kind, title)
                }
                None => ("note".to_string(), "Note".to_string()),
            };
            let body = dedent(body);
            out.push_str(&format!(
                "<div class=\"admonition {}\" {}>\n<p class=\"admonition-title\">{}</p>\n",
                escape_html(&kind),
                id_attr,
                escape_html(&title)
            ));
            push_markdown(out, &body);
            out.push_str("</div>\n");
            let text = format!("{}\n{}", title, body.trim());
            ("div", vec!["admonition".to_string(), kind], text)
        }
        BlockKind::Math => {
            out.push_str(&format!(
                "<div class=\"math-block\" {}>{}</div>\n",
                id_attr,
                escape_html(&block.content)
            ));
            ("div", vec!["math-block".to_string()], block.content.clone())
        }
        BlockKind::Code => {
            let (language, code) = split_fence(&block.content);
            let class = match &language {
                Some(lang) => format!(" class=\"language-{}\"", escape_html(lang)),
                None => String::new(),
            };
            out.push_str(&format!(
                "<pre class=\"code-block\" {}><code{}>{}</code></pre>\n",
                id_attr,
                class,
                escape_html(&code)
            ));
            ("pre", vec!["code-block".to_string()], code)
        }
        BlockKind::Heading(level) => {
            let text = block.heading_text().unwrap_or_default();
            out.push_str(&format!(
                "<h{level} {}>{}</h{level}>\n",
                id_attr,
                escape_html(&text)
            ));
            return RenderedElement {
                id: block.id.clone(),
                kind: block.kind.clone(),
                tag: format!("h{level}"),
                classes: Vec::new(),
                text,
            };
        }
        BlockKind::Custom(name) => {
            let class = format!("block-{name}");
            out.push_str(&format!("<div class=\"{}\" {}>\n", escape_html(&class), id_attr));
            push_markdown(out, &block.content);
            out.push_str("</div>\n");
            ("div", vec![class], block.content.clone())
        }
    };

    RenderedElement {
        id: block.id.clone(),
        kind: block.kind.clone(),
        tag: tag.to_string(),
        classes,
        text,
    }
}

/// Split a fenced block into its info-string language and body.
fn split_fence(content: &str) -> (Option<String>, String) {
    let mut lines: Vec<&str> = content.lines().collect();
    if lines.len() < 2 {
        return (None, String::new());
    }
    let opening = lines.remove(0);
    lines.pop();

    let indent = opening.len() - opening.trim_start().len();
    let info = opening.trim_start().trim_start_matches(['`', '~']).trim();
    let language = info.split_whitespace().next().map(str::to_string);

    let body = lines
        .iter()
        .map(|l| strip_indent(l, indent))
        .collect::<Vec<_>>()
        .join("\n");
    (language, body)
}

fn strip_indent(line: &str, max: usize) -> &str {
    let n = line
        .bytes()
        .take(max)
        .take_while(|b| *b == b' ' || *b == b'\t')
        .count();
    &line[n..]
}

/// Remove one level (4 spaces or a tab) of admonition body indentation.
fn dedent(body: &str) -> String {
    body.lines()
        .map(|l| {
            l.strip_prefix("    ")
                .or_else(|| l.strip_prefix('\t'))
                .unwrap_or(l)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn capitalise(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

//! Incremental render driver.
//!
//! Turns a (possibly still-growing) text buffer into sanitized HTML on every
//! streamed chunk: protect math/diagram spans, parse the masked Markdown,
//! restore the protected blocks, then run the deferred diagram pass. The
//! whole buffer is re-parsed from scratch on each chunk — Markdown constructs
//! like an unterminated fence change meaning as later characters arrive, so
//! an append-only parse would need a full re-parse in the worst case anyway.

use crate::protect::{
    self, Block, BlockKind, diagram_container_id, escape_html, pending_container,
};
use anyhow::Result;
use async_trait::async_trait;
use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd};
use std::collections::{HashMap, HashSet};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::LazyLock;
use syntect::highlighting::ThemeSet;
use syntect::html::highlighted_html_for_string;
use syntect::parsing::SyntaxSet;

// Syntax highlighting resources (loaded once)
static SYNTAX_SET: LazyLock<SyntaxSet> = LazyLock::new(SyntaxSet::load_defaults_newlines);
static THEME_SET: LazyLock<ThemeSet> = LazyLock::new(ThemeSet::load_defaults);

const THEME: &str = "base16-ocean.dark";

/// Math typesetter: TeX source in, HTML out.
pub trait MathRenderer: Send + Sync {
    fn render(&self, tex: &str, display: bool) -> Result<String>;
}

/// Diagram engine: diagram source in, vector markup out.
#[async_trait]
pub trait DiagramRenderer: Send + Sync {
    async fn render(&self, source: &str) -> Result<String>;
}

/// No-engine math fallback: escaped source in a styled span.
pub struct PlainMathRenderer;

impl MathRenderer for PlainMathRenderer {
    fn render(&self, tex: &str, display: bool) -> Result<String> {
        let mode = if display { "display" } else { "inline" };
        Ok(format!(
            "<span class=\"math math-{}\">{}</span>",
            mode,
            escape_html(tex)
        ))
    }
}

/// No-engine diagram fallback: the source shown preformatted.
pub struct PlainDiagramRenderer;

#[async_trait]
impl DiagramRenderer for PlainDiagramRenderer {
    async fn render(&self, source: &str) -> Result<String> {
        Ok(format!(
            "<pre class=\"diagram-text\">{}</pre>",
            escape_html(source)
        ))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RenderMode {
    Full,
    Streaming,
}

/// The display slot an in-progress or committed message renders into.
/// Holds the current HTML plus the per-target state that makes repeated
/// streaming renders cheap and idempotent: the syntax-highlight cache and
/// the diagram containers already rendered or errored.
#[derive(Default)]
pub struct RenderTarget {
    html: String,
    highlight_cache: HashMap<u64, String>,
    diagrams: HashMap<String, DiagramCell>,
}

struct DiagramCell {
    source: String,
    /// Final container markup once the engine ran (success or error).
    done: Option<String>,
}

const TOOLBAR: &str = "<div class=\"message-toolbar\"><button class=\"toolbar-btn toolbar-copy\">Copy</button><button class=\"toolbar-btn toolbar-retry\">Retry</button></div>";

impl RenderTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_html(html: &str) -> Self {
        Self {
            html: html.to_string(),
            ..Self::default()
        }
    }

    pub fn html(&self) -> &str {
        &self.html
    }

    pub fn set_html(&mut self, html: String) {
        self.html = html;
    }

    /// Replace the content with an inline error message.
    pub fn show_error(&mut self, message: &str) {
        self.html = format!(
            "<span class=\"error-text\">⚠️ Error: {}</span>",
            escape_html(message)
        );
    }

    /// Append the copy/retry affordance, once.
    pub fn attach_toolbar(&mut self) {
        if !self.html.contains("message-toolbar") {
            self.html.push_str(TOOLBAR);
        }
    }

    pub fn has_toolbar(&self) -> bool {
        self.html.contains("message-toolbar")
    }

    pub fn pending_diagrams(&self) -> usize {
        self.diagrams.values().filter(|c| c.done.is_none()).count()
    }

    pub fn completed_diagrams(&self) -> usize {
        self.diagrams.values().filter(|c| c.done.is_some()).count()
    }

    pub fn highlighted_blocks(&self) -> usize {
        self.highlight_cache.len()
    }
}

/// The render pipeline with its pluggable math and diagram engines.
#[derive(Clone)]
pub struct Renderer {
    math: Arc<dyn MathRenderer>,
    diagram: Arc<dyn DiagramRenderer>,
}

impl Renderer {
    pub fn new(math: Arc<dyn MathRenderer>, diagram: Arc<dyn DiagramRenderer>) -> Self {
        Self { math, diagram }
    }

    /// Renderer with the built-in no-engine fallbacks.
    pub fn plain() -> Self {
        Self::new(Arc::new(PlainMathRenderer), Arc::new(PlainDiagramRenderer))
    }

    /// Full render: highlights every code block unconditionally. Used for
    /// the final pass and for re-displaying stored messages.
    pub fn render_full(&self, text: &str, target: &mut RenderTarget) {
        self.render(text, target, RenderMode::Full);
    }

    /// Streaming render: skips syntax highlighting for code blocks already
    /// highlighted on an earlier chunk, which keeps the per-chunk cost
    /// linear over the stream instead of quadratic.
    pub fn render_streaming(&self, text: &str, target: &mut RenderTarget) {
        self.render(text, target, RenderMode::Streaming);
    }

    fn render(&self, text: &str, target: &mut RenderTarget, mode: RenderMode) {
        let (masked, blocks) = protect::protect(text);
        let html = self.markdown_to_html(&masked, target, mode);
        let html = protect::restore(&html, &blocks, self.math.as_ref());
        let mut html = protect::strip_empty_paragraphs(&html);
        self.reconcile_diagrams(&blocks, &mut html, target);
        target.html = html;
    }

    /// Run the deferred diagram pass: feed every still-pending container to
    /// the engine and splice in the result (or an inline error block). Safe
    /// to invoke repeatedly; containers already rendered or errored are
    /// never re-rendered.
    pub async fn render_diagrams(&self, target: &mut RenderTarget) {
        let pending: Vec<(String, String)> = target
            .diagrams
            .iter()
            .filter(|(_, cell)| cell.done.is_none())
            .map(|(id, cell)| (id.clone(), cell.source.clone()))
            .collect();

        for (id, source) in pending {
            let done = match self.diagram.render(&source).await {
                Ok(svg) => rendered_container(&id, &svg),
                Err(e) => {
                    crate::logging::warn(&format!("diagram render error: {}", e));
                    errored_container(&id, &e.to_string())
                }
            };
            let pending_markup = pending_container(&id, &source);
            target.html = target.html.replace(&pending_markup, &done);
            if let Some(cell) = target.diagrams.get_mut(&id) {
                cell.done = Some(done);
            }
        }
    }

    /// Final pass after stream completion: guarantees the asynchronous
    /// diagram work runs to completion even if a streaming-call pass was
    /// still in flight.
    pub async fn finalize(&self, target: &mut RenderTarget) {
        self.render_diagrams(target).await;
    }

    /// Parse masked Markdown into HTML. Code blocks are routed through the
    /// highlighter; raw HTML events from the input are escaped rather than
    /// trusted.
    fn markdown_to_html(
        &self,
        masked: &str,
        target: &mut RenderTarget,
        mode: RenderMode,
    ) -> String {
        let mut options = Options::empty();
        options.insert(Options::ENABLE_TABLES);
        options.insert(Options::ENABLE_STRIKETHROUGH);
        let parser = Parser::new_ext(masked, options);

        let mut events: Vec<Event> = Vec::new();
        let mut in_code = false;
        let mut code_lang: Option<String> = None;
        let mut code_buf = String::new();

        for event in parser {
            match event {
                Event::Start(Tag::CodeBlock(kind)) => {
                    in_code = true;
                    code_lang = match kind {
                        CodeBlockKind::Fenced(lang) if !lang.is_empty() => Some(lang.to_string()),
                        _ => None,
                    };
                    code_buf.clear();
                }
                Event::End(TagEnd::CodeBlock) => {
                    in_code = false;
                    let block = self.highlight_block(code_lang.take().as_deref(), &code_buf, target, mode);
                    events.push(Event::Html(block.into()));
                }
                Event::Text(text) if in_code => code_buf.push_str(&text),
                Event::Html(raw) => events.push(Event::Text(raw)),
                Event::InlineHtml(raw) => events.push(Event::Text(raw)),
                other => events.push(other),
            }
        }

        let mut html = String::with_capacity(masked.len() * 3 / 2);
        pulldown_cmark::html::push_html(&mut html, events.into_iter());
        html
    }

    fn highlight_block(
        &self,
        lang: Option<&str>,
        code: &str,
        target: &mut RenderTarget,
        mode: RenderMode,
    ) -> String {
        let key = block_key(lang, code);
        if mode == RenderMode::Streaming {
            if let Some(cached) = target.highlight_cache.get(&key) {
                return cached.clone();
            }
        }
        let rendered = highlight_code(lang, code);
        target.highlight_cache.insert(key, rendered.clone());
        rendered
    }

    /// Keep the target's diagram cells in step with this pass: substitute
    /// already-finished containers back into the fresh HTML and register new
    /// sources as pending. Cells whose container no longer occurs are pruned.
    fn reconcile_diagrams(&self, blocks: &[Block], html: &mut String, target: &mut RenderTarget) {
        let mut seen = HashSet::new();
        let mut n = 0;
        for block in blocks.iter().filter(|b| b.kind == BlockKind::Diagram) {
            let id = diagram_container_id(n, &block.raw);
            n += 1;
            seen.insert(id.clone());

            let cell = target
                .diagrams
                .entry(id.clone())
                .or_insert_with(|| DiagramCell {
                    source: block.raw.clone(),
                    done: None,
                });
            if let Some(done) = &cell.done {
                *html = html.replace(&pending_container(&id, &block.raw), done);
            }
        }
        target.diagrams.retain(|id, _| seen.contains(id));
    }
}

fn block_key(lang: Option<&str>, code: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    lang.hash(&mut hasher);
    code.hash(&mut hasher);
    hasher.finish()
}

fn highlight_code(lang: Option<&str>, code: &str) -> String {
    let syntax = lang
        .and_then(|l| SYNTAX_SET.find_syntax_by_token(l))
        .unwrap_or_else(|| SYNTAX_SET.find_syntax_plain_text());
    let theme = &THEME_SET.themes[THEME];

    match highlighted_html_for_string(code, &SYNTAX_SET, syntax, theme) {
        Ok(html) => format!(
            "<div class=\"code-block\" data-lang=\"{}\">{}</div>",
            escape_html(lang.unwrap_or("")),
            html
        ),
        Err(_) => format!("<pre><code>{}</code></pre>", escape_html(code)),
    }
}

fn rendered_container(id: &str, svg: &str) -> String {
    format!(
        "<div class=\"diagram-container\" data-diagram-id=\"{}\" data-rendered=\"true\"><div class=\"diagram-result\">{}</div></div>",
        id, svg
    )
}

fn errored_container(id: &str, message: &str) -> String {
    format!(
        "<div class=\"diagram-container\" data-diagram-id=\"{}\" data-rendered=\"error\"><div class=\"diagram-error\"><div class=\"diagram-error-title\">Diagram rendering failed</div><code>{}</code></div></div>",
        id,
        escape_html(message)
    )
}

//! Delimiter protection for math and diagram sub-languages.
//!
//! A generic Markdown pass mangles LaTeX delimiters (`\[`, `\(`) and diagram
//! fences, so `protect` lifts those spans out of the text and replaces them
//! with opaque placeholder tokens before parsing; `restore` swaps the tokens
//! back in as rendered fragments afterwards. Each call is self-contained:
//! blocks never outlive the protect/restore pair that produced them.

use crate::render::MathRenderer;
use regex::Regex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Diagram,
    DisplayMath,
    InlineMath,
}

/// One extracted sub-language span. Transient: lives for a single render pass.
#[derive(Debug, Clone)]
pub struct Block {
    pub kind: BlockKind,
    pub raw: String,
    pub token: String,
}

/// Spans claimed so far, kept in extraction order alongside `blocks`.
struct Claims {
    spans: Vec<(usize, usize, usize)>, // (start, end, block index)
}

impl Claims {
    fn new() -> Self {
        Self { spans: Vec::new() }
    }

    /// If [start, end) intersects an existing claim, return the position
    /// scanning should resume from instead.
    fn conflict(&self, start: usize, end: usize) -> Option<usize> {
        self.spans
            .iter()
            .filter(|(s, e, _)| start < *e && *s < end)
            .map(|(_, e, _)| (*e).max(start + 1))
            .max()
    }

    fn claim(&mut self, start: usize, end: usize, block: usize) {
        self.spans.push((start, end, block));
    }
}

/// Extract diagram and math spans, replacing each with a placeholder token.
///
/// Patterns are applied in priority order — diagram fences, `$$…$$`,
/// `\[…\]`, `$…$` (with a currency guard), `\(…\)` — and an earlier claim
/// removes its span from consideration, so later patterns never match inside
/// already-claimed text.
pub fn protect(text: &str) -> (String, Vec<Block>) {
    let mut blocks: Vec<Block> = Vec::new();
    let mut claims = Claims::new();

    scan_diagram_fences(text, &mut blocks, &mut claims);
    scan_delimited(text, "$$", "$$", BlockKind::DisplayMath, &mut blocks, &mut claims);
    scan_delimited(text, "\\[", "\\]", BlockKind::DisplayMath, &mut blocks, &mut claims);
    scan_inline_dollar(text, &mut blocks, &mut claims);
    scan_delimited(text, "\\(", "\\)", BlockKind::InlineMath, &mut blocks, &mut claims);

    // Second pass: stitch the masked string together in document order.
    let mut spans = claims.spans;
    spans.sort_by_key(|(start, _, _)| *start);

    let mut masked = String::with_capacity(text.len());
    let mut cursor = 0;
    for (start, end, block) in spans {
        masked.push_str(&text[cursor..start]);
        masked.push_str(&blocks[block].token);
        cursor = end;
    }
    masked.push_str(&text[cursor..]);

    (masked, blocks)
}

fn token_for(kind: BlockKind, index: usize) -> String {
    match kind {
        BlockKind::Diagram => format!("%%DIAGRAM_{}%%", index),
        BlockKind::DisplayMath => format!("%%MATH_DISPLAY_{}%%", index),
        BlockKind::InlineMath => format!("%%MATH_INLINE_{}%%", index),
    }
}

fn push_block(
    blocks: &mut Vec<Block>,
    claims: &mut Claims,
    kind: BlockKind,
    raw: &str,
    start: usize,
    end: usize,
) {
    let index = blocks.len();
    blocks.push(Block {
        kind,
        raw: raw.to_string(),
        token: token_for(kind, index),
    });
    claims.claim(start, end, index);
}

/// ```` ```mermaid … ``` ```` fenced blocks. The stored source is trimmed.
fn scan_diagram_fences(text: &str, blocks: &mut Vec<Block>, claims: &mut Claims) {
    const OPEN: &str = "```mermaid\n";
    const CLOSE: &str = "```";

    let mut pos = 0;
    while let Some(rel) = text[pos..].find(OPEN) {
        let start = pos + rel;
        let inner_start = start + OPEN.len();
        let Some(rel_close) = text[inner_start..].find(CLOSE) else {
            break;
        };
        let inner_end = inner_start + rel_close;
        let end = inner_end + CLOSE.len();

        if let Some(resume) = claims.conflict(start, end) {
            pos = resume;
            continue;
        }

        push_block(
            blocks,
            claims,
            BlockKind::Diagram,
            text[inner_start..inner_end].trim(),
            start,
            end,
        );
        pos = end;
    }
}

/// Multi-line, non-greedy `open … close` spans (`$$…$$`, `\[…\]`, `\(…\)`).
fn scan_delimited(
    text: &str,
    open: &str,
    close: &str,
    kind: BlockKind,
    blocks: &mut Vec<Block>,
    claims: &mut Claims,
) {
    let mut pos = 0;
    while let Some(rel) = text[pos..].find(open) {
        let start = pos + rel;
        let inner_start = start + open.len();
        let Some(rel_close) = text[inner_start..].find(close) else {
            break;
        };
        let inner_end = inner_start + rel_close;
        let end = inner_end + close.len();

        if let Some(resume) = claims.conflict(start, end) {
            pos = resume;
            continue;
        }

        push_block(blocks, claims, kind, &text[inner_start..inner_end], start, end);
        pos = end;
    }
}

/// Single-dollar inline math: the content must stay on one line, and content
/// that leads with a digit (optionally after whitespace) is treated as
/// currency, not math.
fn scan_inline_dollar(text: &str, blocks: &mut Vec<Block>, claims: &mut Claims) {
    let mut pos = 0;
    while let Some(rel) = text[pos..].find('$') {
        let start = pos + rel;
        let inner_start = start + 1;
        let rest = &text[inner_start..];

        let Some(stop) = rest.find(['$', '\n']) else {
            break;
        };
        if rest.as_bytes()[stop] != b'$' || stop == 0 {
            // no closer on this line, or an empty "$$" leftover
            pos = inner_start;
            continue;
        }

        let inner = &rest[..stop];
        let end = inner_start + stop + 1;

        if let Some(resume) = claims.conflict(start, end) {
            pos = resume;
            continue;
        }
        if inner
            .trim_start()
            .starts_with(|c: char| c.is_ascii_digit())
        {
            // currency like "$5" or "$ 5"; skip past the whole candidate
            pos = end;
            continue;
        }

        push_block(blocks, claims, BlockKind::InlineMath, inner, start, end);
        pos = end;
    }
}

/// Stable container id for the `n`th diagram of a render pass. The content
/// hash keeps the id unchanged while the stream appends text after it, which
/// is what lets the render driver reuse an already-rendered diagram.
pub fn diagram_container_id(n: usize, source: &str) -> String {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    format!("diagram-{}-{:016x}", n, hasher.finish())
}

/// The not-yet-rendered container emitted by `restore`. The raw source is
/// entity-escaped before it touches the output.
pub fn pending_container(id: &str, source: &str) -> String {
    format!(
        "<div class=\"diagram-container\" data-diagram-id=\"{}\"><div class=\"diagram-source\" style=\"display:none;\">{}</div><div class=\"diagram-pending\">Rendering diagram…</div></div>",
        id,
        escape_html(source)
    )
}

/// Replace placeholder tokens in Markdown-rendered HTML with rendered
/// fragments: pending containers for diagrams, typeset output for math.
/// A math renderer failure falls back to the literal delimited source
/// (escaped) instead of failing the render.
pub fn restore(html: &str, blocks: &[Block], math: &dyn MathRenderer) -> String {
    let mut out = html.to_string();
    let mut diagram_n = 0;

    for block in blocks {
        let replacement = match block.kind {
            BlockKind::Diagram => {
                let id = diagram_container_id(diagram_n, &block.raw);
                diagram_n += 1;
                format!("</p>{}<p>", pending_container(&id, &block.raw))
            }
            BlockKind::DisplayMath => match math.render(&decode_entities(&block.raw), true) {
                Ok(rendered) => {
                    format!("</p><div class=\"math-display-block\">{}</div><p>", rendered)
                }
                Err(e) => {
                    crate::logging::debug(&format!("math render error: {}", e));
                    format!("$${}$$", escape_html(&block.raw))
                }
            },
            BlockKind::InlineMath => match math.render(&decode_entities(&block.raw), false) {
                Ok(rendered) => rendered,
                Err(e) => {
                    crate::logging::debug(&format!("math render error: {}", e));
                    format!("${}$", escape_html(&block.raw))
                }
            },
        };
        out = out.replace(&block.token, &replacement);
    }

    out
}

static EMPTY_PARAGRAPH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<p>\s*</p>").unwrap());

/// Strip the empty `<p></p>` wrappers left behind when a block-level element
/// is spliced out of a paragraph.
pub fn strip_empty_paragraphs(html: &str) -> String {
    EMPTY_PARAGRAPH.replace_all(html, "").into_owned()
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
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

/// Undo HTML entity escaping before handing math source to the typesetter
/// (`&lt;` in `a &lt; b` must reach it as `<`).
pub fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];

        let Some(semi) = rest.find(';') else {
            out.push_str(rest);
            return out;
        };
        let entity = &rest[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|h| u32::from_str_radix(h, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

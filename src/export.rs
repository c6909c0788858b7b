//! HTML export of a stored conversation.
//!
//! The terminal client has no DOM to render into, so export is how a full
//! conversation is viewed with everything the pipeline produces: highlighted
//! code, typeset math, rendered diagrams.

use crate::protect::escape_html;
use crate::render::{RenderTarget, Renderer};
use crate::store::Conversation;

const STYLE: &str = "body{max-width:52rem;margin:2rem auto;font-family:sans-serif;background:#0f172a;color:#f8fafc}\
.message{margin:1rem 0;padding:0.75rem 1rem;border-radius:8px}\
.message.user{background:#1e293b}\
.message.assistant{background:#111827}\
.thumbnail{max-width:320px;border-radius:6px}\
.error-text{color:#ef4444}\
.diagram-pending,.diagram-error{color:#94a3b8}";

/// Render every message of a conversation through the full pipeline into one
/// standalone HTML document.
pub async fn export_conversation(renderer: &Renderer, conv: &Conversation) -> String {
    let mut body = String::new();

    for message in &conv.messages {
        let role = match message.role {
            crate::message::Role::User => "user",
            crate::message::Role::Assistant => "assistant",
        };

        let mut target = RenderTarget::new();
        let text = message.content.text();
        if !text.is_empty() {
            renderer.render_full(&text, &mut target);
            renderer.finalize(&mut target).await;
        }
        let mut html = target.html().to_string();
        for url in message.content.image_urls() {
            html.push_str(&format!(
                "<img class=\"thumbnail\" src=\"{}\" alt=\"Image\">",
                escape_html(url)
            ));
        }

        body.push_str(&format!(
            "<div class=\"message {}\">{}</div>\n",
            role, html
        ));
    }

    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{}</title><style>{}</style></head><body>\n<h1>{}</h1>\n{}</body></html>\n",
        escape_html(&conv.title),
        STYLE,
        escape_html(&conv.title),
        body
    )
}

//! Backend service boundary: streaming chat completions, title generation,
//! and image generation.

use crate::config::config;
use crate::message::Message;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

/// Stream of events from a provider
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Streaming event from the chat completion endpoint
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Text content delta
    TextDelta(String),
    /// End-of-stream sentinel observed
    MessageEnd,
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub url: String,
    pub thought_signature: Option<String>,
}

/// Provider trait for the chat backend
#[async_trait]
pub trait Provider: Send + Sync {
    /// Send the transcript and get a streaming response
    async fn stream_chat(&self, model: &str, messages: &[Message]) -> Result<EventStream>;

    /// Best-effort title for a new conversation
    async fn generate_title(&self, message: &str) -> Result<String>;

    /// Non-streaming image generation
    async fn generate_image(&self, model: &str, messages: &[Message]) -> Result<GeneratedImage>;

    fn name(&self) -> &str;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
}

#[derive(Serialize)]
struct TitleRequest<'a> {
    message: &'a str,
}

#[derive(Deserialize)]
struct TitleResponse {
    title: Option<String>,
}

#[derive(Serialize)]
struct ImageRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
}

#[derive(Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageData>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ImageData {
    url: String,
    #[serde(default, rename = "thoughtSignature")]
    thought_signature: Option<String>,
}

#[derive(Deserialize, Debug)]
struct SseChunk {
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Debug, Default)]
struct Delta {
    content: Option<String>,
}

/// Pull a human-readable message out of an `{error}` response body, which
/// the service sends either as a plain string or as `{message: ...}`.
fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(error) = value.get("error") {
            return error_value_message(error);
        }
    }
    body.to_string()
}

fn error_value_message(error: &serde_json::Value) -> String {
    if let Some(s) = error.as_str() {
        return s.to_string();
    }
    if let Some(s) = error.get("message").and_then(|m| m.as_str()) {
        return s.to_string();
    }
    error.to_string()
}

/// Stream wrapper for server-sent completion events.
///
/// Buffers raw bytes, splits on newlines, and surfaces one event per
/// well-formed `data:` line. Lines without the data prefix are ignored and a
/// malformed JSON payload skips that single chunk — one corrupt chunk must
/// not abort the whole stream.
struct SseStream {
    inner: Pin<Box<dyn Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send>>,
    buffer: String,
    done: bool,
}

impl SseStream {
    fn new(stream: impl Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(stream),
            buffer: String::new(),
            done: false,
        }
    }

    fn parse_next_event(&mut self) -> Option<StreamEvent> {
        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].to_string();
            self.buffer = self.buffer[pos + 1..].to_string();

            if let Some(data) = line.strip_prefix("data: ") {
                if data == "[DONE]" {
                    self.done = true;
                    return Some(StreamEvent::MessageEnd);
                }

                if let Ok(chunk) = serde_json::from_str::<SseChunk>(data) {
                    if let Some(content) = chunk
                        .choices
                        .first()
                        .and_then(|c| c.delta.content.as_ref())
                    {
                        if !content.is_empty() {
                            return Some(StreamEvent::TextDelta(content.clone()));
                        }
                    }
                }
            }
        }
        None
    }
}

impl Stream for SseStream {
    type Item = Result<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(event) = self.parse_next_event() {
                return Poll::Ready(Some(Ok(event)));
            }
            if self.done {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    if let Ok(text) = std::str::from_utf8(&bytes) {
                        self.buffer.push_str(text);
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(anyhow::anyhow!("Stream error: {}", e))));
                }
                Poll::Ready(None) => {
                    // connection close also terminates the stream
                    return Poll::Ready(None);
                }
                Poll::Pending => {
                    return Poll::Pending;
                }
            }
        }
    }
}

/// HTTP implementation against the chat service endpoints.
pub struct HttpProvider {
    client: Client,
    base_url: String,
}

impl HttpProvider {
    pub fn new() -> Self {
        Self::with_base_url(&config().server.base_url)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(format!("{}{}", self.base_url, path));
        if let Some(key) = &config().server.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        builder
    }
}

impl Default for HttpProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn stream_chat(&self, model: &str, messages: &[Message]) -> Result<EventStream> {
        let request = ChatRequest {
            model,
            messages,
            stream: true,
        };

        let response = self
            .request("/api/chat/completions")
            .json(&request)
            .send()
            .await
            .context("Failed to reach chat service")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("chat service error {}: {}", status, error_message(&body));
        }

        Ok(Box::pin(SseStream::new(response.bytes_stream())))
    }

    async fn generate_title(&self, message: &str) -> Result<String> {
        let response = self
            .request("/api/chat/generate-title")
            .json(&TitleRequest { message })
            .send()
            .await
            .context("Failed to reach title endpoint")?;

        if !response.status().is_success() {
            anyhow::bail!("title endpoint error {}", response.status());
        }

        let parsed: TitleResponse = response.json().await?;
        Ok(parsed.title.unwrap_or_else(|| "New Chat".to_string()))
    }

    async fn generate_image(&self, model: &str, messages: &[Message]) -> Result<GeneratedImage> {
        let response = self
            .request("/api/images/generations")
            .json(&ImageRequest { model, messages })
            .send()
            .await
            .context("Failed to reach image endpoint")?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("image service error {}: {}", status, error_message(&body));
        }

        let parsed: ImageResponse = serde_json::from_str(&body)?;
        if let Some(error) = parsed.error {
            anyhow::bail!("{}", error_value_message(&error));
        }
        let first = parsed
            .data
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Image generation returned no data"))?;

        Ok(GeneratedImage {
            url: first.url,
            thought_signature: first.thought_signature,
        })
    }

    fn name(&self) -> &str {
        "http"
    }
}

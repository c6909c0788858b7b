//! Generation session lifecycle.
//!
//! `ChatContext` is the long-lived owner of everything a session touches:
//! the transcript, the display targets, the generating flag, and the
//! cancellation handle. At most one generation is active at a time; starting
//! anything new first runs the cancellation path to completion, including
//! its partial-commit side effect.

use crate::config::config;
use crate::id;
use crate::logging;
use crate::message::{ContentPart, ImageRef, Message, MessageContent, Role};
use crate::protect::escape_html;
use crate::provider::{Provider, StreamEvent};
use crate::render::{RenderTarget, Renderer};
use crate::store::ConversationStore;
use anyhow::Result;
use futures::StreamExt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// One named transition per UI action; the REPL produces these instead of
/// wiring closures into the state machine.
#[derive(Debug, Clone)]
pub enum UiEvent {
    Send { text: String, images: Vec<String> },
    Stop,
    Retry,
    Edit { index: usize, text: String },
    NewChat,
    OpenConversation { id: String },
    DeleteConversation { id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerateOutcome {
    /// A session was already generating; the request was rejected untouched.
    Busy,
    Completed,
    Cancelled,
    Errored,
}

/// Session-owned mutable state. `display` mirrors the transcript one-to-one,
/// except that an in-progress response holds one extra trailing slot until
/// it commits.
pub(crate) struct ChatState {
    pub(crate) conversation_id: String,
    pub(crate) transcript: Vec<Message>,
    pub(crate) display: Vec<RenderTarget>,
    generating: bool,
    cancel: Option<CancellationToken>,
    accumulated: String,
    active_target: Option<usize>,
}

impl ChatState {
    fn new() -> Self {
        Self {
            conversation_id: id::new_id("conv"),
            transcript: Vec::new(),
            display: Vec::new(),
            generating: false,
            cancel: None,
            accumulated: String::new(),
            active_target: None,
        }
    }
}

enum StreamEnd {
    Completed,
    Cancelled,
    Errored(String),
}

pub struct ChatContext {
    provider: Arc<dyn Provider>,
    renderer: Renderer,
    store: StdMutex<ConversationStore>,
    pub(crate) state: Mutex<ChatState>,
    model: StdMutex<String>,
}

impl ChatContext {
    pub fn new(provider: Arc<dyn Provider>, renderer: Renderer) -> Result<Arc<Self>> {
        let store = ConversationStore::open_default()?;
        Ok(Self::with_store(provider, renderer, store))
    }

    pub fn with_store(
        provider: Arc<dyn Provider>,
        renderer: Renderer,
        store: ConversationStore,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            renderer,
            store: StdMutex::new(store),
            state: Mutex::new(ChatState::new()),
            model: StdMutex::new(config().chat.model.clone()),
        })
    }

    pub fn model(&self) -> String {
        self.model.lock().unwrap().clone()
    }

    pub fn set_model(&self, model: &str) {
        *self.model.lock().unwrap() = model.to_string();
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    /// Lock the store for direct reads (listing, search, export).
    pub fn store(&self) -> MutexGuard<'_, ConversationStore> {
        self.store.lock().unwrap()
    }

    pub async fn is_generating(&self) -> bool {
        self.state.lock().await.generating
    }

    pub async fn conversation_id(&self) -> String {
        self.state.lock().await.conversation_id.clone()
    }

    pub async fn transcript(&self) -> Vec<Message> {
        self.state.lock().await.transcript.clone()
    }

    pub async fn display_html(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .display
            .iter()
            .map(|t| t.html().to_string())
            .collect()
    }

    /// Dispatch one UI action onto the state machine.
    pub async fn handle(self: &Arc<Self>, event: UiEvent) -> Result<()> {
        match event {
            UiEvent::Send { text, images } => {
                self.send(&text, images, false).await?;
            }
            UiEvent::Stop => {
                self.cancel().await;
            }
            UiEvent::Retry => {
                self.regenerate(false).await?;
            }
            UiEvent::Edit { index, text } => {
                self.edit(index, &text, false).await?;
            }
            UiEvent::NewChat => {
                self.new_chat().await;
            }
            UiEvent::OpenConversation { id } => {
                self.open_conversation(&id).await?;
            }
            UiEvent::DeleteConversation { id } => {
                self.delete_conversation(&id).await?;
            }
        }
        Ok(())
    }

    /// Send a user message (text plus already-uploaded image URLs) and start
    /// one generation for the response. With `print_output`, streamed deltas
    /// are echoed to stdout as they arrive.
    pub async fn send(
        self: &Arc<Self>,
        text: &str,
        images: Vec<String>,
        print_output: bool,
    ) -> Result<GenerateOutcome> {
        let text = text.trim();
        if text.is_empty() && images.is_empty() {
            return Ok(GenerateOutcome::Busy);
        }

        // a still-active session is cancelled (and partial-committed) first
        self.cancel().await;

        let mut parts = Vec::new();
        if !text.is_empty() {
            parts.push(ContentPart::Text {
                text: text.to_string(),
            });
        }
        for url in images {
            parts.push(ContentPart::ImageUrl {
                image_url: ImageRef { url },
                thought_signature: None,
            });
        }
        let message = Message {
            role: Role::User,
            content: MessageContent::Parts(parts),
            is_image: None,
            partial: None,
        };

        let (conv_id, created, snapshot) = {
            let mut state = self.state.lock().await;
            let mut target = RenderTarget::new();
            self.render_message_view(&message, &mut target);
            state.display.push(target);
            state.transcript.push(message);
            (
                state.conversation_id.clone(),
                state.transcript.len() == 1,
                state.transcript.clone(),
            )
        };

        self.persist(&conv_id, snapshot);
        if created && !text.is_empty() {
            self.spawn_title_task(conv_id, text.to_string());
        }

        if self.model() == config().chat.image_model {
            self.generate_image_turn().await
        } else {
            self.generate(print_output).await
        }
    }

    /// Open a stream for the current transcript and consume it. Fails
    /// closed as a no-op when a session is already generating.
    pub async fn generate(self: &Arc<Self>, print_output: bool) -> Result<GenerateOutcome> {
        let (cancel, target_index, snapshot) = {
            let mut state = self.state.lock().await;
            if state.generating {
                logging::debug("generate requested while already generating; rejected");
                return Ok(GenerateOutcome::Busy);
            }
            state.generating = true;
            let token = CancellationToken::new();
            state.cancel = Some(token.clone());
            state.accumulated.clear();
            state
                .display
                .push(RenderTarget::with_html("<p class=\"thinking\">Thinking…</p>"));
            let index = state.display.len() - 1;
            state.active_target = Some(index);
            (token, index, state.transcript.clone())
        };

        let model = self.model();
        logging::info(&format!(
            "generation starting: model={} messages={}",
            model,
            snapshot.len()
        ));

        let mut stream = match self.provider.stream_chat(&model, &snapshot).await {
            Ok(stream) => stream,
            Err(e) => {
                let state = self.state.lock().await;
                return self.finish_errored(state, target_index, &e.to_string());
            }
        };

        let end = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break StreamEnd::Cancelled,
                event = stream.next() => match event {
                    None => break StreamEnd::Completed,
                    Some(Ok(StreamEvent::MessageEnd)) => break StreamEnd::Completed,
                    Some(Ok(StreamEvent::TextDelta(delta))) => {
                        let mut state = self.state.lock().await;
                        if !state.generating {
                            // cancel() tore the session down under our feet
                            break StreamEnd::Cancelled;
                        }
                        state.accumulated.push_str(&delta);
                        if print_output {
                            print!("{}", delta);
                            let _ = io::stdout().flush();
                        }
                        let buffer = state.accumulated.clone();
                        self.renderer
                            .render_streaming(&buffer, &mut state.display[target_index]);
                    }
                    Some(Err(e)) => break StreamEnd::Errored(e.to_string()),
                }
            }
        };

        match end {
            StreamEnd::Completed => {
                let mut state = self.state.lock().await;
                if !state.generating {
                    return Ok(GenerateOutcome::Cancelled);
                }
                let text = state.accumulated.clone();
                self.renderer
                    .render_full(&text, &mut state.display[target_index]);
                self.renderer
                    .finalize(&mut state.display[target_index])
                    .await;
                state.display[target_index].attach_toolbar();
                state.transcript.push(Message::assistant_text(&text));

                let conv_id = state.conversation_id.clone();
                let snapshot = state.transcript.clone();
                reset_session(&mut state);
                drop(state);

                self.persist(&conv_id, snapshot);
                if print_output {
                    println!();
                }
                logging::info("generation completed");
                Ok(GenerateOutcome::Completed)
            }
            StreamEnd::Cancelled => Ok(GenerateOutcome::Cancelled),
            StreamEnd::Errored(message) => {
                let state = self.state.lock().await;
                if !state.generating {
                    return Ok(GenerateOutcome::Cancelled);
                }
                self.finish_errored(state, target_index, &message)
            }
        }
    }

    /// Stop the active generation. Accumulated text commits to history as a
    /// completed (but tagged partial) assistant message — stopping early is
    /// a partial success, not a discard. Returns false when nothing was
    /// generating.
    pub async fn cancel(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock().await;
        if !state.generating {
            return false;
        }
        if let Some(token) = &state.cancel {
            token.cancel();
        }

        let text = state.accumulated.clone();
        let target_index = state.active_target;
        if text.is_empty() {
            // nothing arrived yet: drop the placeholder display slot
            if let Some(index) = target_index {
                if index < state.display.len() {
                    state.display.remove(index);
                }
            }
            reset_session(&mut state);
            logging::info("generation cancelled before any output");
            return true;
        }

        if let Some(index) = target_index {
            state.display[index].attach_toolbar();
        }
        let mut message = Message::assistant_text(&text);
        message.partial = Some(true);
        state.transcript.push(message);

        let conv_id = state.conversation_id.clone();
        let snapshot = state.transcript.clone();
        reset_session(&mut state);
        drop(state);

        self.persist(&conv_id, snapshot);
        logging::info("generation cancelled; partial response committed");
        true
    }

    /// Non-streaming image generation turn.
    async fn generate_image_turn(self: &Arc<Self>) -> Result<GenerateOutcome> {
        let (cancel, target_index, context_messages) = {
            let mut state = self.state.lock().await;
            if state.generating {
                return Ok(GenerateOutcome::Busy);
            }
            state.generating = true;
            let token = CancellationToken::new();
            state.cancel = Some(token.clone());
            state.accumulated.clear();
            state.display.push(RenderTarget::with_html(
                "<p class=\"thinking\">Generating image…</p>",
            ));
            let index = state.display.len() - 1;
            state.active_target = Some(index);

            let keep = config().chat.image_context;
            let start = state.transcript.len().saturating_sub(keep);
            (token, index, state.transcript[start..].to_vec())
        };

        let model = self.model();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.provider.generate_image(&model, &context_messages) => Some(result),
        };

        let mut state = self.state.lock().await;
        if !state.generating {
            return Ok(GenerateOutcome::Cancelled);
        }

        match result {
            None => {
                if target_index < state.display.len() {
                    state.display.remove(target_index);
                }
                reset_session(&mut state);
                Ok(GenerateOutcome::Cancelled)
            }
            Some(Ok(image)) => {
                state.display[target_index].set_html(thumbnail_html(&image.url));
                state
                    .transcript
                    .push(Message::assistant_image(&image.url, image.thought_signature));

                let conv_id = state.conversation_id.clone();
                let snapshot = state.transcript.clone();
                reset_session(&mut state);
                drop(state);

                self.persist(&conv_id, snapshot);
                Ok(GenerateOutcome::Completed)
            }
            Some(Err(e)) => self.finish_errored(state, target_index, &e.to_string()),
        }
    }

    /// Shared error teardown: inline error with retry affordance, and the
    /// same partial-commit rule as cancellation for any accumulated text.
    fn finish_errored(
        self: &Arc<Self>,
        mut state: tokio::sync::MutexGuard<'_, ChatState>,
        target_index: usize,
        message: &str,
    ) -> Result<GenerateOutcome> {
        if !state.generating {
            // cancel() already tore the session down, slot included
            return Ok(GenerateOutcome::Cancelled);
        }
        logging::error(&format!("generation failed: {}", message));
        state.display[target_index].show_error(message);
        state.display[target_index].attach_toolbar();

        let text = state.accumulated.clone();
        let commit = if text.is_empty() {
            None
        } else {
            let mut partial = Message::assistant_text(&text);
            partial.partial = Some(true);
            state.transcript.push(partial);
            Some((state.conversation_id.clone(), state.transcript.clone()))
        };

        reset_session(&mut state);
        drop(state);

        if let Some((conv_id, snapshot)) = commit {
            self.persist(&conv_id, snapshot);
        }
        Ok(GenerateOutcome::Errored)
    }

    /// Start a fresh conversation; a live generation is stopped (and
    /// partial-committed) first.
    pub async fn new_chat(self: &Arc<Self>) {
        self.cancel().await;
        let mut state = self.state.lock().await;
        state.conversation_id = id::new_id("conv");
        state.transcript.clear();
        state.display.clear();
    }

    /// Load a stored conversation into the active transcript and rebuild its
    /// display.
    pub async fn open_conversation(self: &Arc<Self>, conv_id: &str) -> Result<()> {
        self.cancel().await;

        let conv = self
            .store()
            .get(conv_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No conversation with id {}", conv_id))?;

        let mut state = self.state.lock().await;
        state.conversation_id = conv.id.clone();
        state.transcript = conv.messages.clone();
        state.display.clear();

        let last = conv.messages.len().saturating_sub(1);
        for (i, message) in conv.messages.iter().enumerate() {
            let mut target = RenderTarget::new();
            self.render_message_view(message, &mut target);
            self.renderer.finalize(&mut target).await;
            if i == last && message.role == Role::Assistant && !message.is_image() {
                target.attach_toolbar();
            }
            state.display.push(target);
        }
        Ok(())
    }

    /// Delete a stored conversation; deleting the one on screen resets to a
    /// fresh chat first so the tombstone cannot be resurrected by a partial
    /// commit.
    pub async fn delete_conversation(self: &Arc<Self>, conv_id: &str) -> Result<()> {
        let is_active = self.state.lock().await.conversation_id == conv_id;
        if is_active {
            self.new_chat().await;
        }
        self.store.lock().unwrap().remove(conv_id)?;
        Ok(())
    }

    /// Render one committed message into a display slot: text content goes
    /// through the full pipeline, image parts become thumbnails.
    pub(crate) fn render_message_view(&self, message: &Message, target: &mut RenderTarget) {
        let text = message.content.text();

        if message.role == Role::Assistant
            && (message.is_image() || looks_like_image_url(&text))
            && message.content.image_urls().is_empty()
        {
            // legacy records stored a generated image as a bare URL string
            target.set_html(thumbnail_html(&text));
            return;
        }

        if !text.is_empty() {
            self.renderer.render_full(&text, target);
        }

        let mut html = target.html().to_string();
        for url in message.content.image_urls() {
            html.push_str(&thumbnail_html(url));
        }
        target.set_html(html);
    }

    /// Persist the transcript snapshot; storage failure is logged, never
    /// fatal — the in-memory transcript stays authoritative.
    pub(crate) fn persist(&self, conv_id: &str, messages: Vec<Message>) -> bool {
        match self.store.lock().unwrap().upsert(conv_id, messages) {
            Ok(created) => created,
            Err(e) => {
                logging::error(&format!("failed to persist history: {}", e));
                false
            }
        }
    }

    /// Best-effort title generation for a new conversation. The result only
    /// lands if the title is still the default by the time it arrives.
    fn spawn_title_task(self: &Arc<Self>, conv_id: String, message: String) {
        let ctx = self.clone();
        tokio::spawn(async move {
            match ctx.provider.generate_title(&message).await {
                Ok(title) => {
                    let applied = ctx
                        .store
                        .lock()
                        .unwrap()
                        .set_title_if_default(&conv_id, &title);
                    if let Err(e) = applied {
                        logging::warn(&format!("failed to save generated title: {}", e));
                    }
                }
                Err(e) => logging::warn(&format!("title generation failed: {}", e)),
            }
        });
    }
}

fn reset_session(state: &mut ChatState) {
    state.generating = false;
    state.cancel = None;
    state.accumulated.clear();
    state.active_target = None;
}

fn thumbnail_html(url: &str) -> String {
    format!(
        "<img class=\"thumbnail\" src=\"{}\" alt=\"Image\" loading=\"lazy\">",
        escape_html(url)
    )
}

fn looks_like_image_url(text: &str) -> bool {
    let lower = text.trim().to_lowercase();
    (lower.starts_with("http://") || lower.starts_with("https://"))
        && ["png", "jpg", "jpeg", "webp"]
            .iter()
            .any(|ext| lower.ends_with(ext))
}

//! End-to-end tests for the generation lifecycle using a mock provider.
//!
//! These verify the session state machine, cancellation semantics, history
//! commits, and the edit/regenerate controller without a real backend.


use anyhow::Result;
use chrono::Utc;
use mdchat::config::config;
use mdchat::message::{ContentPart, ImageRef, Message, MessageContent, Role};
use mdchat::provider::GeneratedImage;
use mdchat::render::Renderer;
use mdchat::session::{ChatContext, GenerateOutcome, UiEvent};
use mdchat::store::{ConversationStore, HistoryBackend, StoreError};
use mock_provider::{Item, MockProvider, Script};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared in-memory history backend so tests can inspect what was persisted.
#[derive(Clone, Default)]
struct MemoryBackend(Arc<Mutex<Option<String>>>);

impl MemoryBackend {
    fn persisted(&self) -> Vec<mdchat::store::Conversation> {
        self.0
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| serde_json::from_str(p).unwrap())
            .unwrap_or_default()
    }
}

impl HistoryBackend for MemoryBackend {
    fn read(&self) -> Result<Option<String>, StoreError> {
        Ok(self.0.lock().unwrap().clone())
    }

    fn write(&self, payload: &str) -> Result<(), StoreError> {
        *self.0.lock().unwrap() = Some(payload.to_string());
        Ok(())
    }
}

fn context() -> (Arc<ChatContext>, Arc<MockProvider>, MemoryBackend) {
    let provider = Arc::new(MockProvider::new());
    let backend = MemoryBackend::default();
    let store = ConversationStore::load(Box::new(backend.clone()), 30);
    let ctx = ChatContext::with_store(provider.clone(), Renderer::plain(), store);
    (ctx, provider, backend)
}

/// Poll until the condition holds or the timeout expires.
async fn wait_for<F: AsyncFnMut() -> bool>(mut condition: F) {
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within timeout");
}

#[tokio::test]
async fn test_send_streams_and_commits() -> Result<()> {
    let (ctx, provider, backend) = context();
    let before = Utc::now();

    // chunks "4", "" (suppressed upstream), then the end sentinel
    provider.queue_response(Script::Events(vec![Item::Delta("4"), Item::End]));

    let outcome = ctx.send("2+2=", Vec::new(), false).await?;
    assert_eq!(outcome, GenerateOutcome::Completed);

    let transcript = ctx.transcript().await;
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].role, Role::User);
    assert_eq!(transcript[0].content.text(), "2+2=");
    assert_eq!(transcript[1].role, Role::Assistant);
    assert_eq!(transcript[1].content.text(), "4");
    assert!(transcript[1].partial.is_none());

    // the response display carries the retry affordance
    let display = ctx.display_html().await;
    assert_eq!(display.len(), 2);
    assert!(display[1].contains("message-toolbar"));

    // the store's top entry holds the snapshot with a fresh timestamp
    let persisted = backend.persisted();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].messages.len(), 2);
    assert!(persisted[0].timestamp >= before);
    Ok(())
}

#[tokio::test]
async fn test_start_while_generating_is_rejected() -> Result<()> {
    let (ctx, provider, _) = context();
    provider.queue_response(Script::Stalled(vec![Item::Delta("Hello ")]));

    let sender = ctx.clone();
    let handle = tokio::spawn(async move { sender.send("hi", Vec::new(), false).await });

    wait_for(async || { ctx.is_generating().await }).await;
    wait_for(async || {
        ctx.display_html()
            .await
            .last()
            .is_some_and(|html| html.contains("Hello"))
    })
    .await;

    // a second start is a synchronous no-op that leaves the session running
    assert_eq!(ctx.generate(false).await?, GenerateOutcome::Busy);
    assert!(ctx.is_generating().await);
    assert_eq!(ctx.transcript().await.len(), 1);

    assert!(ctx.cancel().await);
    assert_eq!(handle.await??, GenerateOutcome::Cancelled);
    Ok(())
}

#[tokio::test]
async fn test_cancel_commits_partial_response() -> Result<()> {
    let (ctx, provider, backend) = context();
    provider.queue_response(Script::Stalled(vec![Item::Delta("Hello "), Item::Delta("wor")]));

    let sender = ctx.clone();
    let handle = tokio::spawn(async move { sender.send("greet me", Vec::new(), false).await });

    wait_for(async || {
        ctx.display_html()
            .await
            .last()
            .is_some_and(|html| html.contains("Hello wor"))
    })
    .await;

    assert!(ctx.cancel().await);
    assert!(!ctx.is_generating().await);

    // exactly one assistant message equal to the accumulated text
    let transcript = ctx.transcript().await;
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[1].content.text(), "Hello wor");
    assert_eq!(transcript[1].partial, Some(true));

    // no further chunks land after the cancel
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(ctx.transcript().await.len(), 2);
    assert_eq!(ctx.transcript().await[1].content.text(), "Hello wor");

    let persisted = backend.persisted();
    assert_eq!(persisted[0].messages.len(), 2);
    assert_eq!(persisted[0].messages[1].partial, Some(true));

    handle.await??;
    // cancelling again with nothing active is a no-op
    assert!(!ctx.cancel().await);
    Ok(())
}

#[tokio::test]
async fn test_cancel_before_any_output_discards_placeholder() -> Result<()> {
    let (ctx, provider, backend) = context();
    provider.queue_response(Script::Stalled(vec![]));

    let sender = ctx.clone();
    let handle = tokio::spawn(async move { sender.send("hi", Vec::new(), false).await });

    wait_for(async || { ctx.is_generating().await }).await;
    assert_eq!(ctx.display_html().await.len(), 2); // user + placeholder

    assert!(ctx.cancel().await);
    assert_eq!(ctx.display_html().await.len(), 1);
    assert_eq!(ctx.transcript().await.len(), 1);
    assert_eq!(backend.persisted()[0].messages.len(), 1);

    handle.await??;
    Ok(())
}

#[tokio::test]
async fn test_transport_error_shows_inline_and_commits_nothing() -> Result<()> {
    let (ctx, provider, backend) = context();
    provider.queue_response(Script::FailRequest("service unavailable"));

    let outcome = ctx.send("hi", Vec::new(), false).await?;
    assert_eq!(outcome, GenerateOutcome::Errored);

    let display = ctx.display_html().await;
    assert!(display[1].contains("error-text"));
    assert!(display[1].contains("service unavailable"));
    assert!(display[1].contains("message-toolbar"));

    // only the user message was committed
    assert_eq!(ctx.transcript().await.len(), 1);
    assert_eq!(backend.persisted()[0].messages.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_midstream_error_commits_partial() -> Result<()> {
    let (ctx, provider, _) = context();
    provider.queue_response(Script::Events(vec![
        Item::Delta("partial answ"),
        Item::Error("connection reset"),
    ]));

    let outcome = ctx.send("hi", Vec::new(), false).await?;
    assert_eq!(outcome, GenerateOutcome::Errored);

    let transcript = ctx.transcript().await;
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[1].content.text(), "partial answ");
    assert_eq!(transcript[1].partial, Some(true));
    Ok(())
}

fn user_parts(text: &str, image: &str) -> Message {
    Message {
        role: Role::User,
        content: MessageContent::Parts(vec![
            ContentPart::Text {
                text: text.to_string(),
            },
            ContentPart::ImageUrl {
                image_url: ImageRef {
                    url: image.to_string(),
                },
                thought_signature: None,
            },
        ]),
        is_image: None,
        partial: None,
    }
}

#[tokio::test]
async fn test_edit_truncates_then_regenerates() -> Result<()> {
    let (ctx, provider, backend) = context();

    // seed a 5-message conversation [m0..m4]
    let seeded = vec![
        Message::user_text("m0"),
        user_parts("m1 old", "/images/cache/pic.jpg"),
        Message::assistant_text("m2"),
        Message::user_text("m3"),
        Message::assistant_text("m4"),
    ];
    ctx.store().upsert("conv_e2e_1", seeded)?;
    ctx.open_conversation("conv_e2e_1").await?;
    assert_eq!(ctx.display_html().await.len(), 5);

    provider.queue_response(Script::Events(vec![Item::Delta("fresh answer"), Item::End]));
    let outcome = ctx.edit(1, "m1 updated", false).await?;
    assert_eq!(outcome, GenerateOutcome::Completed);

    // the request saw exactly [m0, m1'] — m2..m4 were gone before the send
    let sent = provider.last_messages.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].content.text(), "m1 updated");
    assert_eq!(sent[1].content.image_urls(), vec!["/images/cache/pic.jpg"]);

    let transcript = ctx.transcript().await;
    assert_eq!(transcript.len(), 3);
    assert_eq!(transcript[2].content.text(), "fresh answer");

    // the persisted snapshot no longer contains the discarded tail
    let persisted = backend.persisted();
    let conv = persisted.iter().find(|c| c.id == "conv_e2e_1").unwrap();
    assert_eq!(conv.messages.len(), 3);
    assert!(!conv.messages.iter().any(|m| m.content.text() == "m2"));
    Ok(())
}

#[tokio::test]
async fn test_edit_rejects_bad_targets() -> Result<()> {
    let (ctx, _provider, _) = context();
    ctx.store().upsert(
        "conv_e2e_2",
        vec![Message::user_text("m0"), Message::assistant_text("m1")],
    )?;
    ctx.open_conversation("conv_e2e_2").await?;

    assert!(ctx.edit(1, "nope", false).await.is_err()); // assistant message
    assert!(ctx.edit(9, "nope", false).await.is_err()); // out of range
    assert_eq!(ctx.transcript().await.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_regenerate_discards_last_assistant() -> Result<()> {
    let (ctx, provider, _) = context();

    provider.queue_response(Script::Events(vec![Item::Delta("first try"), Item::End]));
    ctx.send("question", Vec::new(), false).await?;
    assert_eq!(ctx.transcript().await.len(), 2);

    provider.queue_response(Script::Events(vec![Item::Delta("second try"), Item::End]));
    let outcome = ctx.regenerate(false).await?;
    assert_eq!(outcome, GenerateOutcome::Completed);

    // the replayed request ended at the user message
    let sent = provider.last_messages.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].role, Role::User);

    let transcript = ctx.transcript().await;
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[1].content.text(), "second try");
    Ok(())
}

#[tokio::test]
async fn test_regenerate_replays_trailing_user_message() -> Result<()> {
    let (ctx, provider, _) = context();

    // previous attempt failed before any assistant message was committed
    provider.queue_response(Script::FailRequest("boom"));
    ctx.send("question", Vec::new(), false).await?;
    assert_eq!(ctx.transcript().await.len(), 1);

    provider.queue_response(Script::Events(vec![Item::Delta("recovered"), Item::End]));
    let outcome = ctx.regenerate(false).await?;
    assert_eq!(outcome, GenerateOutcome::Completed);
    assert_eq!(ctx.transcript().await.len(), 2);
    assert_eq!(ctx.transcript().await[1].content.text(), "recovered");
    Ok(())
}

#[tokio::test]
async fn test_new_chat_cancels_active_session_with_commit() -> Result<()> {
    let (ctx, provider, backend) = context();
    provider.queue_response(Script::Stalled(vec![Item::Delta("half an answer")]));

    let sender = ctx.clone();
    let handle = tokio::spawn(async move { sender.send("hi", Vec::new(), false).await });
    wait_for(async || {
        ctx.display_html()
            .await
            .last()
            .is_some_and(|html| html.contains("half an answer"))
    })
    .await;

    let old_id = ctx.conversation_id().await;
    ctx.new_chat().await;

    assert!(!ctx.is_generating().await);
    assert_ne!(ctx.conversation_id().await, old_id);
    assert!(ctx.transcript().await.is_empty());
    assert!(ctx.display_html().await.is_empty());

    // the interrupted response was committed to the old conversation first
    let persisted = backend.persisted();
    let old = persisted.iter().find(|c| c.id == old_id).unwrap();
    assert_eq!(old.messages.len(), 2);
    assert_eq!(old.messages[1].partial, Some(true));

    handle.await??;
    Ok(())
}

#[tokio::test]
async fn test_title_applied_when_still_default() -> Result<()> {
    let (ctx, provider, _) = context();
    provider.queue_title(Ok("Adding Numbers".to_string()));
    provider.queue_response(Script::Events(vec![Item::Delta("4"), Item::End]));

    ctx.send("2+2=", Vec::new(), false).await?;
    let conv_id = ctx.conversation_id().await;

    wait_for(async || { ctx.store().get(&conv_id).unwrap().title == "Adding Numbers" }).await;
    Ok(())
}

#[tokio::test]
async fn test_title_failure_keeps_default() -> Result<()> {
    let (ctx, provider, _) = context();
    provider.queue_title(Err(anyhow::anyhow!("title service down")));
    provider.queue_response(Script::Events(vec![Item::Delta("hi"), Item::End]));

    ctx.send("hello", Vec::new(), false).await?;
    let conv_id = ctx.conversation_id().await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ctx.store().get(&conv_id).unwrap().title, "New Chat");
    Ok(())
}

#[tokio::test]
async fn test_image_model_turn() -> Result<()> {
    let (ctx, provider, _) = context();
    ctx.set_model(&config().chat.image_model);
    provider.queue_image(Ok(GeneratedImage {
        url: "/images/cache/cat.png".to_string(),
        thought_signature: Some("sig-123".to_string()),
    }));

    let outcome = ctx.send("draw a cat", Vec::new(), false).await?;
    assert_eq!(outcome, GenerateOutcome::Completed);

    let transcript = ctx.transcript().await;
    assert_eq!(transcript.len(), 2);
    let image = &transcript[1];
    assert!(image.is_image());
    match &image.content {
        MessageContent::Parts(parts) => match &parts[0] {
            ContentPart::ImageUrl {
                image_url,
                thought_signature,
            } => {
                assert_eq!(image_url.url, "/images/cache/cat.png");
                assert_eq!(thought_signature.as_deref(), Some("sig-123"));
            }
            other => panic!("unexpected part: {:?}", other),
        },
        other => panic!("unexpected content: {:?}", other),
    }

    assert_eq!(
        *provider.last_model.lock().unwrap(),
        config().chat.image_model
    );
    assert!(ctx.display_html().await[1].contains("<img"));
    Ok(())
}

#[tokio::test]
async fn test_image_error_is_inline() -> Result<()> {
    let (ctx, provider, _) = context();
    ctx.set_model(&config().chat.image_model);
    provider.queue_image(Err(anyhow::anyhow!("Model refused or returned no image.")));

    let outcome = ctx.send("draw a dog", Vec::new(), false).await?;
    assert_eq!(outcome, GenerateOutcome::Errored);
    assert!(
        ctx.display_html().await[1].contains("Model refused or returned no image.")
    );
    assert_eq!(ctx.transcript().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_open_conversation_rebuilds_display() -> Result<()> {
    let (ctx, _provider, _) = context();
    ctx.store().upsert(
        "conv_e2e_3",
        vec![
            Message::user_text("show me $x^2$"),
            Message::assistant_text("sure: $$x^2$$ and\n```rust\nfn f() {}\n```"),
        ],
    )?;

    ctx.open_conversation("conv_e2e_3").await?;
    let display = ctx.display_html().await;
    assert_eq!(display.len(), 2);
    assert!(display[0].contains("math-inline"));
    assert!(display[1].contains("math-display-block"));
    assert!(display[1].contains("code-block"));
    // the trailing assistant message gets the retry affordance
    assert!(display[1].contains("message-toolbar"));
    assert!(!display[0].contains("message-toolbar"));
    Ok(())
}

#[tokio::test]
async fn test_delete_active_conversation_resets() -> Result<()> {
    let (ctx, provider, backend) = context();
    provider.queue_response(Script::Events(vec![Item::Delta("hi"), Item::End]));
    ctx.send("hello", Vec::new(), false).await?;
    let conv_id = ctx.conversation_id().await;

    ctx.delete_conversation(&conv_id).await?;
    assert!(ctx.store().get(&conv_id).is_none());
    assert!(backend.persisted().iter().all(|c| c.id != conv_id));
    assert!(ctx.transcript().await.is_empty());
    assert_ne!(ctx.conversation_id().await, conv_id);
    Ok(())
}

#[tokio::test]
async fn test_send_while_generating_cancels_previous_first() -> Result<()> {
    let (ctx, provider, _) = context();
    provider.queue_response(Script::Stalled(vec![Item::Delta("first half")]));
    provider.queue_response(Script::Events(vec![Item::Delta("second answer"), Item::End]));

    let sender = ctx.clone();
    let handle = tokio::spawn(async move { sender.send("one", Vec::new(), false).await });
    wait_for(async || {
        ctx.display_html()
            .await
            .last()
            .is_some_and(|html| html.contains("first half"))
    })
    .await;

    let outcome = ctx.send("two", Vec::new(), false).await?;
    assert_eq!(outcome, GenerateOutcome::Completed);

    // [user one, partial assistant, user two, assistant two]
    let transcript = ctx.transcript().await;
    assert_eq!(transcript.len(), 4);
    assert_eq!(transcript[1].content.text(), "first half");
    assert_eq!(transcript[1].partial, Some(true));
    assert_eq!(transcript[3].content.text(), "second answer");

    handle.await??;
    Ok(())
}

#[tokio::test]
async fn test_ui_event_dispatch() -> Result<()> {
    let (ctx, provider, _) = context();
    provider.queue_response(Script::Events(vec![Item::Delta("dispatched"), Item::End]));

    ctx.handle(UiEvent::Send {
        text: "via event".to_string(),
        images: Vec::new(),
    })
    .await?;
    assert_eq!(ctx.transcript().await.len(), 2);
    let conv_id = ctx.conversation_id().await;

    ctx.handle(UiEvent::NewChat).await?;
    assert!(ctx.transcript().await.is_empty());

    ctx.handle(UiEvent::OpenConversation {
        id: conv_id.clone(),
    })
    .await?;
    assert_eq!(ctx.transcript().await.len(), 2);

    // stop with nothing active is a quiet no-op
    ctx.handle(UiEvent::Stop).await?;

    ctx.handle(UiEvent::DeleteConversation { id: conv_id }).await?;
    assert!(ctx.store().conversations().is_empty());
    Ok(())
}

//! History edit and regenerate transitions.
//!
//! Both rewrite the tail of the active transcript and then start exactly one
//! new generation. Truncation happens (and persists) before the new session
//! opens, so a response from a discarded branch can never land on the
//! shortened transcript.

use crate::logging;
use crate::message::Role;
use crate::render::RenderTarget;
use crate::session::{ChatContext, GenerateOutcome};
use anyhow::Result;
use std::sync::Arc;

impl ChatContext {
    /// Throw away the trailing assistant message (if any) and replay the
    /// request. When the last message is already a user message — the
    /// previous attempt died before an assistant message was committed —
    /// replay from it directly.
    pub async fn regenerate(self: &Arc<Self>, print_output: bool) -> Result<GenerateOutcome> {
        self.cancel().await;

        let replay = {
            let mut state = self.state.lock().await;
            if state.transcript.is_empty() {
                return Ok(GenerateOutcome::Busy);
            }

            if state.transcript.last().map(|m| m.role) == Some(Role::Assistant) {
                state.transcript.pop();
                state.display.pop();
            }

            // only a trailing user message can be replayed
            if state.transcript.last().map(|m| m.role) != Some(Role::User) {
                return Ok(GenerateOutcome::Busy);
            }
            (state.conversation_id.clone(), state.transcript.clone())
        };

        self.persist(&replay.0, replay.1);
        self.generate(print_output).await
    }

    /// Replace the text of user message `index` (image parts survive), drop
    /// every message after it from both the transcript and its display, and
    /// start one new generation from the edited prompt.
    pub async fn edit(
        self: &Arc<Self>,
        index: usize,
        new_text: &str,
        print_output: bool,
    ) -> Result<GenerateOutcome> {
        let new_text = new_text.trim();
        if new_text.is_empty() {
            return Ok(GenerateOutcome::Busy);
        }

        self.cancel().await;

        let (conv_id, snapshot) = {
            let mut state = self.state.lock().await;

            // the edit addresses a display slot; refuse rather than guess if
            // the 1:1 display/transcript correspondence ever breaks
            if state.display.len() != state.transcript.len() {
                logging::error(&format!(
                    "display ({}) out of sync with transcript ({}); refusing edit",
                    state.display.len(),
                    state.transcript.len()
                ));
                anyhow::bail!("display out of sync with transcript");
            }

            let Some(message) = state.transcript.get_mut(index) else {
                anyhow::bail!("message index {} out of range", index);
            };
            if message.role != Role::User {
                anyhow::bail!("only user messages can be edited");
            }

            message.content.set_text(new_text);
            state.transcript.truncate(index + 1);
            state.display.truncate(index + 1);

            let edited = state.transcript[index].clone();
            let mut target = RenderTarget::new();
            self.render_message_view(&edited, &mut target);
            state.display[index] = target;

            (state.conversation_id.clone(), state.transcript.clone())
        };

        // the truncated history must be durable before the new session starts
        self.persist(&conv_id, snapshot);
        self.generate(print_output).await
    }
}

use std::sync::Arc;

use crate::config::{AppConfig, InitialValues};
use crate::conversation::{ConversationStore, DEFAULT_WINDOW};
use crate::error::Result;
use crate::llm::CompletionClient;
use crate::message::Message;

/// Per-session knobs taken from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub window: usize,
    pub streaming: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            streaming: false,
        }
    }
}

impl From<&AppConfig> for SessionOptions {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            window: cfg.conversation.window,
            streaming: cfg.model.stream,
        }
    }
}

/// What happened to one submitted user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Blank input; nothing was appended and the backend was not called.
    Ignored,
    Replied(String),
}

/// One user's conversation: a transcript bound to a completion client.
///
/// `submit` takes `&mut self`, so a session never has two completions in
/// flight.
pub struct ChatSession<C: CompletionClient> {
    client: Arc<C>,
    store: ConversationStore,
    options: SessionOptions,
}

impl<C: CompletionClient> ChatSession<C> {
    pub fn new(client: Arc<C>, initial: &InitialValues, options: SessionOptions) -> Self {
        let store = ConversationStore::seeded(
            initial.prompt_text.clone(),
            initial.initial_bot_message.clone(),
        );
        Self {
            client,
            store,
            options,
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    /// Append the user turn, ask the backend, append the reply.
    ///
    /// On a backend error the user turn stays in the transcript without a
    /// reply (see [`ChatSession::awaiting_reply`]) and the error is returned.
    pub async fn submit(&mut self, text: &str) -> Result<TurnOutcome> {
        if !self.store.append_user(text) {
            tracing::debug!("ignoring blank user input");
            return Ok(TurnOutcome::Ignored);
        }

        let window = self.store.context_window(self.options.window);
        tracing::info!(
            turns = self.store.len(),
            window = window.len(),
            streaming = self.options.streaming,
            "requesting completion"
        );
        let reply = self
            .client
            .complete(&window, self.options.streaming)
            .await?;

        self.store.append_assistant(reply.clone());
        Ok(TurnOutcome::Replied(reply))
    }

    pub fn history_for_display(&self) -> Vec<Message> {
        self.store.recent_history(self.options.window)
    }

    /// True after a failed completion left the last user turn unanswered.
    pub fn awaiting_reply(&self) -> bool {
        self.store.awaiting_reply()
    }
}

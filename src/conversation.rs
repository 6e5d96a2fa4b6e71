use crate::message::{Message, Role};

/// Number of recent turns sent to the backend and shown to the user.
pub const DEFAULT_WINDOW: usize = 20;

/// Per-session transcript: an append-only history plus the fixed system prompt.
///
/// The system prompt never appears in [`ConversationStore::history`]; it is only
/// prepended when building a [`ConversationStore::context_window`].
#[derive(Default, Clone, Debug)]
pub struct ConversationStore {
    system_prompt: Vec<Message>,
    history: Vec<Message>,
}

impl ConversationStore {
    /// An empty store. Appends are refused until [`ConversationStore::initialize`]
    /// seeds the system prompt.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store seeded with its system prompt and assistant greeting.
    pub fn seeded(
        system_prompt_text: impl Into<String>,
        initial_assistant_text: impl Into<String>,
    ) -> Self {
        let mut store = Self::new();
        store.initialize(system_prompt_text, initial_assistant_text);
        store
    }

    /// Seed the system prompt and the assistant greeting.
    ///
    /// Returns `false` without touching anything when the store is already
    /// initialized.
    pub fn initialize(
        &mut self,
        system_prompt_text: impl Into<String>,
        initial_assistant_text: impl Into<String>,
    ) -> bool {
        if self.is_initialized() {
            return false;
        }
        self.system_prompt = vec![Message::system(system_prompt_text)];
        self.history = vec![Message::assistant(initial_assistant_text)];
        true
    }

    pub fn is_initialized(&self) -> bool {
        !self.system_prompt.is_empty()
    }

    /// Append a user turn. Blank input, or any input before the store is
    /// initialized, is ignored and reported as `false`.
    pub fn append_user(&mut self, text: impl Into<String>) -> bool {
        let text = text.into();
        if !self.is_initialized() || text.trim().is_empty() {
            return false;
        }
        self.history.push(Message::user(text));
        true
    }

    /// Append an assistant turn. Returns `false` before initialization.
    pub fn append_assistant(&mut self, text: impl Into<String>) -> bool {
        if !self.is_initialized() {
            return false;
        }
        self.history.push(Message::assistant(text));
        true
    }

    /// System prompt followed by the last `limit` history messages.
    pub fn context_window(&self, limit: usize) -> Vec<Message> {
        let mut window = Vec::with_capacity(self.system_prompt.len() + limit);
        window.extend(self.system_prompt.iter().cloned());
        window.extend_from_slice(self.tail(limit));
        window
    }

    /// The last `limit` history messages, for display.
    pub fn recent_history(&self, limit: usize) -> Vec<Message> {
        self.tail(limit).to_vec()
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn system_prompt(&self) -> Option<&Message> {
        self.system_prompt.first()
    }

    pub fn last(&self) -> Option<&Message> {
        self.history.last()
    }

    /// True when the newest turn is a user message with no reply yet, e.g.
    /// after a failed completion.
    pub fn awaiting_reply(&self) -> bool {
        matches!(self.last(), Some(message) if message.role == Role::User)
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    fn tail(&self, limit: usize) -> &[Message] {
        let start = self.history.len().saturating_sub(limit);
        &self.history[start..]
    }
}

//! Conversation core for persona-driven chatbots.
//!
//! The crate provides:
//! - A per-session transcript with a fixed system prompt (`ConversationStore`).
//! - A chat completion abstraction (`CompletionClient`) with a Groq client and a stub.
//! - A `ChatSession` that runs one user turn end to end.
//! - An optional JSON HTTP surface hosting many sessions (`server` feature).

mod config;
mod conversation;
mod error;
mod llm;
mod message;
mod persona;
mod session;
mod stream;
mod telemetry;

#[cfg(feature = "server")]
mod server;

pub use config::{
    AppConfig, ConversationConfig, InitialValues, ModelConfig, ServerConfig, TelemetryConfig,
};
pub use conversation::{ConversationStore, DEFAULT_WINDOW};
pub use error::{PersonaError, Result};
pub use llm::{
    CompletionClient, GroqClient, RequestLifecycle, RequestState, SamplingParams, StubModel,
    StubReply,
};
pub use message::{Message, Role};
pub use persona::Persona;
#[cfg(feature = "server")]
pub use server::ChatServer;
pub use session::{ChatSession, SessionOptions, TurnOutcome};
pub use stream::{collect_fragments, SseDecoder, SseEvent, StreamAssembler};
pub use telemetry::{env_filter, init_tracing};

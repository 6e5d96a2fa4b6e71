//! Serves persona chat sessions over HTTP.
//!
//! Usage: `chat-server [persona.toml]`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use persona_engine::{
    init_tracing, AppConfig, ChatServer, GroqClient, InitialValues, PersonaError, SessionOptions,
};

#[tokio::main]
async fn main() -> persona_engine::Result<()> {
    let cfg = match std::env::args().nth(1) {
        Some(path) => AppConfig::from_env_or_file(path)?,
        None => {
            let mut cfg = AppConfig::default();
            cfg.apply_env();
            cfg
        }
    };
    init_tracing(&cfg.telemetry);

    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port)
        .parse()
        .map_err(|err| PersonaError::Config(format!("invalid server address: {err}")))?;
    let client = Arc::new(GroqClient::from_config(&cfg.model)?);
    let initial = InitialValues::load(&cfg.conversation.initial_values_path);

    ChatServer::new(
        client,
        initial,
        cfg.persona.clone(),
        SessionOptions::from(&cfg),
    )
    .with_idle_timeout(Duration::from_secs(cfg.conversation.idle_timeout_secs))
    .serve(addr)
    .await
}

//! Terminal front end for a persona chatbot.
//!
//! Usage: `console-chat [persona.toml]`. Without a config file the defaults
//! and `PERSONA_*` / `GROQ_API_KEY` environment variables are used.

use std::path::Path;
use std::sync::Arc;

use persona_engine::{
    init_tracing, AppConfig, ChatSession, GroqClient, InitialValues, Message, Persona,
    SessionOptions, TurnOutcome,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

fn render(persona: &Persona, message: &Message) -> String {
    let avatar = persona.avatar_for(message.role).unwrap_or("-");
    format!("[{} {}] {}", message.role, avatar, message.content)
}

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

    let initial = InitialValues::load(Path::new(&cfg.conversation.initial_values_path));
    let client = Arc::new(GroqClient::from_config(&cfg.model)?);
    let mut session = ChatSession::new(client, &initial, SessionOptions::from(&cfg));
    let persona = &cfg.persona;

    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("== {} ==\n", persona.heading).as_bytes())
        .await?;
    for message in session.history_for_display() {
        stdout
            .write_all(format!("{}\n", render(persona, &message)).as_bytes())
            .await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        stdout
            .write_all(format!("{} ", persona.input_placeholder).as_bytes())
            .await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };

        match session.submit(&line).await {
            Ok(TurnOutcome::Replied(reply)) => {
                let message = Message::assistant(reply);
                stdout
                    .write_all(format!("{}\n", render(persona, &message)).as_bytes())
                    .await?;
            }
            Ok(TurnOutcome::Ignored) => {}
            Err(err) => {
                tracing::error!(error = %err, "no reply for this turn");
                stdout
                    .write_all(format!("(no reply: {err})\n").as_bytes())
                    .await?;
            }
        }
    }
    Ok(())
}

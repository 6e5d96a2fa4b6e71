use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::conversation::DEFAULT_WINDOW;
use crate::error::{PersonaError, Result};
use crate::persona::Persona;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8501
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            json: false,
        }
    }
}

fn default_log_filter() -> String {
    "info".into()
}

/// Completion backend settings. Sampling values default to the fixed
/// parameters the chatbot has always used.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Request timeout. `None` leaves reqwest's default (no timeout).
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key: None,
            base_url: None,
            stream: false,
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
            timeout_secs: None,
        }
    }
}

fn default_provider() -> String {
    "groq".into()
}

fn default_model() -> String {
    "llama3-70b-8192".into()
}

fn default_temperature() -> f32 {
    1.0
}

fn default_top_p() -> f32 {
    1.0
}

fn default_max_tokens() -> u32 {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationConfig {
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_initial_values_path")]
    pub initial_values_path: String,
    /// Hosted sessions with no activity for this long are dropped.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            initial_values_path: default_initial_values_path(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

fn default_window() -> usize {
    DEFAULT_WINDOW
}

fn default_initial_values_path() -> String {
    "data/initial_values.json".into()
}

fn default_idle_timeout_secs() -> u64 {
    1800
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub persona: Persona,
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let cfg: Self = toml::from_str(&raw)
            .map_err(|err| PersonaError::Config(format!("Failed to parse configuration: {err}")))?;
        Ok(cfg)
    }

    pub fn from_env_or_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg = Self::from_file(path)?;
        cfg.apply_env();
        Ok(cfg)
    }

    /// Overlay `PERSONA_*` and `GROQ_API_KEY` environment variables.
    /// Unparseable numeric or boolean values are ignored.
    pub fn apply_env(&mut self) {
        if let Ok(host) = env::var("PERSONA_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = env::var("PERSONA_PORT") {
            if let Ok(parsed) = port.parse::<u16>() {
                self.server.port = parsed;
            }
        }
        if let Ok(model) = env::var("PERSONA_MODEL") {
            self.model.model = model;
        }
        if let Ok(key) = env::var("GROQ_API_KEY") {
            self.model.api_key = Some(key);
        }
        if let Ok(base_url) = env::var("PERSONA_BASE_URL") {
            self.model.base_url = Some(base_url);
        }
        if let Ok(stream) = env::var("PERSONA_STREAMING") {
            if let Ok(parsed) = stream.parse::<bool>() {
                self.model.stream = parsed;
            }
        }
        if let Ok(window) = env::var("PERSONA_WINDOW") {
            if let Ok(parsed) = window.parse::<usize>() {
                self.conversation.window = parsed;
            }
        }
    }
}

/// Persona seed values read from `initial_values.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct InitialValues {
    #[serde(default)]
    pub initial_bot_message: String,
    #[serde(default)]
    pub prompt_text: String,
}

impl InitialValues {
    pub fn new(initial_bot_message: impl Into<String>, prompt_text: impl Into<String>) -> Self {
        Self {
            initial_bot_message: initial_bot_message.into(),
            prompt_text: prompt_text.into(),
        }
    }

    /// Parse the seed values. Unknown keys are ignored.
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Load the seed values, falling back to empty strings when the file is
    /// missing or is not valid JSON.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let loaded = fs::read_to_string(path)
            .map_err(PersonaError::from)
            .and_then(|raw| Self::from_json(&raw));
        match loaded {
            Ok(values) => values,
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "initial values unavailable, starting with a blank persona"
                );
                Self::default()
            }
        }
    }
}

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PersonaError>;

#[derive(Debug, Error)]
pub enum PersonaError {
    /// The completion backend failed or returned an unusable response.
    #[error("completion backend error: {0}")]
    Backend(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl PersonaError {
    pub fn is_backend(&self) -> bool {
        matches!(self, PersonaError::Backend(_))
    }
}

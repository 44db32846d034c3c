use thiserror::Error;

/// Errors produced by the attn PTY daemon and its protocol layer.
#[derive(Debug, Error)]
pub enum AttnError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session {0} already exists")]
    SessionExists(String),

    #[error("session not running: {0}")]
    SessionExited(String),

    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for AttnError {
    fn from(e: serde_json::Error) -> Self {
        AttnError::Codec(e.to_string())
    }
}

impl From<base64::DecodeError> for AttnError {
    fn from(e: base64::DecodeError) -> Self {
        AttnError::Codec(format!("base64: {e}"))
    }
}

impl AttnError {
    /// Whether this error is an expected race (client talking to a session
    /// that is gone or finished) rather than a fault worth surfacing.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            AttnError::SessionNotFound(_) | AttnError::SessionExited(_)
        )
    }
}

pub type AttnResult<T> = Result<T, AttnError>;

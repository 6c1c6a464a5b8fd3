use thiserror::Error;

/// Failures of live-session and conversation operations. The display text of
/// every variant except `Storage` is safe to show to the caller.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    Validation(String),
    #[error("Unauthorized or invalid token")]
    Unauthorized,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(#[from] livechat_db::DbError),
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn conversation_not_found() -> Self {
        Self::NotFound("Conversation not found".into())
    }

    pub fn already_closed() -> Self {
        Self::Conflict("Conversation already closed".into())
    }

    /// A compare-and-set lost to a concurrent writer.
    pub fn state_changed() -> Self {
        Self::Conflict("Conversation state changed, try again".into())
    }
}

use thiserror::Error;

/// Upper bound on a single chat message, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("value is too short (min {min}, got {got})")]
    TooShort { min: usize, got: usize },
    #[error("value is too long (max {max}, got {got})")]
    TooLong { max: usize, got: usize },
}

/// Trim message content and check its length. Returns the trimmed text.
pub fn normalize_message_content(content: &str) -> Result<&str, ValidationError> {
    let trimmed = content.trim();
    let len = trimmed.chars().count();
    if len < 1 {
        return Err(ValidationError::TooShort { min: 1, got: len });
    }
    if len > MAX_MESSAGE_CHARS {
        return Err(ValidationError::TooLong {
            max: MAX_MESSAGE_CHARS,
            got: len,
        });
    }
    Ok(trimmed)
}

use thiserror::Error;

pub const MAX_MESSAGE_TEXT_CHARS: usize = 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("value is too long (max {max}, got {got})")]
    TooLong { max: usize, got: usize },
    #[error("message must contain text or media")]
    EmptyMessage,
    #[error("invalid format")]
    InvalidFormat,
}

/// Returns the text if it carries any non-whitespace content.
pub fn non_blank(text: Option<&str>) -> Option<&str> {
    text.filter(|t| !t.trim().is_empty())
}

/// Message text is counted in characters, not bytes.
pub fn validate_message_text(text: &str) -> Result<(), ValidationError> {
    let len = text.chars().count();
    if len > MAX_MESSAGE_TEXT_CHARS {
        return Err(ValidationError::TooLong {
            max: MAX_MESSAGE_TEXT_CHARS,
            got: len,
        });
    }
    Ok(())
}

pub fn validate_message_body(
    text: Option<&str>,
    media_url: Option<&str>,
) -> Result<(), ValidationError> {
    let text = non_blank(text);
    if let Some(url) = media_url {
        if url.trim().is_empty() {
            return Err(ValidationError::InvalidFormat);
        }
    }
    match (text, media_url) {
        (None, None) => Err(ValidationError::EmptyMessage),
        (Some(t), _) => validate_message_text(t),
        (None, Some(_)) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_body() {
        assert_eq!(
            validate_message_body(None, None),
            Err(ValidationError::EmptyMessage)
        );
        assert_eq!(
            validate_message_body(Some("   "), None),
            Err(ValidationError::EmptyMessage)
        );
    }

    #[test]
    fn media_alone_is_enough() {
        assert!(validate_message_body(None, Some("/media/a.png")).is_ok());
        assert_eq!(
            validate_message_body(None, Some(" ")),
            Err(ValidationError::InvalidFormat)
        );
    }

    #[test]
    fn text_limit_counts_chars() {
        let exact: String = "é".repeat(MAX_MESSAGE_TEXT_CHARS);
        assert!(validate_message_text(&exact).is_ok());
        let over: String = "a".repeat(MAX_MESSAGE_TEXT_CHARS + 1);
        assert!(matches!(
            validate_message_text(&over),
            Err(ValidationError::TooLong { got, .. }) if got == MAX_MESSAGE_TEXT_CHARS + 1
        ));
    }
}

use thiserror::Error;

use crate::model::StoredMessage;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TextError {
    #[error("message text is required")]
    Empty,
    #[error("message text exceeds {max} characters")]
    TooLong { max: usize },
}

/// Trims and bounds a message body. Length is counted in chars.
pub fn normalize_message_text(raw: &str, max_chars: usize) -> Result<String, TextError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(TextError::Empty);
    }
    if text.chars().count() > max_chars {
        return Err(TextError::TooLong { max: max_chars });
    }
    Ok(text.to_string())
}

pub fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

pub fn context_subject(item_name: &str, max_chars: usize) -> String {
    preview(&format!("Regarding {}", item_name.trim()), max_chars)
}

pub fn unread_count<'a, I>(messages: I, principal: &str) -> u64
where
    I: IntoIterator<Item = &'a StoredMessage>,
{
    messages
        .into_iter()
        .filter(|m| m.is_unread_for(principal))
        .count() as u64
}

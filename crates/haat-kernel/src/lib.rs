pub mod gate;
pub mod model;
pub mod paging;
pub mod reconcile;
pub mod text;
pub mod typing;

use chrono::{DateTime, Utc};

pub use model::{pair_key, CatalogItem, Conversation, MessagePage, Principal, StoredMessage, ThreadStats};
pub use paging::{clamp_paging, page_window, PageWindow};
pub use text::{context_subject, normalize_message_text, preview, unread_count, TextError};
pub use typing::TypingTable;

pub fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|v| v.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rfc3339_normalizes_offset() {
        let ts = parse_rfc3339("2026-02-14T05:45:00+05:45").unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-02-14T00:00:00+00:00");
        assert!(parse_rfc3339("yesterday").is_none());
    }
}

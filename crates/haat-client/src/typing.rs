use std::time::Duration;

use haat_contracts::TypingEvent;
use haat_kernel::typing::{TypingTable, TYPING_TTL};
use tokio::time::Instant;

/// Who is typing where, as seen by one signed-in principal.
///
/// Entries expire on their own after the TTL so a lost `typing:stop` never
/// leaves an indicator stuck on.
#[derive(Debug)]
pub struct TypingIndicators {
    me: String,
    table: TypingTable<(String, String)>,
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

impl TypingIndicators {
    pub fn new(me: impl Into<String>) -> Self {
        Self::with_ttl(me, TYPING_TTL)
    }

    pub fn with_ttl(me: impl Into<String>, ttl: Duration) -> Self {
        Self {
            me: me.into(),
            table: TypingTable::new(ttl),
        }
    }

    pub fn on_start(&mut self, event: &TypingEvent) {
        if event.user_id == self.me {
            return;
        }
        self.table
            .start((event.chat_id.clone(), event.user_id.clone()), now());
    }

    pub fn on_stop(&mut self, event: &TypingEvent) {
        if event.user_id == self.me {
            return;
        }
        self.table
            .stop(&(event.chat_id.clone(), event.user_id.clone()));
    }

    /// Principals currently typing in `chat_id`, sorted.
    pub fn typing_in(&self, chat_id: &str) -> Vec<String> {
        let mut users: Vec<String> = self
            .table
            .active(now())
            .filter(|(chat, _)| chat == chat_id)
            .map(|(_, user)| user.clone())
            .collect();
        users.sort();
        users
    }

    pub fn purge(&mut self) -> Vec<(String, String)> {
        self.table.purge(now())
    }

    /// Time until the earliest indicator lapses.
    pub fn next_expiry(&self) -> Option<Duration> {
        self.table
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now()))
    }

    pub fn clear(&mut self) {
        self.table.clear();
    }
}

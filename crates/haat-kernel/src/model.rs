use chrono::{DateTime, Utc};
use haat_contracts::{ChatContext, ChatMessage, PrincipalView, Role, SenderRef, ThreadSummary};

/// Identity record as served by the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub active: bool,
    pub blocked: bool,
}

impl Principal {
    pub fn view(&self) -> PrincipalView {
        PrincipalView {
            id: self.id.clone(),
            name: self.name.clone(),
            role: self.role,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogItem {
    pub id: String,
    pub name: String,
    pub owner: String,
}

/// Durable two-party conversation, without its message log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: String,
    /// Sorted pair; see [`pair_key`].
    pub participants: [String; 2],
    pub context: Option<ChatContext>,
    pub last_message_preview: String,
    pub last_message_sender: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn has_participant(&self, principal: &str) -> bool {
        self.participants.iter().any(|p| p == principal)
    }

    pub fn counterpart(&self, principal: &str) -> Option<&str> {
        if !self.has_participant(principal) {
            return None;
        }
        self.participants
            .iter()
            .find(|p| p.as_str() != principal)
            .map(|p| p.as_str())
    }

    /// Sort key for list views; empty conversations fall back to creation time.
    pub fn activity_at(&self) -> DateTime<Utc> {
        self.last_message_at.unwrap_or(self.created_at)
    }

    pub fn summary(&self, stats: ThreadStats, participants: Option<Vec<PrincipalView>>) -> ThreadSummary {
        ThreadSummary {
            chat_id: self.id.clone(),
            participants,
            context: self.context.clone(),
            last_message_preview: Some(self.last_message_preview.clone()),
            last_message_sender: self.last_message_sender.clone(),
            last_message_at: Some(self.last_message_at.unwrap_or(self.updated_at)),
            unread_count: Some(stats.unread_count),
            message_count: Some(stats.message_count as u64),
            updated_at: Some(self.updated_at),
        }
    }

    /// The lighter delta pushed alongside a new message.
    pub fn thread_delta(&self) -> ThreadSummary {
        ThreadSummary {
            last_message_preview: Some(self.last_message_preview.clone()),
            last_message_sender: self.last_message_sender.clone(),
            last_message_at: self.last_message_at,
            ..ThreadSummary::new(self.id.clone())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: String,
    pub sender: String,
    pub text: String,
    pub read_by: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn is_unread_for(&self, principal: &str) -> bool {
        self.sender != principal && !self.read_by.iter().any(|r| r == principal)
    }

    pub fn to_view(&self, sender: SenderRef) -> ChatMessage {
        ChatMessage {
            id: Some(self.id.clone()),
            sender,
            text: self.text.clone(),
            read_by: self.read_by.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadStats {
    pub message_count: usize,
    pub unread_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePage {
    /// Oldest to newest within the page.
    pub messages: Vec<StoredMessage>,
    pub has_more: bool,
    pub total: usize,
}

/// Canonical, order-insensitive participant pair.
pub fn pair_key(a: &str, b: &str) -> [String; 2] {
    if a <= b {
        [a.to_string(), b.to_string()]
    } else {
        [b.to_string(), a.to_string()]
    }
}

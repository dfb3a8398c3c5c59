use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Buyer,
    Farmer,
    Admin,
}

/// Presentation view of a principal, as attached to messages and threads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PrincipalView {
    pub id: String,
    pub name: String,
    pub role: Role,
}

/// Message author: either resolved to a profile or a bare principal id.
///
/// Push payloads and optimistic local entries may only carry the id; the
/// history endpoint resolves it. The reconciler ranks resolved senders higher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum SenderRef {
    Resolved(PrincipalView),
    Id(String),
}

impl SenderRef {
    pub fn id(&self) -> &str {
        match self {
            SenderRef::Resolved(view) => &view.id,
            SenderRef::Id(id) => id,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, SenderRef::Resolved(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Server-assigned id. Absent on optimistic, locally synthesized entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub sender: SenderRef,
    pub text: String,
    #[serde(default)]
    pub read_by: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatContext {
    pub product_id: String,
    pub subject: String,
}

/// Partial, denormalized projection of a conversation.
///
/// Every field but `chat_id` may be absent; an absent field in an update
/// never overwrites a present one.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSummary {
    pub chat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<PrincipalView>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ChatContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ThreadSummary {
    pub fn new(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenChatRequest {
    #[serde(default)]
    pub participant_id: String,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub initial_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenChatResponse {
    pub chat: ThreadSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatListResponse {
    pub count: usize,
    pub chats: Vec<ThreadSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub has_chat: bool,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub last_message_preview: String,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactsResponse {
    pub contacts: Vec<Contact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub chat: ThreadSummary,
    pub page: u32,
    pub limit: u32,
    pub total_messages: usize,
    pub has_more: bool,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadResponse {
    pub unread_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub message: ChatMessage,
    pub thread: ThreadSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingRequest {
    pub chat_id: String,
}

/// Frames a live-channel client may send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "join:chat")]
    JoinChat(String),
    #[serde(rename = "leave:chat")]
    LeaveChat(String),
    #[serde(rename = "typing:start")]
    TypingStart(TypingRequest),
    #[serde(rename = "typing:stop")]
    TypingStop(TypingRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageEvent {
    pub chat_id: String,
    pub message: ChatMessage,
    pub thread: ThreadSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReadEvent {
    pub chat_id: String,
    pub user_id: String,
    pub unread_count: u64,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub chat_id: String,
    pub user_id: String,
    pub typing_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub chat_id: String,
    pub created_at: DateTime<Utc>,
}

/// Frames the server pushes on the live channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "chat:message")]
    ChatMessage(ChatMessageEvent),
    #[serde(rename = "chat:thread-updated")]
    ThreadUpdated(ThreadSummary),
    #[serde(rename = "chat:read")]
    ChatRead(ReadEvent),
    #[serde(rename = "typing:start")]
    TypingStart(TypingEvent),
    #[serde(rename = "typing:stop")]
    TypingStop(TypingEvent),
    #[serde(rename = "notification:new")]
    Notification(NotificationEvent),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::ChatMessage(_) => "chat:message",
            ServerEvent::ThreadUpdated(_) => "chat:thread-updated",
            ServerEvent::ChatRead(_) => "chat:read",
            ServerEvent::TypingStart(_) => "typing:start",
            ServerEvent::TypingStop(_) => "typing:stop",
            ServerEvent::Notification(_) => "notification:new",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sender_ref_accepts_bare_id_and_profile() {
        let bare: SenderRef = serde_json::from_value(json!("u-1")).unwrap();
        assert_eq!(bare, SenderRef::Id("u-1".to_string()));
        assert!(!bare.is_resolved());

        let resolved: SenderRef =
            serde_json::from_value(json!({"id": "u-2", "name": "Sita", "role": "farmer"}))
                .unwrap();
        assert!(resolved.is_resolved());
        assert_eq!(resolved.id(), "u-2");
    }

    #[test]
    fn partial_thread_summary_omits_absent_fields() {
        let mut summary = ThreadSummary::new("c-1");
        summary.unread_count = Some(3);
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value, json!({"chatId": "c-1", "unreadCount": 3}));
    }

    #[test]
    fn client_events_use_colon_names() {
        let join: ClientEvent =
            serde_json::from_value(json!({"event": "join:chat", "data": "c-9"})).unwrap();
        assert_eq!(join, ClientEvent::JoinChat("c-9".to_string()));

        let typing: ClientEvent =
            serde_json::from_value(json!({"event": "typing:start", "data": {"chatId": "c-9"}}))
                .unwrap();
        assert_eq!(
            typing,
            ClientEvent::TypingStart(TypingRequest {
                chat_id: "c-9".to_string()
            })
        );
    }

    #[test]
    fn thread_update_event_is_tagged() {
        let event = ServerEvent::ThreadUpdated(ThreadSummary::new("c-2"));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "chat:thread-updated");
        assert_eq!(value["data"]["chatId"], "c-2");
        assert_eq!(event.name(), "chat:thread-updated");
    }
}

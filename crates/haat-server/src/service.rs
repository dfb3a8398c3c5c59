use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use haat_contracts::{
    ChatContext, ChatListResponse, ChatMessageEvent, Contact, HistoryQuery, HistoryResponse,
    OpenChatRequest, PrincipalView, ReadEvent, Role, SendMessageResponse, SenderRef, ServerEvent,
    ThreadSummary,
};
use haat_kernel::{
    clamp_paging, context_subject, gate, normalize_message_text, Conversation, Principal,
    ThreadStats,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::broker::{Room, RoomBroker};
use crate::directory::Directory;
use crate::error::ChatError;
use crate::notify::Notifier;
use crate::store::{StoreBackend, StoreError};

pub struct ChatService {
    cfg: haat_config::Chat,
    store: Arc<Mutex<StoreBackend>>,
    directory: Arc<dyn Directory>,
    broker: Arc<RoomBroker>,
    notifier: Arc<Notifier>,
    chat_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ChatService {
    pub fn new(
        cfg: haat_config::Chat,
        store: StoreBackend,
        directory: Arc<dyn Directory>,
        broker: Arc<RoomBroker>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            cfg,
            store: Arc::new(Mutex::new(store)),
            directory,
            broker,
            notifier,
            chat_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub fn broker(&self) -> &Arc<RoomBroker> {
        &self.broker
    }

    /// Serializes append-then-publish per conversation so every room member
    /// sees messages in store order. Only taken for conversations the caller
    /// belongs to.
    async fn chat_lock(&self, chat_id: &str) -> Arc<Mutex<()>> {
        self.chat_locks
            .lock()
            .await
            .entry(chat_id.to_string())
            .or_default()
            .clone()
    }

    /// Drops the table entry once no other request holds the lock.
    async fn release_chat_lock(&self, chat_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.chat_locks.lock().await;
        drop(lock);
        if locks.get(chat_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(chat_id);
        }
    }

    async fn ensure_member(&self, caller: &Principal, chat_id: &str) -> Result<(), ChatError> {
        let store = self.store.lock().await;
        let conv = store.get(chat_id)?.ok_or(StoreError::NotFound)?;
        if !gate::is_participant(&conv, &caller.id) {
            return Err(ChatError::forbidden());
        }
        Ok(())
    }

    fn ensure_caller(caller: &Principal) -> Result<(), ChatError> {
        if gate::is_eligible(caller) && gate::may_use_chat(caller.role) {
            Ok(())
        } else {
            Err(ChatError::forbidden())
        }
    }

    fn participant_views(&self, conv: &Conversation) -> Vec<PrincipalView> {
        conv.participants
            .iter()
            .filter_map(|id| self.directory.principal(id))
            .map(|p| p.view())
            .collect()
    }

    fn summary(&self, conv: &Conversation, stats: ThreadStats) -> ThreadSummary {
        conv.summary(stats, Some(self.participant_views(conv)))
    }

    pub async fn create_or_open(
        &self,
        caller: &Principal,
        req: OpenChatRequest,
    ) -> Result<ThreadSummary, ChatError> {
        Self::ensure_caller(caller)?;
        let participant_id = req.participant_id.trim();
        if participant_id.is_empty() {
            return Err(ChatError::InvalidInput("participantId is required".to_string()));
        }
        if participant_id == caller.id {
            return Err(ChatError::forbidden());
        }
        let counterpart = self
            .directory
            .principal(participant_id)
            .ok_or_else(|| ChatError::NotFound("participant not found".to_string()))?;
        if !gate::is_eligible(&counterpart) || !gate::can_pair(caller, &counterpart) {
            return Err(ChatError::forbidden());
        }

        let context = match req.product_id.as_deref().map(str::trim) {
            Some(product_id) if !product_id.is_empty() => {
                let item = self
                    .directory
                    .product(product_id)
                    .ok_or_else(|| ChatError::NotFound("context product not found".to_string()))?;
                if !gate::can_attach_context(&caller.id, &item, &counterpart.id) {
                    return Err(ChatError::forbidden());
                }
                Some(ChatContext {
                    product_id: item.id.clone(),
                    subject: context_subject(&item.name, self.cfg.subject_len),
                })
            }
            _ => None,
        };

        let first_message = match req.initial_message.as_deref() {
            Some(raw) if !raw.trim().is_empty() => {
                Some(normalize_message_text(raw, self.cfg.max_text_len).map_err(|e| {
                    ChatError::InvalidInput(e.to_string())
                })?)
            }
            _ => None,
        };

        let conv = {
            let mut store = self.store.lock().await;
            store.get_or_create(caller, &counterpart, context, Utc::now())?
        };
        info!(chat_id = %conv.id, caller = %caller.id, counterpart = %counterpart.id, "chat opened");

        if let Some(text) = first_message {
            self.send_message(caller, &conv.id, &text).await?;
        }

        let store = self.store.lock().await;
        let conv = store.get(&conv.id)?.ok_or(StoreError::NotFound)?;
        let stats = store.stats(&conv.id, &caller.id)?;
        Ok(self.summary(&conv, stats))
    }

    pub async fn list_my_conversations(
        &self,
        caller: &Principal,
    ) -> Result<ChatListResponse, ChatError> {
        Self::ensure_caller(caller)?;
        let store = self.store.lock().await;
        let mut conversations = store.list_for(&caller.id)?;
        conversations.sort_by_key(|c| Reverse(c.activity_at()));
        conversations.truncate(self.cfg.list_limit);

        let mut chats = Vec::with_capacity(conversations.len());
        for conv in &conversations {
            let stats = store.stats(&conv.id, &caller.id)?;
            chats.push(self.summary(conv, stats));
        }
        Ok(ChatListResponse {
            count: chats.len(),
            chats,
        })
    }

    /// Reachable counterparts: a buyer's followed farmers and order partners,
    /// or a farmer's order partners. Listing never creates a conversation.
    pub async fn list_contacts(&self, caller: &Principal) -> Result<Vec<Contact>, ChatError> {
        Self::ensure_caller(caller)?;
        let Some(target_role) = gate::counterpart_role(caller.role) else {
            return Ok(Vec::new());
        };

        let mut ids: BTreeSet<String> = self.directory.trade_partners(&caller.id).into_iter().collect();
        if caller.role == Role::Buyer {
            ids.extend(self.directory.subscribed_farmers(&caller.id));
        }

        let by_counterpart: HashMap<String, ThreadSummary> = {
            let store = self.store.lock().await;
            let mut map = HashMap::new();
            for conv in store.list_for(&caller.id)? {
                let Some(other) = conv.counterpart(&caller.id) else {
                    continue;
                };
                let stats = store.stats(&conv.id, &caller.id)?;
                map.insert(other.to_string(), conv.summary(stats, None));
            }
            map
        };

        let mut contacts: Vec<Contact> = ids
            .iter()
            .filter_map(|id| self.directory.principal(id))
            .filter(|p| p.role == target_role && gate::is_eligible(p))
            .map(|p| {
                let thread = by_counterpart.get(&p.id);
                Contact {
                    has_chat: thread.is_some(),
                    chat_id: thread.map(|t| t.chat_id.clone()),
                    last_message_preview: thread
                        .and_then(|t| t.last_message_preview.clone())
                        .unwrap_or_default(),
                    last_message_at: thread.and_then(|t| t.last_message_at),
                    unread_count: thread.and_then(|t| t.unread_count).unwrap_or(0),
                    id: p.id,
                    name: p.name,
                    role: p.role,
                }
            })
            .collect();
        contacts.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(contacts)
    }

    pub async fn get_history(
        &self,
        caller: &Principal,
        chat_id: &str,
        query: HistoryQuery,
    ) -> Result<HistoryResponse, ChatError> {
        Self::ensure_caller(caller)?;
        let (page, limit) = clamp_paging(
            query.page,
            query.limit,
            self.cfg.default_page_limit,
            self.cfg.max_page_limit,
        );

        let (conv, stats, window) = {
            let store = self.store.lock().await;
            let conv = store
                .get(chat_id)?
                .ok_or_else(|| ChatError::NotFound("chat not found".to_string()))?;
            if !gate::is_participant(&conv, &caller.id) {
                return Err(ChatError::forbidden());
            }
            let window = store.list_page(chat_id, page, limit)?;
            let stats = store.stats(chat_id, &caller.id)?;
            (conv, stats, window)
        };

        let mut senders: HashMap<&str, SenderRef> = HashMap::new();
        for message in &window.messages {
            senders.entry(message.sender.as_str()).or_insert_with(|| {
                match self.directory.principal(&message.sender) {
                    Some(p) => SenderRef::Resolved(p.view()),
                    None => SenderRef::Id(message.sender.clone()),
                }
            });
        }
        let messages = window
            .messages
            .iter()
            .map(|m| {
                let sender = senders
                    .get(m.sender.as_str())
                    .cloned()
                    .unwrap_or_else(|| SenderRef::Id(m.sender.clone()));
                m.to_view(sender)
            })
            .collect();

        Ok(HistoryResponse {
            chat: self.summary(&conv, stats),
            page,
            limit,
            total_messages: window.total,
            has_more: window.has_more,
            messages,
        })
    }

    pub async fn send_message(
        &self,
        caller: &Principal,
        chat_id: &str,
        text: &str,
    ) -> Result<SendMessageResponse, ChatError> {
        Self::ensure_caller(caller)?;
        self.ensure_member(caller, chat_id).await?;
        let lock = self.chat_lock(chat_id).await;
        let sent = {
            let _guard = lock.lock().await;
            self.append_and_publish(caller, chat_id, text).await
        };
        self.release_chat_lock(chat_id, lock).await;
        sent
    }

    async fn append_and_publish(
        &self,
        caller: &Principal,
        chat_id: &str,
        text: &str,
    ) -> Result<SendMessageResponse, ChatError> {
        let (conv, stored, unread) = {
            let mut store = self.store.lock().await;
            let (conv, stored) = store.append_message(chat_id, &caller.id, text, Utc::now())?;
            let mut unread = Vec::with_capacity(2);
            for participant in &conv.participants {
                unread.push((
                    participant.clone(),
                    store.stats(chat_id, participant)?.unread_count,
                ));
            }
            (conv, stored, unread)
        };

        let message = stored.to_view(SenderRef::Resolved(caller.view()));
        let thread = conv.thread_delta();
        debug!(chat_id, message_id = %stored.id, "message appended");

        self.broker
            .publish(
                &Room::Chat(conv.id.clone()),
                &ServerEvent::ChatMessage(ChatMessageEvent {
                    chat_id: conv.id.clone(),
                    message: message.clone(),
                    thread: thread.clone(),
                }),
                None,
            )
            .await;
        for (participant, unread_count) in unread {
            let update = ThreadSummary {
                unread_count: Some(unread_count),
                ..thread.clone()
            };
            self.broker
                .publish(&Room::User(participant), &ServerEvent::ThreadUpdated(update), None)
                .await;
        }

        for recipient in conv.participants.iter().filter(|p| **p != caller.id) {
            let notifier = Arc::clone(&self.notifier);
            let recipient = recipient.clone();
            let sender = caller.clone();
            let chat_id = conv.id.clone();
            tokio::spawn(async move {
                notifier.chat_message(&recipient, &sender, &chat_id).await;
            });
        }

        Ok(SendMessageResponse { message, thread })
    }

    pub async fn mark_read(&self, caller: &Principal, chat_id: &str) -> Result<u64, ChatError> {
        Self::ensure_caller(caller)?;
        self.ensure_member(caller, chat_id).await?;
        let lock = self.chat_lock(chat_id).await;
        let unread = {
            let _guard = lock.lock().await;
            self.mark_and_publish(caller, chat_id).await
        };
        self.release_chat_lock(chat_id, lock).await;
        unread
    }

    async fn mark_and_publish(&self, caller: &Principal, chat_id: &str) -> Result<u64, ChatError> {
        let unread_count = {
            let mut store = self.store.lock().await;
            store.mark_read(chat_id, &caller.id)?
        };

        self.broker
            .publish(
                &Room::Chat(chat_id.to_string()),
                &ServerEvent::ChatRead(ReadEvent {
                    chat_id: chat_id.to_string(),
                    user_id: caller.id.clone(),
                    unread_count,
                    read_at: Utc::now(),
                }),
                None,
            )
            .await;
        let update = ThreadSummary {
            unread_count: Some(unread_count),
            ..ThreadSummary::new(chat_id)
        };
        self.broker
            .publish(
                &Room::User(caller.id.clone()),
                &ServerEvent::ThreadUpdated(update),
                None,
            )
            .await;
        Ok(unread_count)
    }

    /// Membership check made at join time, never cached.
    pub async fn can_join(&self, principal: &str, chat_id: &str) -> bool {
        let store = self.store.lock().await;
        match store.get(chat_id) {
            Ok(Some(conv)) => gate::is_participant(&conv, principal),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use crate::store::{MemoryStore, StoreLimits};
    use haat_config::{Chat, Notifications, PrincipalSeed};

    fn seed(id: &str, role: Role) -> PrincipalSeed {
        PrincipalSeed {
            id: id.to_string(),
            name: id.to_string(),
            role,
            token: format!("tok-{id}"),
            active: true,
            blocked: false,
            notify_chat: false,
            notify_in_app: false,
            subscribed_farmers: Vec::new(),
        }
    }

    async fn service() -> ChatService {
        let directory: Arc<dyn Directory> = Arc::new(StaticDirectory::from_config(
            &haat_config::Directory {
                principals: vec![
                    seed("buyer", Role::Buyer),
                    seed("farmer", Role::Farmer),
                    seed("other", Role::Buyer),
                ],
                products: Vec::new(),
                orders: Vec::new(),
            },
        ));
        let broker = Arc::new(RoomBroker::new());
        let notifier = Notifier::new(
            &Notifications {
                enabled: false,
                jsonl_path: None,
            },
            Arc::clone(&broker),
            Arc::clone(&directory),
        )
        .await
        .unwrap();
        let chat = Chat::default();
        ChatService::new(
            chat.clone(),
            StoreBackend::Memory(MemoryStore::new(StoreLimits::from_config(&chat))),
            directory,
            broker,
            Arc::new(notifier),
        )
    }

    #[tokio::test]
    async fn rejected_writes_leave_no_lock_entries() {
        let chat = service().await;
        let buyer = chat.directory().principal("buyer").unwrap();
        let other = chat.directory().principal("other").unwrap();

        for i in 0..50 {
            let missing = format!("chat_missing_{i}");
            assert!(matches!(
                chat.send_message(&buyer, &missing, "hi").await,
                Err(ChatError::NotFound(_))
            ));
            assert!(matches!(
                chat.mark_read(&buyer, &missing).await,
                Err(ChatError::NotFound(_))
            ));
        }
        assert!(chat.chat_locks.lock().await.is_empty());

        let chat_id = chat
            .create_or_open(
                &buyer,
                OpenChatRequest {
                    participant_id: "farmer".to_string(),
                    product_id: None,
                    initial_message: None,
                },
            )
            .await
            .unwrap()
            .chat_id;
        assert!(matches!(
            chat.send_message(&other, &chat_id, "let me in").await,
            Err(ChatError::Forbidden(_))
        ));
        assert!(chat.chat_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn lock_entry_is_released_after_send() {
        let chat = service().await;
        let buyer = chat.directory().principal("buyer").unwrap();
        let chat_id = chat
            .create_or_open(
                &buyer,
                OpenChatRequest {
                    participant_id: "farmer".to_string(),
                    product_id: None,
                    initial_message: Some("namaste".to_string()),
                },
            )
            .await
            .unwrap()
            .chat_id;
        chat.send_message(&buyer, &chat_id, "still fresh?").await.unwrap();
        chat.mark_read(&buyer, &chat_id).await.unwrap();
        assert!(chat.chat_locks.lock().await.is_empty());
    }
}

use std::collections::HashMap;

use haat_contracts::{
    ChatMessage, ChatMessageEvent, Contact, HistoryResponse, ReadEvent, SendMessageResponse,
    ThreadSummary,
};
use haat_kernel::reconcile::{apply_thread_to_contacts, merge_messages, sort_by_recent, upsert_summary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMeta {
    pub page: u32,
    pub has_more: bool,
    pub total_messages: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ChatState {
    me: String,
    threads: Vec<ThreadSummary>,
    contacts: Vec<Contact>,
    messages: HashMap<String, Vec<ChatMessage>>,
    meta: HashMap<String, PageMeta>,
    active_chat: Option<String>,
}

impl ChatState {
    pub fn new(me: impl Into<String>) -> Self {
        Self {
            me: me.into(),
            ..Self::default()
        }
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    pub fn threads(&self) -> &[ThreadSummary] {
        &self.threads
    }

    pub fn thread(&self, chat_id: &str) -> Option<&ThreadSummary> {
        self.threads.iter().find(|t| t.chat_id == chat_id)
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn messages(&self, chat_id: &str) -> &[ChatMessage] {
        self.messages.get(chat_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn page_meta(&self, chat_id: &str) -> Option<PageMeta> {
        self.meta.get(chat_id).copied()
    }

    pub fn active_chat(&self) -> Option<&str> {
        self.active_chat.as_deref()
    }

    pub fn set_active_chat(&mut self, chat_id: Option<String>) {
        self.active_chat = chat_id;
    }

    /// Replaces the list. The newest thread becomes active if none is.
    pub fn apply_chat_list(&mut self, chats: Vec<ThreadSummary>) {
        self.threads = chats;
        sort_by_recent(&mut self.threads);
        if self.active_chat.is_none() {
            self.active_chat = self.threads.first().map(|t| t.chat_id.clone());
        }
    }

    pub fn apply_contacts(&mut self, contacts: Vec<Contact>) {
        self.contacts = contacts;
    }

    pub fn apply_opened_chat(&mut self, chat: ThreadSummary) {
        let chat_id = chat.chat_id.clone();
        upsert_summary(&mut self.threads, chat);
        self.active_chat = Some(chat_id);
    }

    /// Folds one history page. With `append`, the recorded page never moves
    /// back to a newer one.
    pub fn apply_history(&mut self, history: &HistoryResponse, append: bool) {
        let chat_id = history.chat.chat_id.clone();
        self.merge_into(&chat_id, &history.messages);

        let page = match (append, self.meta.get(&chat_id)) {
            (true, Some(prev)) => prev.page.max(history.page),
            _ => history.page,
        };
        self.meta.insert(
            chat_id.clone(),
            PageMeta {
                page,
                has_more: history.has_more,
                total_messages: history.total_messages,
            },
        );

        if !chat_id.is_empty() {
            upsert_summary(&mut self.threads, history.chat.clone());
            apply_thread_to_contacts(&mut self.contacts, &history.chat);
        }
    }

    /// Our own message was accepted; nothing in the thread is unread for us.
    pub fn apply_sent(&mut self, chat_id: &str, sent: &SendMessageResponse) {
        self.merge_into(chat_id, std::slice::from_ref(&sent.message));
        let update = ThreadSummary {
            unread_count: Some(0),
            ..self.delta_for(chat_id, &sent.message, Some(&sent.thread))
        };
        upsert_summary(&mut self.threads, update.clone());
        apply_thread_to_contacts(&mut self.contacts, &update);
    }

    pub fn apply_mark_read(&mut self, chat_id: &str, unread_count: u64) {
        let update = ThreadSummary {
            unread_count: Some(unread_count),
            ..ThreadSummary::new(chat_id)
        };
        if let Some(thread) = self.threads.iter_mut().find(|t| t.chat_id == chat_id) {
            thread.unread_count = Some(unread_count);
        }
        apply_thread_to_contacts(&mut self.contacts, &update);
    }

    /// Folds a pushed message. Returns true when it arrived in the open chat
    /// from someone else, meaning a read receipt is due.
    pub fn apply_incoming(&mut self, event: &ChatMessageEvent) -> bool {
        if event.chat_id.is_empty() {
            return false;
        }
        self.merge_into(&event.chat_id, std::slice::from_ref(&event.message));
        let update = self.delta_for(&event.chat_id, &event.message, Some(&event.thread));
        upsert_summary(&mut self.threads, update.clone());
        apply_thread_to_contacts(&mut self.contacts, &update);

        self.active_chat.as_deref() == Some(event.chat_id.as_str())
            && event.message.sender.id() != self.me
    }

    pub fn apply_thread_update(&mut self, update: ThreadSummary) {
        if update.chat_id.is_empty() {
            return;
        }
        apply_thread_to_contacts(&mut self.contacts, &update);
        upsert_summary(&mut self.threads, update);
    }

    /// Our own read syncs the unread count across sessions; the
    /// counterpart's read marks our messages as seen.
    pub fn apply_read(&mut self, event: &ReadEvent) {
        if event.user_id == self.me {
            self.apply_mark_read(&event.chat_id, event.unread_count);
            return;
        }
        if let Some(messages) = self.messages.get_mut(&event.chat_id) {
            for message in messages.iter_mut() {
                if message.sender.id() == self.me && !message.read_by.contains(&event.user_id) {
                    message.read_by.push(event.user_id.clone());
                }
            }
        }
    }

    pub fn clear(&mut self) {
        let me = std::mem::take(&mut self.me);
        *self = Self::new(me);
    }

    fn merge_into(&mut self, chat_id: &str, incoming: &[ChatMessage]) {
        let merged = merge_messages(self.messages(chat_id), incoming);
        self.messages.insert(chat_id.to_string(), merged);
    }

    /// Summary delta for a new message, preferring what the server sent.
    fn delta_for(
        &self,
        chat_id: &str,
        message: &ChatMessage,
        thread: Option<&ThreadSummary>,
    ) -> ThreadSummary {
        ThreadSummary {
            last_message_preview: thread
                .and_then(|t| t.last_message_preview.clone())
                .or_else(|| Some(message.text.clone())),
            last_message_sender: thread
                .and_then(|t| t.last_message_sender.clone())
                .or_else(|| Some(message.sender.id().to_string())),
            last_message_at: thread
                .and_then(|t| t.last_message_at)
                .or(Some(message.created_at)),
            ..ThreadSummary::new(chat_id)
        }
    }
}

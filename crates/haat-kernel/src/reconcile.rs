use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use haat_contracts::{ChatMessage, Contact, ThreadSummary};

/// Fallback identity for entries that have no server id yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeKey {
    pub sender: String,
    pub created_at: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Id(String),
    Composite(CompositeKey),
}

pub fn composite_key(message: &ChatMessage) -> CompositeKey {
    CompositeKey {
        sender: message.sender.id().to_string(),
        created_at: message.created_at,
        text: message.text.clone(),
    }
}

pub fn message_key(message: &ChatMessage) -> MessageKey {
    match &message.id {
        Some(id) => MessageKey::Id(id.clone()),
        None => MessageKey::Composite(composite_key(message)),
    }
}

/// Picks the richer of two entries for the same message.
///
/// A resolved sender outranks a bare id; otherwise the larger `read_by`
/// wins, ties going to `incoming`. The result keeps any server id either
/// side knew and the union of both `read_by` sets.
pub fn prefer_richer(current: ChatMessage, incoming: ChatMessage) -> ChatMessage {
    let incoming_wins = match (current.sender.is_resolved(), incoming.sender.is_resolved()) {
        (false, true) => true,
        (true, false) => false,
        _ => incoming.read_by.len() >= current.read_by.len(),
    };
    let (mut winner, loser) = if incoming_wins {
        (incoming, current)
    } else {
        (current, incoming)
    };
    if winner.id.is_none() {
        winner.id = loser.id;
    }
    for reader in loser.read_by {
        if !winner.read_by.contains(&reader) {
            winner.read_by.push(reader);
        }
    }
    winner
}

/// Deduplicating union of two message collections, sorted by `created_at`
/// with ties broken by id.
///
/// Two entries are the same message when both carry ids and the ids match,
/// or when at least one lacks an id and their composite keys match.
pub fn merge_messages(current: &[ChatMessage], incoming: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut merged: Vec<ChatMessage> = Vec::with_capacity(current.len() + incoming.len());
    let mut by_id: HashMap<String, usize> = HashMap::new();
    let mut by_composite: HashMap<CompositeKey, usize> = HashMap::new();

    for message in current.iter().chain(incoming.iter()) {
        let composite = composite_key(message);
        let slot = match &message.id {
            Some(id) => by_id.get(id).copied().or_else(|| {
                by_composite
                    .get(&composite)
                    .copied()
                    .filter(|idx| merged[*idx].id.is_none())
            }),
            None => by_composite.get(&composite).copied(),
        };

        match slot {
            Some(idx) => {
                let existing = merged[idx].clone();
                merged[idx] = prefer_richer(existing, message.clone());
                if let Some(id) = &merged[idx].id {
                    by_id.insert(id.clone(), idx);
                }
            }
            None => {
                let idx = merged.len();
                if let Some(id) = &message.id {
                    by_id.insert(id.clone(), idx);
                }
                by_composite.entry(composite).or_insert(idx);
                merged.push(message.clone());
            }
        }
    }

    merged.sort_by(compare_messages);
    merged
}

fn compare_messages(a: &ChatMessage, b: &ChatMessage) -> Ordering {
    a.created_at.cmp(&b.created_at).then_with(|| {
        a.id.as_deref()
            .unwrap_or("")
            .cmp(b.id.as_deref().unwrap_or(""))
    })
}

fn present<T: Clone>(existing: &Option<T>, update: &Option<T>) -> Option<T> {
    update.clone().or_else(|| existing.clone())
}

/// Field-by-field merge: present fields in `update` win, absent ones keep
/// the existing value.
pub fn merge_summary(existing: &ThreadSummary, update: &ThreadSummary) -> ThreadSummary {
    ThreadSummary {
        chat_id: existing.chat_id.clone(),
        participants: present(&existing.participants, &update.participants),
        context: present(&existing.context, &update.context),
        last_message_preview: present(&existing.last_message_preview, &update.last_message_preview),
        last_message_sender: present(&existing.last_message_sender, &update.last_message_sender),
        last_message_at: present(&existing.last_message_at, &update.last_message_at),
        unread_count: present(&existing.unread_count, &update.unread_count),
        message_count: present(&existing.message_count, &update.message_count),
        updated_at: present(&existing.updated_at, &update.updated_at),
    }
}

/// Newest activity first; threads without a timestamp sink to the end.
pub fn sort_by_recent(threads: &mut [ThreadSummary]) {
    threads.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
}

/// Merges `update` into the matching thread, or inserts it at the front,
/// then re-sorts the list.
pub fn upsert_summary(threads: &mut Vec<ThreadSummary>, update: ThreadSummary) {
    if update.chat_id.is_empty() {
        return;
    }
    match threads.iter_mut().find(|t| t.chat_id == update.chat_id) {
        Some(existing) => *existing = merge_summary(existing, &update),
        None => threads.insert(0, update),
    }
    sort_by_recent(threads);
}

/// Applies the preview, timestamp and unread fields of a thread update to
/// the contact that owns the thread.
pub fn apply_thread_to_contacts(contacts: &mut [Contact], update: &ThreadSummary) {
    if update.chat_id.is_empty() {
        return;
    }
    for contact in contacts
        .iter_mut()
        .filter(|c| c.chat_id.as_deref() == Some(update.chat_id.as_str()))
    {
        if let Some(preview) = &update.last_message_preview {
            contact.last_message_preview = preview.clone();
        }
        if update.last_message_at.is_some() {
            contact.last_message_at = update.last_message_at;
        }
        if let Some(unread) = update.unread_count {
            contact.unread_count = unread;
        }
    }
}

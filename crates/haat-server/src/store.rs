use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use haat_contracts::ChatContext;
use haat_kernel::gate;
use haat_kernel::{
    normalize_message_text, page_window, pair_key, parse_rfc3339, preview, unread_count,
    Conversation, MessagePage, Principal, StoredMessage, TextError, ThreadStats,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation not found")]
    NotFound,
    #[error("not a participant of this conversation")]
    Forbidden,
    #[error("{0}")]
    InvalidInput(String),
    #[error("principals cannot converse")]
    InvalidPair,
    #[error("storage failure: {0}")]
    Backend(String),
}

impl From<TextError> for StoreError {
    fn from(err: TextError) -> Self {
        StoreError::InvalidInput(err.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    pub max_messages: usize,
    pub max_text_len: usize,
    pub preview_len: usize,
}

impl StoreLimits {
    pub fn from_config(chat: &haat_config::Chat) -> Self {
        Self {
            max_messages: chat.max_messages.max(1),
            max_text_len: chat.max_text_len,
            preview_len: chat.preview_len,
        }
    }
}

pub enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

impl StoreBackend {
    pub fn open(cfg: &haat_config::Store, limits: StoreLimits) -> Result<Self, StoreError> {
        if cfg.kind == "sqlite" {
            let path = cfg.sqlite_path.as_deref().ok_or_else(|| {
                StoreError::Backend("store.sqlite_path is required for sqlite store".to_string())
            })?;
            Ok(StoreBackend::Sqlite(SqliteStore::new(path, limits)?))
        } else {
            Ok(StoreBackend::Memory(MemoryStore::new(limits)))
        }
    }

    /// Returns the pair's conversation, creating it on first contact.
    ///
    /// An existing conversation only gains `context` when it has none; a
    /// context already pinned to some catalog item is kept.
    pub fn get_or_create(
        &mut self,
        a: &Principal,
        b: &Principal,
        context: Option<ChatContext>,
        now: DateTime<Utc>,
    ) -> Result<Conversation, StoreError> {
        if !gate::can_pair(a, b) {
            return Err(StoreError::InvalidPair);
        }
        match self {
            StoreBackend::Memory(store) => Ok(store.get_or_create(&a.id, &b.id, context, now)),
            StoreBackend::Sqlite(store) => store.get_or_create(&a.id, &b.id, context, now),
        }
    }

    pub fn get(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store.conversations.get(id).map(|c| c.meta.clone())),
            StoreBackend::Sqlite(store) => store.get(id),
        }
    }

    pub fn list_for(&self, principal: &str) -> Result<Vec<Conversation>, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .conversations
                .values()
                .filter(|c| c.meta.has_participant(principal))
                .map(|c| c.meta.clone())
                .collect()),
            StoreBackend::Sqlite(store) => store.list_for(principal),
        }
    }

    pub fn stats(&self, id: &str, principal: &str) -> Result<ThreadStats, StoreError> {
        match self {
            StoreBackend::Memory(store) => {
                let conv = store.conversations.get(id).ok_or(StoreError::NotFound)?;
                Ok(ThreadStats {
                    message_count: conv.messages.len(),
                    unread_count: unread_count(&conv.messages, principal),
                })
            }
            StoreBackend::Sqlite(store) => store.stats(id, principal),
        }
    }

    /// Appends a message and returns it with the updated conversation.
    pub fn append_message(
        &mut self,
        id: &str,
        sender: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<(Conversation, StoredMessage), StoreError> {
        match self {
            StoreBackend::Memory(store) => store.append_message(id, sender, text, now),
            StoreBackend::Sqlite(store) => store.append_message(id, sender, text, now),
        }
    }

    pub fn list_page(&self, id: &str, page: u32, limit: u32) -> Result<MessagePage, StoreError> {
        match self {
            StoreBackend::Memory(store) => {
                let conv = store.conversations.get(id).ok_or(StoreError::NotFound)?;
                let total = conv.messages.len();
                let window = page_window(total, page, limit);
                Ok(MessagePage {
                    messages: conv.messages[window.start..window.end].to_vec(),
                    has_more: window.has_more,
                    total,
                })
            }
            StoreBackend::Sqlite(store) => store.list_page(id, page, limit),
        }
    }

    /// Marks every message not authored by `principal` as read by them and
    /// returns their resulting unread count.
    pub fn mark_read(&mut self, id: &str, principal: &str) -> Result<u64, StoreError> {
        match self {
            StoreBackend::Memory(store) => store.mark_read(id, principal),
            StoreBackend::Sqlite(store) => store.mark_read(id, principal),
        }
    }
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().as_simple())
}

/// Keeps message timestamps non-decreasing within a conversation.
fn append_time(conv: &Conversation, now: DateTime<Utc>) -> DateTime<Utc> {
    match conv.last_message_at {
        Some(last) if last > now => last,
        _ => now,
    }
}

fn apply_append(conv: &mut Conversation, message: &StoredMessage, preview_len: usize) {
    conv.last_message_preview = preview(&message.text, preview_len);
    conv.last_message_sender = Some(message.sender.clone());
    conv.last_message_at = Some(message.created_at);
    conv.updated_at = message.created_at;
}

struct MemoryConversation {
    meta: Conversation,
    messages: Vec<StoredMessage>,
}

pub struct MemoryStore {
    limits: StoreLimits,
    conversations: HashMap<String, MemoryConversation>,
    pairs: HashMap<[String; 2], String>,
}

impl MemoryStore {
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            limits,
            conversations: HashMap::new(),
            pairs: HashMap::new(),
        }
    }

    fn get_or_create(
        &mut self,
        a: &str,
        b: &str,
        context: Option<ChatContext>,
        now: DateTime<Utc>,
    ) -> Conversation {
        let pair = pair_key(a, b);
        if let Some(existing) = self
            .pairs
            .get(&pair)
            .and_then(|id| self.conversations.get_mut(id))
        {
            if existing.meta.context.is_none() && context.is_some() {
                existing.meta.context = context;
            }
            return existing.meta.clone();
        }

        let meta = Conversation {
            id: new_id("chat"),
            participants: pair.clone(),
            context,
            last_message_preview: String::new(),
            last_message_sender: None,
            last_message_at: None,
            created_at: now,
            updated_at: now,
        };
        self.pairs.insert(pair, meta.id.clone());
        self.conversations.insert(
            meta.id.clone(),
            MemoryConversation {
                meta: meta.clone(),
                messages: Vec::new(),
            },
        );
        meta
    }

    fn append_message(
        &mut self,
        id: &str,
        sender: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<(Conversation, StoredMessage), StoreError> {
        let conv = self.conversations.get_mut(id).ok_or(StoreError::NotFound)?;
        if !conv.meta.has_participant(sender) {
            return Err(StoreError::Forbidden);
        }
        let text = normalize_message_text(text, self.limits.max_text_len)?;

        let message = StoredMessage {
            id: new_id("msg"),
            sender: sender.to_string(),
            text,
            read_by: vec![sender.to_string()],
            created_at: append_time(&conv.meta, now),
        };
        conv.messages.push(message.clone());
        if conv.messages.len() > self.limits.max_messages {
            let overflow = conv.messages.len() - self.limits.max_messages;
            conv.messages.drain(..overflow);
        }
        apply_append(&mut conv.meta, &message, self.limits.preview_len);
        Ok((conv.meta.clone(), message))
    }

    fn mark_read(&mut self, id: &str, principal: &str) -> Result<u64, StoreError> {
        let conv = self.conversations.get_mut(id).ok_or(StoreError::NotFound)?;
        if !conv.meta.has_participant(principal) {
            return Err(StoreError::Forbidden);
        }
        for message in conv.messages.iter_mut() {
            if message.is_unread_for(principal) {
                message.read_by.push(principal.to_string());
            }
        }
        Ok(unread_count(&conv.messages, principal))
    }
}

pub struct SqliteStore {
    conn: Connection,
    limits: StoreLimits,
}

struct ConversationRow {
    id: String,
    participant_a: String,
    participant_b: String,
    context_product: Option<String>,
    context_subject: Option<String>,
    last_message_preview: String,
    last_message_sender: Option<String>,
    last_message_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ConversationRow {
    const COLUMNS: &'static str = "id, participant_a, participant_b, context_product, context_subject, \
         last_message_preview, last_message_sender, last_message_at, created_at, updated_at";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            participant_a: row.get(1)?,
            participant_b: row.get(2)?,
            context_product: row.get(3)?,
            context_subject: row.get(4)?,
            last_message_preview: row.get(5)?,
            last_message_sender: row.get(6)?,
            last_message_at: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_conversation(self) -> Result<Conversation, StoreError> {
        let context = match (self.context_product, self.context_subject) {
            (Some(product_id), subject) => Some(ChatContext {
                product_id,
                subject: subject.unwrap_or_default(),
            }),
            (None, _) => None,
        };
        Ok(Conversation {
            id: self.id,
            participants: [self.participant_a, self.participant_b],
            context,
            last_message_preview: self.last_message_preview,
            last_message_sender: self.last_message_sender,
            last_message_at: self.last_message_at.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

/// Stored with microsecond precision; callers truncate first so values read
/// back compare equal to the ones returned.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    parse_rfc3339(raw).ok_or_else(|| StoreError::Backend(format!("invalid timestamp {raw}")))
}

impl SqliteStore {
    fn new(path: &str, limits: StoreLimits) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                participant_a TEXT NOT NULL,
                participant_b TEXT NOT NULL,
                context_product TEXT,
                context_subject TEXT,
                last_message_preview TEXT NOT NULL DEFAULT '',
                last_message_sender TEXT,
                last_message_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (participant_a, participant_b)
            );
            CREATE INDEX IF NOT EXISTS conversations_by_a ON conversations(participant_a);
            CREATE INDEX IF NOT EXISTS conversations_by_b ON conversations(participant_b);
            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                conversation_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                text TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS messages_by_conversation ON messages(conversation_id, seq);
            CREATE TABLE IF NOT EXISTS message_reads (
                message_id TEXT NOT NULL,
                principal TEXT NOT NULL,
                PRIMARY KEY (message_id, principal)
            );
            ",
        )?;
        Ok(Self { conn, limits })
    }

    fn load(conn: &Connection, id: &str) -> Result<Option<Conversation>, StoreError> {
        let sql = format!(
            "SELECT {} FROM conversations WHERE id = ?1",
            ConversationRow::COLUMNS
        );
        conn.query_row(&sql, params![id], ConversationRow::from_row)
            .optional()?
            .map(ConversationRow::into_conversation)
            .transpose()
    }

    fn load_member(conn: &Connection, id: &str, principal: &str) -> Result<Conversation, StoreError> {
        let conv = Self::load(conn, id)?.ok_or(StoreError::NotFound)?;
        if !conv.has_participant(principal) {
            return Err(StoreError::Forbidden);
        }
        Ok(conv)
    }

    fn unread(conn: &Connection, id: &str, principal: &str) -> Result<u64, StoreError> {
        let count: i64 = conn.query_row(
            "
            SELECT COUNT(*) FROM messages m
            WHERE m.conversation_id = ?1
              AND m.sender != ?2
              AND NOT EXISTS (
                  SELECT 1 FROM message_reads r
                  WHERE r.message_id = m.id AND r.principal = ?2
              )
            ",
            params![id, principal],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn get(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        Self::load(&self.conn, id)
    }

    fn get_or_create(
        &mut self,
        a: &str,
        b: &str,
        context: Option<ChatContext>,
        now: DateTime<Utc>,
    ) -> Result<Conversation, StoreError> {
        let [first, second] = pair_key(a, b);
        let tx = self.conn.transaction()?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM conversations WHERE participant_a = ?1 AND participant_b = ?2",
                params![first, second],
                |row| row.get(0),
            )
            .optional()?;

        let id = match existing {
            Some(id) => {
                if let Some(ctx) = &context {
                    tx.execute(
                        "
                        UPDATE conversations SET context_product = ?2, context_subject = ?3
                        WHERE id = ?1 AND context_product IS NULL
                        ",
                        params![id, ctx.product_id, ctx.subject],
                    )?;
                }
                id
            }
            None => {
                let id = new_id("chat");
                let ts = format_ts(now.trunc_subsecs(6));
                tx.execute(
                    "
                    INSERT INTO conversations
                    (id, participant_a, participant_b, context_product, context_subject,
                     last_message_preview, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, '', ?6, ?6)
                    ",
                    params![
                        id,
                        first,
                        second,
                        context.as_ref().map(|c| c.product_id.as_str()),
                        context.as_ref().map(|c| c.subject.as_str()),
                        ts
                    ],
                )?;
                id
            }
        };
        let conv = Self::load(&tx, &id)?.ok_or(StoreError::NotFound)?;
        tx.commit()?;
        Ok(conv)
    }

    fn list_for(&self, principal: &str) -> Result<Vec<Conversation>, StoreError> {
        let sql = format!(
            "SELECT {} FROM conversations WHERE participant_a = ?1 OR participant_b = ?1",
            ConversationRow::COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![principal], ConversationRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(ConversationRow::into_conversation)
            .collect()
    }

    fn stats(&self, id: &str, principal: &str) -> Result<ThreadStats, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(ThreadStats {
            message_count: count as usize,
            unread_count: Self::unread(&self.conn, id, principal)?,
        })
    }

    fn append_message(
        &mut self,
        id: &str,
        sender: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<(Conversation, StoredMessage), StoreError> {
        let limits = self.limits;
        let tx = self.conn.transaction()?;
        let mut conv = Self::load_member(&tx, id, sender)?;
        let text = normalize_message_text(text, limits.max_text_len)?;

        let message = StoredMessage {
            id: new_id("msg"),
            sender: sender.to_string(),
            text,
            read_by: vec![sender.to_string()],
            created_at: append_time(&conv, now.trunc_subsecs(6)),
        };
        tx.execute(
            "INSERT INTO messages (id, conversation_id, sender, text, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![message.id, id, message.sender, message.text, format_ts(message.created_at)],
        )?;
        tx.execute(
            "INSERT INTO message_reads (message_id, principal) VALUES (?1, ?2)",
            params![message.id, message.sender],
        )?;
        Self::truncate(&tx, id, limits.max_messages)?;

        apply_append(&mut conv, &message, limits.preview_len);
        tx.execute(
            "
            UPDATE conversations SET
                last_message_preview = ?2,
                last_message_sender = ?3,
                last_message_at = ?4,
                updated_at = ?4
            WHERE id = ?1
            ",
            params![
                id,
                conv.last_message_preview,
                conv.last_message_sender,
                format_ts(message.created_at)
            ],
        )?;
        tx.commit()?;
        Ok((conv, message))
    }

    fn truncate(tx: &Transaction<'_>, id: &str, max_messages: usize) -> Result<(), StoreError> {
        let keep = max_messages as i64;
        tx.execute(
            "
            DELETE FROM message_reads WHERE message_id IN (
                SELECT id FROM messages
                WHERE conversation_id = ?1
                  AND seq NOT IN (
                      SELECT seq FROM messages WHERE conversation_id = ?1
                      ORDER BY seq DESC LIMIT ?2
                  )
            )
            ",
            params![id, keep],
        )?;
        tx.execute(
            "
            DELETE FROM messages
            WHERE conversation_id = ?1
              AND seq NOT IN (
                  SELECT seq FROM messages WHERE conversation_id = ?1
                  ORDER BY seq DESC LIMIT ?2
              )
            ",
            params![id, keep],
        )?;
        Ok(())
    }

    fn list_page(&self, id: &str, page: u32, limit: u32) -> Result<MessagePage, StoreError> {
        if Self::load(&self.conn, id)?.is_none() {
            return Err(StoreError::NotFound);
        }
        let total: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        let total = total as usize;
        let window = page_window(total, page, limit);

        let mut stmt = self.conn.prepare(
            "
            SELECT id, sender, text, created_at FROM messages
            WHERE conversation_id = ?1
            ORDER BY seq ASC
            LIMIT ?2 OFFSET ?3
            ",
        )?;
        let rows = stmt
            .query_map(
                params![id, window.len() as i64, window.start as i64],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let mut reads = self.conn.prepare(
            "SELECT principal FROM message_reads WHERE message_id = ?1 ORDER BY rowid",
        )?;
        let mut messages = Vec::with_capacity(rows.len());
        for (message_id, sender, text, created_at) in rows {
            let read_by = reads
                .query_map(params![message_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            messages.push(StoredMessage {
                id: message_id,
                sender,
                text,
                read_by,
                created_at: parse_ts(&created_at)?,
            });
        }

        Ok(MessagePage {
            messages,
            has_more: window.has_more,
            total,
        })
    }

    fn mark_read(&mut self, id: &str, principal: &str) -> Result<u64, StoreError> {
        let tx = self.conn.transaction()?;
        Self::load_member(&tx, id, principal)?;
        tx.execute(
            "
            INSERT OR IGNORE INTO message_reads (message_id, principal)
            SELECT id, ?2 FROM messages
            WHERE conversation_id = ?1 AND sender != ?2
            ",
            params![id, principal],
        )?;
        let unread = Self::unread(&tx, id, principal)?;
        tx.commit()?;
        Ok(unread)
    }
}

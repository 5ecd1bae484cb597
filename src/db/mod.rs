pub mod models;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use models::{derive_title, Chat, ChatMessage, NewMessage, Role, SourceMap, DEFAULT_CHAT_TITLE};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("Database connection poisoned")]
    Poisoned,
}

/// Persistence surface the chat session writes through.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// All chats, most recently updated first.
    async fn get_chats(&self) -> Result<Vec<Chat>, StoreError>;

    async fn get_chat_by_id(&self, id: &str) -> Result<Option<Chat>, StoreError>;

    async fn create_chat(&self) -> Result<Chat, StoreError>;

    /// Overwrites title, model and the full message sequence; bumps `updated_at`.
    async fn update_chat(&self, chat: &Chat) -> Result<Chat, StoreError>;

    /// Returns `false` when no chat had this id.
    async fn delete_chat(&self, id: &str) -> Result<bool, StoreError>;

    /// Appends a message. Returns `None` when the trimmed content is empty or
    /// the chat does not exist.
    async fn add_message_to_chat(
        &self,
        chat_id: &str,
        message: NewMessage,
    ) -> Result<Option<Chat>, StoreError>;
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(app_dir: &std::path::Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(app_dir).ok();
        let db_path = app_dir.join("ai-chat.db");
        let conn = Connection::open(db_path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                model TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                model TEXT,
                provider TEXT,
                duration_ms INTEGER,
                thinking TEXT,
                thinking_duration_ms INTEGER,
                sources TEXT,
                FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id, position);

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ── Chats ──

    fn load_chat(conn: &Connection, id: &str) -> Result<Option<Chat>, StoreError> {
        let header = conn
            .query_row(
                "SELECT id, title, model, created_at, updated_at FROM chats WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, title, model, created_at, updated_at)) = header else {
            return Ok(None);
        };

        Ok(Some(Chat {
            messages: Self::load_messages(conn, &id)?,
            id,
            title,
            model,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
        }))
    }

    fn load_messages(conn: &Connection, chat_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id, role, content, created_at, model, provider, duration_ms, thinking,
                    thinking_duration_ms, sources
             FROM messages WHERE chat_id = ?1 ORDER BY position ASC",
        )?;
        let rows = stmt.query_map(params![chat_id], MessageRow::from_row)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?.into_message()?);
        }
        Ok(messages)
    }

    fn insert_message(
        conn: &Connection,
        chat_id: &str,
        position: i64,
        message: &ChatMessage,
    ) -> Result<(), StoreError> {
        let sources = message
            .sources
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "INSERT INTO messages (id, chat_id, position, role, content, created_at, model, provider,
                                   duration_ms, thinking, thinking_duration_ms, sources)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                message.id,
                chat_id,
                position,
                message.role.as_str(),
                message.content,
                format_timestamp(&message.created_at),
                message.model,
                message.provider,
                message.duration.map(|d| d as i64),
                message.thinking,
                message.thinking_duration.map(|d| d as i64),
                sources,
            ],
        )?;
        Ok(())
    }

    // ── Settings ──

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }
}

#[async_trait]
impl ChatStore for Database {
    async fn get_chats(&self) -> Result<Vec<Chat>, StoreError> {
        let conn = self.conn()?;
        let ids: Vec<String> = {
            let mut stmt = conn.prepare("SELECT id FROM chats ORDER BY updated_at DESC")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        let mut chats = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(chat) = Self::load_chat(&conn, &id)? {
                chats.push(chat);
            }
        }
        Ok(chats)
    }

    async fn get_chat_by_id(&self, id: &str) -> Result<Option<Chat>, StoreError> {
        let conn = self.conn()?;
        Self::load_chat(&conn, id)
    }

    async fn create_chat(&self) -> Result<Chat, StoreError> {
        let conn = self.conn()?;
        let now = Utc::now();
        let chat = Chat {
            id: uuid::Uuid::new_v4().to_string(),
            title: DEFAULT_CHAT_TITLE.to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            model: None,
        };
        conn.execute(
            "INSERT INTO chats (id, title, model, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                chat.id,
                chat.title,
                chat.model,
                format_timestamp(&now),
                format_timestamp(&now)
            ],
        )?;
        Ok(chat)
    }

    async fn update_chat(&self, chat: &Chat) -> Result<Chat, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE chats SET title = ?1, model = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                chat.title,
                chat.model,
                format_timestamp(&Utc::now()),
                chat.id
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::Corrupt(format!("chat {} does not exist", chat.id)));
        }
        tx.execute("DELETE FROM messages WHERE chat_id = ?1", params![chat.id])?;
        for (position, message) in chat.messages.iter().enumerate() {
            Self::insert_message(&tx, &chat.id, position as i64, message)?;
        }
        tx.commit()?;

        Self::load_chat(&conn, &chat.id)?
            .ok_or_else(|| StoreError::Corrupt(format!("chat {} vanished on update", chat.id)))
    }

    async fn delete_chat(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM chats WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    async fn add_message_to_chat(
        &self,
        chat_id: &str,
        message: NewMessage,
    ) -> Result<Option<Chat>, StoreError> {
        if message.content.trim().is_empty() {
            return Ok(None);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let Some((title, next_position)) = tx
            .query_row(
                "SELECT title, (SELECT COALESCE(MAX(position) + 1, 0) FROM messages WHERE chat_id = ?1)
                 FROM chats WHERE id = ?1",
                params![chat_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?
        else {
            return Ok(None);
        };

        let now = Utc::now();
        let stored = ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            role: message.role,
            content: message.content,
            created_at: now,
            model: message.model,
            provider: message.provider,
            duration: message.duration,
            thinking: message.thinking,
            thinking_duration: message.thinking_duration,
            sources: message.sources,
        };
        Self::insert_message(&tx, chat_id, next_position, &stored)?;

        let title = if title == DEFAULT_CHAT_TITLE && stored.role == Role::User {
            derive_title(&stored.content)
        } else {
            title
        };
        // Touch chat updated_at
        tx.execute(
            "UPDATE chats SET title = ?1, model = COALESCE(?2, model), updated_at = ?3 WHERE id = ?4",
            params![title, stored.model, format_timestamp(&now), chat_id],
        )?;
        tx.commit()?;

        Self::load_chat(&conn, chat_id)
    }
}

struct MessageRow {
    id: String,
    role: String,
    content: String,
    created_at: String,
    model: Option<String>,
    provider: Option<String>,
    duration_ms: Option<i64>,
    thinking: Option<String>,
    thinking_duration_ms: Option<i64>,
    sources: Option<String>,
}

impl MessageRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            role: row.get(1)?,
            content: row.get(2)?,
            created_at: row.get(3)?,
            model: row.get(4)?,
            provider: row.get(5)?,
            duration_ms: row.get(6)?,
            thinking: row.get(7)?,
            thinking_duration_ms: row.get(8)?,
            sources: row.get(9)?,
        })
    }

    fn into_message(self) -> Result<ChatMessage, StoreError> {
        let role: Role = self.role.parse().map_err(StoreError::Corrupt)?;
        let sources = self
            .sources
            .as_deref()
            .map(serde_json::from_str::<SourceMap>)
            .transpose()?;
        Ok(ChatMessage {
            id: self.id,
            role,
            content: self.content,
            created_at: parse_timestamp(&self.created_at)?,
            model: self.model,
            provider: self.provider,
            duration: self.duration_ms.map(|d| d.max(0) as u64),
            thinking: self.thinking,
            thinking_duration: self.thinking_duration_ms.map(|d| d.max(0) as u64),
            sources,
        })
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {:?}: {}", raw, e)))
}

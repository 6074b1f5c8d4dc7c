use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::ChatError;
use crate::messages::{Message, MessageKind};

const DEFAULT_PAGE: usize = 500;

#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub topic: Option<String>,
    pub since: Option<i64>,
    pub limit: Option<usize>,
}

/// SQLite store for messages, users and topic subscriptions.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ChatError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, ChatError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, ChatError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                type TEXT NOT NULL,
                sender TEXT NOT NULL,
                recipient TEXT,
                topic TEXT,
                content TEXT,
                file_url TEXT,
                file_name TEXT,
                timestamp INTEGER NOT NULL,
                delivered INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
            CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            );
            CREATE TABLE IF NOT EXISTS subscriptions (
                username TEXT NOT NULL,
                topic TEXT NOT NULL,
                PRIMARY KEY (username, topic)
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, ChatError> {
        self.conn.lock().map_err(|_| ChatError::StorePoisoned)
    }

    // ========== Messages ==========

    /// Stores a message once; a second save of the same id is ignored.
    /// Returns whether a row was written.
    pub fn save_message(&self, msg: &Message, delivered: bool) -> Result<bool, ChatError> {
        let conn = self.conn()?;
        let written = conn.execute(
            "INSERT OR IGNORE INTO messages
                (id, type, sender, recipient, topic, content,
                 file_url, file_name, timestamp, delivered)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                msg.id,
                msg.kind.as_str(),
                msg.sender,
                msg.recipient,
                msg.topic,
                msg.content,
                msg.file_url,
                msg.file_name,
                msg.timestamp,
                delivered,
            ],
        )?;
        Ok(written > 0)
    }

    pub fn messages(&self, filter: &MessageFilter) -> Result<Vec<Message>, ChatError> {
        let conn = self.conn()?;
        let limit = i64::try_from(filter.limit.unwrap_or(DEFAULT_PAGE)).unwrap_or(i64::MAX);
        // Newest page first, then flipped so callers read oldest to newest.
        let mut stmt = conn.prepare(
            "SELECT id, type, sender, recipient, topic, content, file_url, file_name, timestamp
             FROM messages
             WHERE (?1 IS NULL OR topic = ?1) AND (?2 IS NULL OR timestamp > ?2)
             ORDER BY timestamp DESC, seq DESC
             LIMIT ?3",
        )?;
        let mut messages = stmt
            .query_map(params![filter.topic, filter.since, limit], message_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    pub fn undelivered(&self) -> Result<Vec<Message>, ChatError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, type, sender, recipient, topic, content, file_url, file_name, timestamp
             FROM messages
             WHERE delivered = 0
             ORDER BY seq ASC",
        )?;
        let messages = stmt
            .query_map([], message_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    pub fn mark_delivered(&self, id: &str) -> Result<(), ChatError> {
        let conn = self.conn()?;
        conn.execute("UPDATE messages SET delivered = 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ========== Users ==========

    /// Returns false when the name is already taken.
    pub fn create_user(&self, username: &str) -> Result<bool, ChatError> {
        let conn = self.conn()?;
        let written = conn.execute(
            "INSERT OR IGNORE INTO users (username) VALUES (?1)",
            params![username],
        )?;
        Ok(written > 0)
    }

    pub fn user_exists(&self, username: &str) -> Result<bool, ChatError> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM users WHERE username = ?1",
                params![username],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // ========== Subscriptions ==========

    pub fn save_subscription(&self, username: &str, topic: &str) -> Result<(), ChatError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO subscriptions (username, topic) VALUES (?1, ?2)",
            params![username, topic],
        )?;
        Ok(())
    }

    pub fn remove_subscription(&self, username: &str, topic: &str) -> Result<(), ChatError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM subscriptions WHERE username = ?1 AND topic = ?2",
            params![username, topic],
        )?;
        Ok(())
    }

    pub fn subscriptions(&self, username: &str) -> Result<Vec<String>, ChatError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT topic FROM subscriptions WHERE username = ?1 ORDER BY topic")?;
        let topics = stmt
            .query_map(params![username], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(topics)
    }
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let kind: String = row.get(1)?;
    let kind = MessageKind::parse(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown message type {kind:?}").into(),
        )
    })?;
    Ok(Message {
        id: row.get(0)?,
        kind,
        sender: row.get(2)?,
        recipient: row.get(3)?,
        topic: row.get(4)?,
        content: row.get(5)?,
        file_url: row.get(6)?,
        file_name: row.get(7)?,
        timestamp: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamped(mut msg: Message, ts: i64) -> Message {
        msg.stamp(ts);
        msg
    }

    #[test]
    fn saves_and_lists_in_time_order() {
        let store = Store::in_memory().unwrap();
        let late = stamped(Message::chat("alice", "second"), 20);
        let early = stamped(Message::chat("bob", "first").with_topic("rust"), 10);
        assert!(store.save_message(&late, true).unwrap());
        assert!(store.save_message(&early, true).unwrap());
        assert!(!store.save_message(&early, true).unwrap());

        let all = store.messages(&MessageFilter::default()).unwrap();
        assert_eq!(all, vec![early.clone(), late.clone()]);

        let rust = store
            .messages(&MessageFilter {
                topic: Some("rust".to_string()),
                ..MessageFilter::default()
            })
            .unwrap();
        assert_eq!(rust, vec![early]);

        let recent = store
            .messages(&MessageFilter {
                since: Some(10),
                ..MessageFilter::default()
            })
            .unwrap();
        assert_eq!(recent, vec![late]);
    }

    #[test]
    fn limit_keeps_the_newest() {
        let store = Store::in_memory().unwrap();
        for i in 0..5 {
            store
                .save_message(&stamped(Message::chat("a", format!("m{i}")), i), true)
                .unwrap();
        }
        let page = store
            .messages(&MessageFilter {
                limit: Some(2),
                ..MessageFilter::default()
            })
            .unwrap();
        let bodies: Vec<_> = page.iter().filter_map(|m| m.content.as_deref()).collect();
        assert_eq!(bodies, vec!["m3", "m4"]);
    }

    #[test]
    fn undelivered_until_marked() {
        let store = Store::in_memory().unwrap();
        let pending = stamped(Message::chat("a", "queued"), 1);
        store.save_message(&pending, false).unwrap();
        store
            .save_message(&stamped(Message::chat("a", "sent"), 2), true)
            .unwrap();

        assert_eq!(store.undelivered().unwrap(), vec![pending.clone()]);
        store.mark_delivered(&pending.id).unwrap();
        assert!(store.undelivered().unwrap().is_empty());
    }

    #[test]
    fn users_are_unique() {
        let store = Store::in_memory().unwrap();
        assert!(!store.user_exists("alice").unwrap());
        assert!(store.create_user("alice").unwrap());
        assert!(!store.create_user("alice").unwrap());
        assert!(store.user_exists("alice").unwrap());
    }

    #[test]
    fn subscriptions_round_trip_per_user() {
        let store = Store::in_memory().unwrap();
        store.save_subscription("alice", "rust").unwrap();
        store.save_subscription("alice", "go").unwrap();
        store.save_subscription("alice", "rust").unwrap();
        store.save_subscription("bob", "zig").unwrap();

        assert_eq!(store.subscriptions("alice").unwrap(), vec!["go", "rust"]);
        store.remove_subscription("alice", "go").unwrap();
        assert_eq!(store.subscriptions("alice").unwrap(), vec!["rust"]);
        assert_eq!(store.subscriptions("bob").unwrap(), vec!["zig"]);
    }

    #[test]
    fn opens_file_database_in_nested_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("databases").join("alice.db");
        {
            let store = Store::open(&path).unwrap();
            store.create_user("alice").unwrap();
        }
        let reopened = Store::open(&path).unwrap();
        assert!(reopened.user_exists("alice").unwrap());
    }
}

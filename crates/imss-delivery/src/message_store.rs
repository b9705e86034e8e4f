use sqlx::SqlitePool;
use thiserror::Error;

use imss_protocol::{Message, MessageStatus, MessageType};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// SQLite-backed message archive, modeled directly on `message_log_store.rs`'s
/// `SqliteMessageLog`: a `sqlx::SqlitePool`, a schema with a `UNIQUE` index
/// providing idempotent inserts, and `#[doc(hidden)] init()` retained for
/// tests that run against an in-memory database rather than migrations.
pub struct SqlMessageStore {
    pool: SqlitePool,
}

impl SqlMessageStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates the `messages` table schema.
    ///
    /// **Deprecated**: schema is managed by `sqlx` migrations in a real
    /// deployment; retained for tests against `sqlite::memory:`.
    #[doc(hidden)]
    pub async fn init(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                message_id      INTEGER NOT NULL,
                sender          INTEGER NOT NULL,
                recipient       INTEGER NOT NULL,
                group_id        INTEGER NOT NULL,
                content         TEXT    NOT NULL,
                message_type    INTEGER NOT NULL,
                timestamp_unix  INTEGER NOT NULL,
                status          TEXT    NOT NULL,
                created_at      INTEGER NOT NULL,
                updated_at      INTEGER NOT NULL,
                UNIQUE (message_id)
            )",
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Optimistic insert; a unique-constraint violation on `message_id` is
    /// treated as success (idempotent archival, §4.9/property 2).
    ///
    /// # Errors
    /// Returns [`StoreError::Sql`] for any other database error.
    pub async fn insert_if_absent(&self, message: &Message) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO messages
             (message_id, sender, recipient, group_id, content, message_type,
              timestamp_unix, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message.message_id)
        .bind(message.from)
        .bind(message.to)
        .bind(message.group_id)
        .bind(&message.content)
        .bind(i32::from(message.message_type))
        .bind(message.timestamp_unix)
        .bind(status_str(message.status))
        .bind(message.created_at)
        .bind(message.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(ref db_err)) if db_err.kind() == sqlx::error::ErrorKind::UniqueViolation => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Page of history for a private conversation (`group_id == 0`) or a
    /// group conversation, newest first. Used to back
    /// `Message.GetHistoryMessages`.
    ///
    /// # Errors
    /// Returns [`StoreError::Sql`] on a database error.
    pub async fn history(&self, user_id: i64, group_id: i64, page: u32, size: u32) -> Result<(Vec<Message>, u64)> {
        let offset = i64::from(page) * i64::from(size);
        let rows: Vec<(i64, i64, i64, i64, String, i32, i64, String, i64, i64)> = if group_id == 0 {
            sqlx::query_as(
                "SELECT message_id, sender, recipient, group_id, content, message_type,
                        timestamp_unix, status, created_at, updated_at
                 FROM messages
                 WHERE group_id = 0 AND (sender = ? OR recipient = ?)
                 ORDER BY message_id DESC LIMIT ? OFFSET ?",
            )
            .bind(user_id)
            .bind(user_id)
            .bind(i64::from(size))
            .bind(offset)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                "SELECT message_id, sender, recipient, group_id, content, message_type,
                        timestamp_unix, status, created_at, updated_at
                 FROM messages
                 WHERE group_id = ?
                 ORDER BY message_id DESC LIMIT ? OFFSET ?",
            )
            .bind(group_id)
            .bind(i64::from(size))
            .bind(offset)
            .fetch_all(&self.pool)
            .await?
        };

        let total: (i64,) = if group_id == 0 {
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE group_id = 0 AND (sender = ? OR recipient = ?)")
                .bind(user_id)
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?
        } else {
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE group_id = ?").bind(group_id).fetch_one(&self.pool).await?
        };

        let messages = rows.into_iter().map(row_to_message).collect();
        Ok((messages, total.0 as u64))
    }
}

fn status_str(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Sent => "sent",
        MessageStatus::Delivered => "delivered",
        MessageStatus::Read => "read",
        MessageStatus::Revoked => "revoked",
    }
}

fn status_from_str(s: &str) -> MessageStatus {
    match s {
        "delivered" => MessageStatus::Delivered,
        "read" => MessageStatus::Read,
        "revoked" => MessageStatus::Revoked,
        _ => MessageStatus::Sent,
    }
}

fn row_to_message(row: (i64, i64, i64, i64, String, i32, i64, String, i64, i64)) -> Message {
    Message {
        message_id: row.0,
        from: row.1,
        to: row.2,
        group_id: row.3,
        content: row.4,
        message_type: MessageType::try_from(row.5).unwrap_or(MessageType::Unknown(row.5)),
        timestamp_unix: row.6,
        status: status_from_str(&row.7),
        created_at: row.8,
        updated_at: row.9,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.expect("in-memory sqlite");
        SqlMessageStore::init(&pool).await.expect("schema");
        pool
    }

    fn sample_entry(message_id: i64) -> Message {
        Message {
            message_id,
            from: 1,
            to: 2,
            group_id: 0,
            content: "hi".to_string(),
            message_type: MessageType::Text,
            timestamp_unix: 1_000,
            status: MessageStatus::Sent,
            created_at: 1_000,
            updated_at: 1_000,
        }
    }

    #[tokio::test]
    async fn insert_then_duplicate_is_idempotent() {
        let pool = test_pool().await;
        let store = SqlMessageStore::new(pool);
        store.insert_if_absent(&sample_entry(1)).await.unwrap();
        store.insert_if_absent(&sample_entry(1)).await.unwrap();

        let (messages, total) = store.history(2, 0, 0, 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn history_is_newest_first_and_paginated() {
        let pool = test_pool().await;
        let store = SqlMessageStore::new(pool);
        for id in 1..=3 {
            store.insert_if_absent(&sample_entry(id)).await.unwrap();
        }
        let (messages, total) = store.history(2, 0, 0, 2).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(messages.iter().map(|m| m.message_id).collect::<Vec<_>>(), vec![3, 2]);
    }

    #[tokio::test]
    async fn group_history_filters_by_group_id() {
        let pool = test_pool().await;
        let store = SqlMessageStore::new(pool);
        let mut group_msg = sample_entry(10);
        group_msg.to = 0;
        group_msg.group_id = 99;
        store.insert_if_absent(&group_msg).await.unwrap();
        store.insert_if_absent(&sample_entry(11)).await.unwrap();

        let (messages, total) = store.history(0, 99, 0, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(messages[0].message_id, 10);
    }
}

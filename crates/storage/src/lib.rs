use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

use shared::domain::{
    ConversationId, ConversationKind, MessageKind, RemoteMessageId, SessionId, SyncCursor, UserId,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub id: UserId,
    pub first_name: String,
    pub last_name: String,
    pub username: String,
    pub phone: String,
    pub is_active: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl UserRecord {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub user_id: UserId,
    /// `None` when the stored kind is not recognised (legacy rows).
    pub kind: Option<ConversationKind>,
    pub title: String,
    pub username: String,
    pub avatar_url: String,
    pub access_hash: Option<String>,
    pub last_message: String,
    pub last_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    pub remote_message_id: RemoteMessageId,
    pub sender_id: i64,
    pub sender_username: String,
    pub sender_display_name: String,
    pub body: String,
    pub kind: MessageKind,
    pub media_url: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: i64,
    pub record: MessageRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub id: SessionId,
    pub user_id: Option<UserId>,
    pub app_id: i64,
    pub app_hash: String,
    pub phone: String,
    pub session_data: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAuthSession {
    pub user_id: Option<UserId>,
    pub app_id: i64,
    pub app_hash: String,
    pub phone: String,
    pub session_data: String,
    pub is_active: bool,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(false);
        // Every pooled connection to `sqlite::memory:` would open its own empty
        // database, so in-memory stores are pinned to one long-lived connection.
        let pool_options = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run storage migrations")?;
        debug!(%database_url, "storage ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn upsert_user(&self, user: &UserRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, first_name, last_name, username, phone, is_active, last_sync_time)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                username = excluded.username,
                phone = excluded.phone,
                is_active = excluded.is_active,
                last_sync_time = COALESCE(excluded.last_sync_time, users.last_sync_time),
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(user.id.0)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.username)
        .bind(&user.phone)
        .bind(user.is_active)
        .bind(user.last_sync_time)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert user {}", user.id))?;
        Ok(())
    }

    pub async fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>> {
        let row = sqlx::query(
            "SELECT id, first_name, last_name, username, phone, is_active, last_sync_time
             FROM users WHERE id = ?",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(user_from_row))
    }

    /// Users ordered by most recently touched first.
    pub async fn list_users(&self) -> Result<Vec<UserRecord>> {
        let rows = sqlx::query(
            "SELECT id, first_name, last_name, username, phone, is_active, last_sync_time
             FROM users ORDER BY updated_at DESC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(user_from_row).collect())
    }

    pub async fn list_active_users(&self) -> Result<Vec<UserRecord>> {
        let rows = sqlx::query(
            "SELECT id, first_name, last_name, username, phone, is_active, last_sync_time
             FROM users WHERE is_active = 1 ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(user_from_row).collect())
    }

    pub async fn set_user_active(&self, user_id: UserId, active: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET is_active = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(active)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_user_synced(&self, user_id: UserId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE users SET last_sync_time = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(at)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Inserts or refreshes a conversation. A previously learned access hash is
    /// kept when the incoming record has none.
    pub async fn upsert_conversation(&self, conversation: &ConversationRecord) -> Result<()> {
        let kind = conversation
            .kind
            .map(ConversationKind::as_str)
            .unwrap_or("unknown");
        sqlx::query(
            "INSERT INTO conversations (user_id, id, kind, title, username, avatar_url, access_hash, last_message, last_time)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, id) DO UPDATE SET
                kind = excluded.kind,
                title = excluded.title,
                username = excluded.username,
                avatar_url = excluded.avatar_url,
                access_hash = COALESCE(excluded.access_hash, conversations.access_hash),
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(conversation.user_id.0)
        .bind(conversation.id.0)
        .bind(kind)
        .bind(&conversation.title)
        .bind(&conversation.username)
        .bind(&conversation.avatar_url)
        .bind(conversation.access_hash.as_deref())
        .bind(&conversation.last_message)
        .bind(conversation.last_time)
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "failed to upsert conversation {} for user {}",
                conversation.id, conversation.user_id
            )
        })?;
        Ok(())
    }

    /// Moves the conversation preview forward; older messages never replace a
    /// newer preview.
    pub async fn update_conversation_preview(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        preview: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE conversations
             SET last_message = ?, last_time = ?, updated_at = CURRENT_TIMESTAMP
             WHERE user_id = ? AND id = ? AND (last_time IS NULL OR last_time <= ?)",
        )
        .bind(preview)
        .bind(at)
        .bind(user_id.0)
        .bind(conversation_id.0)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_conversation(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<Option<ConversationRecord>> {
        let row = sqlx::query(
            "SELECT id, user_id, kind, title, username, avatar_url, access_hash, last_message, last_time
             FROM conversations WHERE user_id = ? AND id = ?",
        )
        .bind(user_id.0)
        .bind(conversation_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(conversation_from_row))
    }

    pub async fn list_conversations(&self, user_id: UserId) -> Result<Vec<ConversationRecord>> {
        let rows = sqlx::query(
            "SELECT id, user_id, kind, title, username, avatar_url, access_hash, last_message, last_time
             FROM conversations WHERE user_id = ?
             ORDER BY last_time IS NULL, last_time DESC, id ASC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(conversation_from_row).collect())
    }

    /// Idempotent on (user, conversation, remote message id); returns the
    /// surrogate row id, which stays stable across repeated upserts.
    pub async fn upsert_message(&self, message: &MessageRecord) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO messages (user_id, conversation_id, remote_message_id, sender_id, sender_username,
                sender_display_name, body, kind, media_url, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, conversation_id, remote_message_id) DO UPDATE SET
                sender_id = excluded.sender_id,
                sender_username = excluded.sender_username,
                sender_display_name = excluded.sender_display_name,
                body = excluded.body,
                kind = excluded.kind,
                media_url = excluded.media_url,
                timestamp = excluded.timestamp
             RETURNING id",
        )
        .bind(message.user_id.0)
        .bind(message.conversation_id.0)
        .bind(message.remote_message_id.0)
        .bind(message.sender_id)
        .bind(&message.sender_username)
        .bind(&message.sender_display_name)
        .bind(&message.body)
        .bind(message.kind.as_str())
        .bind(&message.media_url)
        .bind(message.timestamp)
        .fetch_one(&self.pool)
        .await
        .with_context(|| {
            format!(
                "failed to upsert message {} in conversation {}",
                message.remote_message_id, message.conversation_id
            )
        })?;
        Ok(id)
    }

    /// Highest remote message id stored for the conversation.
    pub async fn max_remote_message_id(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<Option<RemoteMessageId>> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(remote_message_id) FROM messages WHERE user_id = ? AND conversation_id = ?",
        )
        .bind(user_id.0)
        .bind(conversation_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(max.map(RemoteMessageId))
    }

    pub async fn count_messages(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<i64> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE user_id = ? AND conversation_id = ?",
        )
        .bind(user_id.0)
        .bind(conversation_id.0)
        .fetch_one(&self.pool)
        .await?)
    }

    /// Newest first.
    pub async fn list_messages(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT id, user_id, conversation_id, remote_message_id, sender_id, sender_username,
                    sender_display_name, body, kind, media_url, timestamp
             FROM messages
             WHERE user_id = ? AND conversation_id = ?
             ORDER BY timestamp DESC, remote_message_id DESC
             LIMIT ? OFFSET ?",
        )
        .bind(user_id.0)
        .bind(conversation_id.0)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    /// Returns the zero cursor when none has been stored yet.
    pub async fn get_sync_cursor(&self, user_id: UserId) -> Result<SyncCursor> {
        let row = sqlx::query("SELECT pts, qts, date, seq FROM sync_cursors WHERE user_id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|r| SyncCursor {
                pts: r.get::<i64, _>(0),
                qts: r.get::<i64, _>(1),
                date: r.get::<i64, _>(2),
                seq: r.get::<i64, _>(3),
            })
            .unwrap_or(SyncCursor::ZERO))
    }

    pub async fn set_sync_cursor(&self, user_id: UserId, cursor: &SyncCursor) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_cursors (user_id, pts, qts, date, seq)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                pts = excluded.pts,
                qts = excluded.qts,
                date = excluded.date,
                seq = excluded.seq,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(user_id.0)
        .bind(cursor.pts)
        .bind(cursor.qts)
        .bind(cursor.date)
        .bind(cursor.seq)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to store sync cursor for user {user_id}"))?;
        Ok(())
    }

    /// Explicit bootstrap reset: the next pass for this user lists everything again.
    pub async fn reset_sync_cursor(&self, user_id: UserId) -> Result<()> {
        self.set_sync_cursor(user_id, &SyncCursor::ZERO).await
    }

    pub async fn insert_auth_session(&self, session: &NewAuthSession) -> Result<SessionId> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO auth_sessions (user_id, app_id, app_hash, phone, session_data, is_active)
             VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(session.user_id.map(|u| u.0))
        .bind(session.app_id)
        .bind(&session.app_hash)
        .bind(&session.phone)
        .bind(&session.session_data)
        .bind(session.is_active)
        .fetch_one(&self.pool)
        .await?;
        Ok(SessionId(id))
    }

    /// The most recently touched active session, regardless of user.
    pub async fn latest_active_session(&self) -> Result<Option<AuthSession>> {
        let row = sqlx::query(
            "SELECT id, user_id, app_id, app_hash, phone, session_data, is_active
             FROM auth_sessions WHERE is_active = 1
             ORDER BY updated_at DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(session_from_row))
    }

    pub async fn active_session_for_user(&self, user_id: UserId) -> Result<Option<AuthSession>> {
        let row = sqlx::query(
            "SELECT id, user_id, app_id, app_hash, phone, session_data, is_active
             FROM auth_sessions WHERE user_id = ? AND is_active = 1
             ORDER BY updated_at DESC, id DESC LIMIT 1",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(session_from_row))
    }

    pub async fn link_session_user(&self, session_id: SessionId, user_id: UserId) -> Result<()> {
        sqlx::query(
            "UPDATE auth_sessions SET user_id = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(user_id.0)
        .bind(session_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn deactivate_sessions_for_user(&self, user_id: UserId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE auth_sessions SET is_active = 0, updated_at = CURRENT_TIMESTAMP
             WHERE user_id = ? AND is_active = 1",
        )
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn user_from_row(r: &SqliteRow) -> UserRecord {
    UserRecord {
        id: UserId(r.get::<i64, _>(0)),
        first_name: r.get::<String, _>(1),
        last_name: r.get::<String, _>(2),
        username: r.get::<String, _>(3),
        phone: r.get::<String, _>(4),
        is_active: r.get::<bool, _>(5),
        last_sync_time: r.get::<Option<DateTime<Utc>>, _>(6),
    }
}

fn conversation_from_row(r: &SqliteRow) -> ConversationRecord {
    ConversationRecord {
        id: ConversationId(r.get::<i64, _>(0)),
        user_id: UserId(r.get::<i64, _>(1)),
        kind: ConversationKind::parse_stored(&r.get::<String, _>(2)),
        title: r.get::<String, _>(3),
        username: r.get::<String, _>(4),
        avatar_url: r.get::<String, _>(5),
        access_hash: r
            .get::<Option<String>, _>(6)
            .filter(|hash| !hash.is_empty()),
        last_message: r.get::<String, _>(7),
        last_time: r.get::<Option<DateTime<Utc>>, _>(8),
    }
}

fn message_from_row(r: &SqliteRow) -> Result<StoredMessage> {
    let kind_name = r.get::<String, _>(8);
    let kind = kind_name
        .parse::<MessageKind>()
        .with_context(|| format!("stored message has unknown kind '{kind_name}'"))?;
    Ok(StoredMessage {
        id: r.get::<i64, _>(0),
        record: MessageRecord {
            user_id: UserId(r.get::<i64, _>(1)),
            conversation_id: ConversationId(r.get::<i64, _>(2)),
            remote_message_id: RemoteMessageId(r.get::<i64, _>(3)),
            sender_id: r.get::<i64, _>(4),
            sender_username: r.get::<String, _>(5),
            sender_display_name: r.get::<String, _>(6),
            body: r.get::<String, _>(7),
            kind,
            media_url: r.get::<String, _>(9),
            timestamp: r.get::<DateTime<Utc>, _>(10),
        },
    })
}

fn session_from_row(r: &SqliteRow) -> AuthSession {
    AuthSession {
        id: SessionId(r.get::<i64, _>(0)),
        user_id: r.get::<Option<i64>, _>(1).map(UserId),
        app_id: r.get::<i64, _>(2),
        app_hash: r.get::<String, _>(3),
        phone: r.get::<String, _>(4),
        session_data: r.get::<String, _>(5),
        is_active: r.get::<bool, _>(6),
    }
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

use chrono::{DateTime, Utc};

use super::{Db, Pool};
use crate::errors::{AppError, AppResult};
use crate::models::*;

const MESSAGE_COLUMNS: &str =
    "id, sender_id, receiver_id, content, attachment_url, timestamp, is_read";

const PRESENCE_COLUMNS: &str = "user_id, is_online, active_sessions, version, last_seen";

// ─── Users ─────────────────────────────────────────────

pub async fn create_user(
    pool: &Pool,
    username: &str,
    display_name: Option<&str>,
    password_hash: &str,
) -> AppResult<User> {
    let user = sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (username, display_name, password_hash, created_at)
        VALUES ($1, $2, $3, $4)
        RETURNING id, username, display_name, password_hash, created_at
        "#,
    )
    .bind(username)
    .bind(display_name)
    .bind(password_hash)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            AppError::UsernameTaken
        }
        other => AppError::Database(other),
    })?;

    Ok(user)
}

pub async fn find_user_by_username(pool: &Pool, username: &str) -> AppResult<Option<User>> {
    let user = sqlx::query_as::<_, User>(
        "SELECT id, username, display_name, password_hash, created_at
         FROM users WHERE LOWER(username) = LOWER($1)",
    )
    .bind(username)
    .fetch_optional(pool)
    .await?;
    Ok(user)
}

pub async fn find_user_by_id(pool: &Pool, id: i64) -> AppResult<Option<User>> {
    let user = sqlx::query_as::<_, User>(
        "SELECT id, username, display_name, password_hash, created_at FROM users WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(user)
}

/// Everyone except `user_id`, with presence and unread counts towards `user_id`.
pub async fn list_chat_contacts(pool: &Pool, user_id: i64) -> AppResult<Vec<ChatContact>> {
    let contacts = sqlx::query_as::<_, ChatContact>(
        r#"
        SELECT u.id, u.username, u.display_name,
               COALESCE(p.is_online, FALSE) AS is_online,
               p.last_seen AS last_seen,
               (SELECT COUNT(*) FROM messages m
                 WHERE m.sender_id = u.id AND m.receiver_id = $1 AND m.is_read = FALSE
               ) AS unread_count
        FROM users u
        LEFT JOIN presence_status p ON p.user_id = u.id
        WHERE u.id <> $1
        ORDER BY LOWER(u.username)
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(contacts)
}

// ─── Presence ──────────────────────────────────────────

/// Upsert the presence row with an explicit online flag. Going offline also
/// clears the session count.
pub async fn upsert_presence(
    pool: &Pool,
    user_id: i64,
    is_online: bool,
    now: DateTime<Utc>,
) -> AppResult<PresenceStatus> {
    let sql = format!(
        r#"
        INSERT INTO presence_status (user_id, is_online, active_sessions, version, last_seen)
        VALUES ($1, $2, 0, 1, $3)
        ON CONFLICT (user_id) DO UPDATE
        SET is_online = excluded.is_online,
            active_sessions = CASE WHEN excluded.is_online
                                   THEN presence_status.active_sessions ELSE 0 END,
            version = presence_status.version + 1,
            last_seen = excluded.last_seen
        RETURNING {PRESENCE_COLUMNS}
        "#
    );
    let status = sqlx::query_as::<_, PresenceStatus>(&sql)
        .bind(user_id)
        .bind(is_online)
        .bind(now)
        .fetch_one(pool)
        .await?;
    Ok(status)
}

/// Count one more open session and mark the user online.
pub async fn presence_session_opened(
    pool: &Pool,
    user_id: i64,
    now: DateTime<Utc>,
) -> AppResult<PresenceStatus> {
    let sql = format!(
        r#"
        INSERT INTO presence_status (user_id, is_online, active_sessions, version, last_seen)
        VALUES ($1, TRUE, 1, 1, $2)
        ON CONFLICT (user_id) DO UPDATE
        SET is_online = TRUE,
            active_sessions = presence_status.active_sessions + 1,
            version = presence_status.version + 1,
            last_seen = excluded.last_seen
        RETURNING {PRESENCE_COLUMNS}
        "#
    );
    let status = sqlx::query_as::<_, PresenceStatus>(&sql)
        .bind(user_id)
        .bind(now)
        .fetch_one(pool)
        .await?;
    Ok(status)
}

/// Count one session fewer; the user goes offline when none remain.
/// Never drops below zero.
pub async fn presence_session_closed(
    pool: &Pool,
    user_id: i64,
    now: DateTime<Utc>,
) -> AppResult<PresenceStatus> {
    let sql = format!(
        r#"
        INSERT INTO presence_status (user_id, is_online, active_sessions, version, last_seen)
        VALUES ($1, FALSE, 0, 1, $2)
        ON CONFLICT (user_id) DO UPDATE
        SET is_online = presence_status.active_sessions > 1,
            active_sessions = CASE WHEN presence_status.active_sessions > 0
                                   THEN presence_status.active_sessions - 1 ELSE 0 END,
            version = presence_status.version + 1,
            last_seen = excluded.last_seen
        RETURNING {PRESENCE_COLUMNS}
        "#
    );
    let status = sqlx::query_as::<_, PresenceStatus>(&sql)
        .bind(user_id)
        .bind(now)
        .fetch_one(pool)
        .await?;
    Ok(status)
}

pub async fn find_presence(pool: &Pool, user_id: i64) -> AppResult<Option<PresenceStatus>> {
    let sql = format!("SELECT {PRESENCE_COLUMNS} FROM presence_status WHERE user_id = $1");
    let status = sqlx::query_as::<_, PresenceStatus>(&sql)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(status)
}

pub async fn find_presences(pool: &Pool, user_ids: &[i64]) -> AppResult<Vec<PresenceStatus>> {
    if user_ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut qb = sqlx::QueryBuilder::<Db>::new(format!(
        "SELECT {PRESENCE_COLUMNS} FROM presence_status WHERE user_id IN ("
    ));
    let mut separated = qb.separated(", ");
    for id in user_ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");

    let rows = qb
        .build_query_as::<PresenceStatus>()
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Mark everyone offline. Run at startup: sessions from a previous process
/// are gone and never ran their close path.
pub async fn reset_presence(pool: &Pool) -> AppResult<u64> {
    let result = sqlx::query(
        "UPDATE presence_status
         SET is_online = FALSE, active_sessions = 0, version = version + 1
         WHERE is_online = TRUE OR active_sessions <> 0",
    )
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

// ─── Messages ──────────────────────────────────────────

pub async fn insert_message(pool: &Pool, msg: &NewMessage) -> AppResult<Message> {
    let sql = format!(
        r#"
        INSERT INTO messages (sender_id, receiver_id, content, attachment_url, timestamp, is_read)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {MESSAGE_COLUMNS}
        "#
    );
    let message = sqlx::query_as::<_, Message>(&sql)
        .bind(msg.sender_id)
        .bind(msg.receiver_id)
        .bind(&msg.content)
        .bind(msg.attachment_url.as_deref())
        .bind(msg.timestamp)
        .bind(msg.is_read)
        .fetch_one(pool)
        .await?;
    Ok(message)
}

/// Latest `limit` messages between `viewer_id` and `other_id` in ascending
/// order. In the same transaction every unread message from `other_id` to
/// `viewer_id` is flipped to read. Returns the page and the number of rows
/// flipped.
pub async fn get_conversation_and_mark_read(
    pool: &Pool,
    viewer_id: i64,
    other_id: i64,
    limit: i64,
) -> AppResult<(Vec<Message>, u64)> {
    let mut tx = pool.begin().await?;

    let marked = sqlx::query(
        "UPDATE messages SET is_read = TRUE
         WHERE sender_id = $1 AND receiver_id = $2 AND is_read = FALSE",
    )
    .bind(other_id)
    .bind(viewer_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let sql = format!(
        r#"
        SELECT {MESSAGE_COLUMNS}
        FROM messages
        WHERE (sender_id = $1 AND receiver_id = $2)
           OR (sender_id = $2 AND receiver_id = $1)
        ORDER BY timestamp DESC, id DESC
        LIMIT $3
        "#
    );
    let mut messages = sqlx::query_as::<_, Message>(&sql)
        .bind(viewer_id)
        .bind(other_id)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

    tx.commit().await?;

    messages.reverse();
    Ok((messages, marked))
}

/// Latest `limit` messages sent or received by `user_id` across every
/// conversation, oldest first. Read state is left alone.
pub async fn list_user_messages(pool: &Pool, user_id: i64, limit: i64) -> AppResult<Vec<Message>> {
    let sql = format!(
        r#"
        SELECT {MESSAGE_COLUMNS}
        FROM messages
        WHERE sender_id = $1 OR receiver_id = $1
        ORDER BY timestamp DESC, id DESC
        LIMIT $2
        "#
    );
    let mut messages = sqlx::query_as::<_, Message>(&sql)
        .bind(user_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    messages.reverse();
    Ok(messages)
}

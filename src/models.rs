use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

// ─── Pagination ────────────────────────────────────────

/// Number of messages returned by the conversation view when no limit is given.
pub const DEFAULT_HISTORY_LIMIT: i64 = 50;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

impl HistoryQuery {
    /// Returns clamped limit (default 50, max 100).
    pub fn resolve(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, 100)
    }
}

// ─── User ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub display_name: Option<String>,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPublic {
    pub id: i64,
    pub username: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserPublic {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            username: u.username,
            display_name: u.display_name,
            created_at: u.created_at,
        }
    }
}

/// The identity bound to a chat connection or API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatUser {
    pub id: i64,
    pub username: String,
}

impl From<&User> for ChatUser {
    fn from(u: &User) -> Self {
        Self {
            id: u.id,
            username: u.username.clone(),
        }
    }
}

// ─── Auth Requests / Responses ─────────────────────────

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(length(min = 1, max = 32, message = "Username must be 1-32 characters"))]
    #[validate(custom(function = "validate_username"))]
    pub username: String,

    #[validate(length(min = 8, max = 128, message = "Password must be 8-128 characters"))]
    pub password: String,

    #[validate(length(max = 64, message = "Display name is too long (max 64 characters)"))]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub user: UserPublic,
}

// ─── Presence ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnlineStatus {
    Online,
    Offline,
}

impl From<bool> for OnlineStatus {
    fn from(is_online: bool) -> Self {
        if is_online {
            OnlineStatus::Online
        } else {
            OnlineStatus::Offline
        }
    }
}

/// One row per user. `active_sessions` counts the sockets currently open for
/// the user; `is_online` is true while it is non-zero. `version` grows with
/// every write, so a later transition always carries a larger version.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct PresenceStatus {
    pub user_id: i64,
    pub is_online: bool,
    pub active_sessions: i64,
    pub version: i64,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct PresenceQuery {
    pub user_ids: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: i64,
    pub status: OnlineStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Row of the chat contact list: another staff member with their presence
/// and the number of unread messages they sent to the caller.
#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct ChatContact {
    pub id: i64,
    pub username: String,
    pub display_name: Option<String>,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub unread_count: i64,
}

// ─── Message ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: i64,
    pub sender_id: i64,
    pub receiver_id: i64,
    pub content: String,
    pub attachment_url: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
}

/// A message about to be persisted. Read state and timestamp are fixed here,
/// never left to column defaults.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: i64,
    pub receiver_id: i64,
    pub content: String,
    pub attachment_url: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
}

impl NewMessage {
    pub fn new(
        sender_id: i64,
        receiver_id: i64,
        content: impl Into<String>,
        attachment_url: Option<String>,
    ) -> Self {
        Self {
            sender_id,
            receiver_id,
            content: content.into(),
            attachment_url,
            timestamp: Utc::now(),
            is_read: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub message: String,
    pub attachment_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationResponse {
    pub target_user: UserPublic,
    pub messages: Vec<Message>,
    /// How many messages this view flipped from unread to read.
    pub marked_read: u64,
}

// ─── Attachments ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    File,
}

impl AttachmentKind {
    /// Maps a multipart field name to the attachment kind it carries.
    pub fn from_field_name(name: &str) -> Option<Self> {
        match name {
            "image" => Some(AttachmentKind::Image),
            "file" => Some(AttachmentKind::File),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub url: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
}

// ─── WebSocket Frames ──────────────────────────────────

/// Frame sent by the browser. Both `message` (or `attachment_url`) and
/// `receiver_id` are needed for the frame to be routed.
#[derive(Debug, Deserialize)]
pub struct WsClientFrame {
    pub message: Option<String>,
    pub receiver_id: Option<i64>,
    pub attachment_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsServerMessage {
    /// A private message addressed to this connection's user
    PrivateMessage {
        message: String,
        sender_id: i64,
        sender_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachment_url: Option<String>,
    },
    /// Another staff member came online or went offline
    UserStatusUpdate {
        username: String,
        status: OnlineStatus,
    },
    /// The sender's own frame could not be delivered
    Error { message: String },
}

// ─── Validation helpers ───────────────────────────────

lazy_static::lazy_static! {
    static ref USERNAME_REGEX: regex::Regex =
        regex::Regex::new(r"^[a-zA-Z0-9_.-]+$").unwrap();
}

fn validate_username(username: &str) -> Result<(), validator::ValidationError> {
    if !USERNAME_REGEX.is_match(username) {
        return Err(validator::ValidationError::new("invalid_username"));
    }
    Ok(())
}

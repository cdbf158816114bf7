use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::channel_layer::{
    mailbox_group, ChannelLayer, ConnectionHandle, GroupEvent, PRESENCE_GROUP,
};
use crate::errors::AppResult;
use crate::message_router::MessageRouter;
use crate::middleware::UserRateLimiter;
use crate::models::{ChatUser, OnlineStatus, WsClientFrame, WsServerMessage};
use crate::presence::PresenceTracker;
use crate::AppState;

/// Lifecycle of one socket. Identity is verified by the upgrade handler
/// before a session exists, so a session starts in `Joining`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Joining,
    Active,
    Closed,
}

/// Bridges one authenticated socket and the channel layer.
pub struct ConnectionSession {
    conn: ConnectionHandle,
    user: ChatUser,
    state: SessionState,
    joined_groups: Vec<String>,
    /// Whether `session_opened` was recorded and must be balanced on close.
    presence_counted: bool,
    presence_order: PresenceOrdering,
    channels: Arc<dyn ChannelLayer>,
    presence: PresenceTracker,
    router: MessageRouter,
    limiter: UserRateLimiter,
}

impl ConnectionSession {
    pub fn new(user: ChatUser, app: &AppState) -> (Self, mpsc::UnboundedReceiver<GroupEvent>) {
        let (conn, events) = ConnectionHandle::new();
        let session = Self {
            conn,
            user,
            state: SessionState::Joining,
            joined_groups: Vec::with_capacity(2),
            presence_counted: false,
            presence_order: PresenceOrdering::default(),
            channels: app.channels.clone(),
            presence: app.presence.clone(),
            router: app.messages.clone(),
            limiter: app.ws_rate_limiter.clone(),
        };
        (session, events)
    }

    pub fn id(&self) -> Uuid {
        self.conn.id
    }

    pub fn user(&self) -> &ChatUser {
        &self.user
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Join the mailbox and presence groups, count the session as online and
    /// announce it. On error the caller must still `close()` the session.
    pub async fn open(&mut self) -> AppResult<()> {
        for group in [mailbox_group(self.user.id), PRESENCE_GROUP.to_string()] {
            self.channels.join(&group, &self.conn).await?;
            self.joined_groups.push(group);
        }

        let status = self.presence.session_opened(self.user.id).await?;
        self.presence_counted = true;

        self.channels
            .publish(
                PRESENCE_GROUP,
                GroupEvent::UserOnline {
                    user_id: self.user.id,
                    username: self.user.username.clone(),
                    version: status.version,
                },
            )
            .await?;

        self.state = SessionState::Active;
        Ok(())
    }

    /// Process one text frame from the client.
    ///
    /// Frames that cannot be routed (bad JSON, no receiver, nothing to send)
    /// are dropped without reply. Routing failures are answered with an
    /// `error` frame. `Err` is returned only for failures that end the
    /// session.
    pub async fn handle_frame(&self, text: &str) -> AppResult<Option<WsServerMessage>> {
        if self.state != SessionState::Active {
            return Ok(None);
        }

        let frame: WsClientFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(user_id = self.user.id, "Ignoring malformed frame: {}", e);
                return Ok(None);
            }
        };
        let Some(receiver_id) = frame.receiver_id else {
            return Ok(None);
        };
        let content = frame.message.unwrap_or_default();
        let attachment_url = frame.attachment_url.filter(|u| !u.is_empty());
        if content.is_empty() && attachment_url.is_none() {
            return Ok(None);
        }

        if !self.limiter.check(self.user.id) {
            return Ok(Some(WsServerMessage::Error {
                message: "Rate limited, slow down".into(),
            }));
        }

        match self
            .router
            .route(&self.user, receiver_id, &content, attachment_url)
            .await
        {
            Ok(_) => Ok(None),
            Err(e) if e.is_fatal_for_session() => Err(e),
            Err(e) => {
                let (_, message) = e.status_and_message();
                tracing::warn!(
                    user_id = self.user.id,
                    receiver_id,
                    "Failed to route message: {}",
                    e
                );
                Ok(Some(WsServerMessage::Error { message }))
            }
        }
    }

    /// Translate a group event into the frame for this session's client.
    /// Presence events older than one already relayed for the same user are
    /// dropped.
    pub fn relay(&mut self, event: GroupEvent) -> Option<WsServerMessage> {
        if !self.presence_order.admit(&event) {
            tracing::debug!(user_id = self.user.id, "Dropping stale presence event");
            return None;
        }
        relay_event(self.user.id, event)
    }

    /// Leave both groups and release the presence count. Safe to call more
    /// than once; only the first call has effects.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        self.teardown().await;
    }

    fn teardown(&mut self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let groups = std::mem::take(&mut self.joined_groups);
        let counted = std::mem::replace(&mut self.presence_counted, false);
        let channels = self.channels.clone();
        let presence = self.presence.clone();
        let user = self.user.clone();
        let conn_id = self.conn.id;

        async move {
            for group in &groups {
                if let Err(e) = channels.leave(group, conn_id).await {
                    tracing::warn!(user_id = user.id, group = %group, "Failed to leave group: {}", e);
                }
            }

            if !counted {
                return;
            }
            match presence.session_closed(user.id).await {
                Ok(status) if !status.is_online => {
                    if presence.superseded(user.id, status.version).await {
                        tracing::debug!(user_id = user.id, "Skipping offline announcement, user reconnected");
                        return;
                    }
                    let offline = GroupEvent::UserOffline {
                        user_id: user.id,
                        username: user.username.clone(),
                        version: status.version,
                    };
                    if let Err(e) = channels.publish(PRESENCE_GROUP, offline).await {
                        tracing::warn!(user_id = user.id, "Failed to announce offline: {}", e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(user_id = user.id, "Failed to record disconnect: {}", e);
                }
            }
        }
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        let cleanup = self.teardown();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(cleanup);
            }
            Err(_) => {
                tracing::error!(user_id = self.user.id, "Session dropped outside a runtime; presence not released");
            }
        }
    }
}

/// Highest presence version seen per user. Publishes from different
/// sessions race, so an offline event can arrive after the online event of a
/// newer session; the version settles which one is current.
#[derive(Debug, Default)]
pub struct PresenceOrdering {
    latest: HashMap<i64, i64>,
}

impl PresenceOrdering {
    /// True if `event` should be relayed. Chat events always pass.
    pub fn admit(&mut self, event: &GroupEvent) -> bool {
        let Some((user_id, version)) = event.presence_version() else {
            return true;
        };
        let latest = self.latest.entry(user_id).or_insert(0);
        if version <= *latest {
            return false;
        }
        *latest = version;
        true
    }
}

/// Maps a group event to the frame the session's own user should see. A
/// user is never told about their own presence changes.
pub fn relay_event(own_user_id: i64, event: GroupEvent) -> Option<WsServerMessage> {
    match event {
        GroupEvent::ChatMessage {
            message,
            sender_id,
            sender_name,
            attachment_url,
        } => Some(WsServerMessage::PrivateMessage {
            message,
            sender_id,
            sender_name,
            attachment_url,
        }),
        GroupEvent::UserOnline {
            user_id, username, ..
        } if user_id != own_user_id => {
            Some(WsServerMessage::UserStatusUpdate {
                username,
                status: OnlineStatus::Online,
            })
        }
        GroupEvent::UserOffline {
            user_id, username, ..
        } if user_id != own_user_id => {
            Some(WsServerMessage::UserStatusUpdate {
                username,
                status: OnlineStatus::Offline,
            })
        }
        _ => None,
    }
}

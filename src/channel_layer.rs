use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Group every connected staff member joins for presence fan-out.
pub const PRESENCE_GROUP: &str = "staff_status_updates";

/// Per-user mailbox group. Every open session of the user joins it.
pub fn mailbox_group(user_id: i64) -> String {
    format!("user_{}", user_id)
}

/// Event carried between sessions through a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupEvent {
    ChatMessage {
        message: String,
        sender_id: i64,
        sender_name: String,
        attachment_url: Option<String>,
    },
    /// `version` is the presence row version written by this transition.
    UserOnline {
        user_id: i64,
        username: String,
        version: i64,
    },
    UserOffline {
        user_id: i64,
        username: String,
        version: i64,
    },
}

impl GroupEvent {
    /// `(user_id, version)` for presence transitions, `None` for chat traffic.
    pub fn presence_version(&self) -> Option<(i64, i64)> {
        match self {
            GroupEvent::UserOnline { user_id, version, .. }
            | GroupEvent::UserOffline { user_id, version, .. } => Some((*user_id, *version)),
            GroupEvent::ChatMessage { .. } => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelLayerError {
    #[error("channel layer unavailable: {0}")]
    Unavailable(String),

    #[error("failed to encode group event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A session's inbox as seen by the channel layer.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: Uuid,
    pub tx: mpsc::UnboundedSender<GroupEvent>,
}

impl ConnectionHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GroupEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }
}

/// Named broadcast groups. Events published to a group reach every
/// connection that is a member at publish time, in publish order.
#[axum::async_trait]
pub trait ChannelLayer: Send + Sync {
    async fn join(&self, group: &str, conn: &ConnectionHandle) -> Result<(), ChannelLayerError>;

    async fn leave(&self, group: &str, conn_id: Uuid) -> Result<(), ChannelLayerError>;

    async fn publish(&self, group: &str, event: GroupEvent) -> Result<(), ChannelLayerError>;
}

/// Single-process layer. Also the local delivery half of the Redis layer.
#[derive(Clone, Default)]
pub struct InMemoryChannelLayer {
    groups: Arc<DashMap<String, HashMap<Uuid, mpsc::UnboundedSender<GroupEvent>>>>,
}

impl InMemoryChannelLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand `event` to every current member of `group` on this process.
    pub fn deliver(&self, group: &str, event: &GroupEvent) {
        if let Some(mut members) = self.groups.get_mut(group) {
            members.retain(|_, tx| tx.send(event.clone()).is_ok());
        }
        self.groups.remove_if(group, |_, members| members.is_empty());
    }

    pub fn add_member(&self, group: &str, conn: &ConnectionHandle) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(conn.id, conn.tx.clone());
    }

    pub fn remove_member(&self, group: &str, conn_id: Uuid) {
        if let Some(mut members) = self.groups.get_mut(group) {
            members.remove(&conn_id);
        }
        self.groups.remove_if(group, |_, members| members.is_empty());
    }

    pub fn member_count(&self, group: &str) -> usize {
        self.groups.get(group).map(|m| m.len()).unwrap_or(0)
    }
}

#[axum::async_trait]
impl ChannelLayer for InMemoryChannelLayer {
    async fn join(&self, group: &str, conn: &ConnectionHandle) -> Result<(), ChannelLayerError> {
        self.add_member(group, conn);
        Ok(())
    }

    async fn leave(&self, group: &str, conn_id: Uuid) -> Result<(), ChannelLayerError> {
        self.remove_member(group, conn_id);
        Ok(())
    }

    async fn publish(&self, group: &str, event: GroupEvent) -> Result<(), ChannelLayerError> {
        self.deliver(group, &event);
        Ok(())
    }
}

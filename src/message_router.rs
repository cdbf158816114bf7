use std::sync::Arc;

use crate::channel_layer::{mailbox_group, ChannelLayer, GroupEvent};
use crate::db::{queries, Pool};
use crate::errors::{AppError, AppResult};
use crate::models::{ChatUser, Message, NewMessage};

/// Persists a private message and pushes it to the receiver's mailbox.
///
/// The row is written before anything is published, so a message is never
/// delivered live without also being in history. Delivery to an offline
/// receiver is a no-op; they read it from history later.
#[derive(Clone)]
pub struct MessageRouter {
    db: Pool,
    channels: Arc<dyn ChannelLayer>,
}

impl MessageRouter {
    pub fn new(db: Pool, channels: Arc<dyn ChannelLayer>) -> Self {
        Self { db, channels }
    }

    pub async fn route(
        &self,
        sender: &ChatUser,
        receiver_id: i64,
        content: &str,
        attachment_url: Option<String>,
    ) -> AppResult<Message> {
        let attachment_url = attachment_url.filter(|u| !u.is_empty());
        if content.is_empty() && attachment_url.is_none() {
            return Err(AppError::Validation(
                "Message must have text or an attachment".into(),
            ));
        }
        if receiver_id == sender.id {
            return Err(AppError::Validation("Cannot send a message to yourself".into()));
        }
        if queries::find_user_by_id(&self.db, receiver_id).await?.is_none() {
            return Err(AppError::NotFound("Receiver not found".into()));
        }

        let stored = queries::insert_message(
            &self.db,
            &NewMessage::new(sender.id, receiver_id, content, attachment_url),
        )
        .await?;

        self.channels
            .publish(
                &mailbox_group(receiver_id),
                GroupEvent::ChatMessage {
                    message: stored.content.clone(),
                    sender_id: sender.id,
                    sender_name: sender.username.clone(),
                    attachment_url: stored.attachment_url.clone(),
                },
            )
            .await?;

        tracing::debug!(
            message_id = stored.id,
            sender_id = sender.id,
            receiver_id,
            "message routed"
        );
        Ok(stored)
    }
}

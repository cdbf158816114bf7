use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use uuid::Uuid;

use crate::channel_layer::{
    ChannelLayer, ChannelLayerError, ConnectionHandle, GroupEvent, InMemoryChannelLayer,
};

/// Redis channel prefix for group events. The full channel is the prefix
/// followed by the group name.
const GROUP_CHANNEL_PREFIX: &str = "staffchat:group:";

fn redis_channel(group: &str) -> String {
    format!("{}{}", GROUP_CHANNEL_PREFIX, group)
}

/// Channel layer shared by every process pointed at the same Redis.
///
/// Membership is kept locally. Publishing goes through Redis only; this
/// process's own pattern subscription brings the event back and hands it to
/// local members, so local and remote members see one ordering.
///
/// While that subscription is down, local members cannot receive anything,
/// so `join` and `publish` fail instead of reporting success.
#[derive(Clone)]
pub struct RedisChannelLayer {
    local: InMemoryChannelLayer,
    publisher: ConnectionManager,
    subscribed: Arc<AtomicBool>,
}

impl RedisChannelLayer {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url).context("Invalid REDIS_URL")?;
        let publisher = client
            .get_connection_manager()
            .await
            .context("Failed to connect to Redis")?;
        let pubsub = subscribe(&client)
            .await
            .context("Failed to subscribe to Redis group channels")?;

        let local = InMemoryChannelLayer::new();
        let subscribed = Arc::new(AtomicBool::new(true));
        tokio::spawn(run_subscriber(
            client,
            pubsub,
            local.clone(),
            subscribed.clone(),
        ));

        tracing::info!("Redis channel layer connected");
        Ok(Self {
            local,
            publisher,
            subscribed,
        })
    }

    fn ensure_subscribed(&self) -> Result<(), ChannelLayerError> {
        if self.subscribed.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ChannelLayerError::Unavailable(
                "Redis subscriber is reconnecting".into(),
            ))
        }
    }
}

/// PUBLISH reports how many subscribers got the event. This process's own
/// pattern subscription is one of them whenever it is attached, so zero means
/// local members were skipped.
fn check_delivery(receivers: i64) -> Result<(), ChannelLayerError> {
    if receivers > 0 {
        Ok(())
    } else {
        Err(ChannelLayerError::Unavailable(
            "no Redis subscriber received the event".into(),
        ))
    }
}

async fn subscribe(client: &redis::Client) -> redis::RedisResult<PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(format!("{}*", GROUP_CHANNEL_PREFIX)).await?;
    Ok(pubsub)
}

/// Forward every Redis group event to local members, reconnecting forever.
async fn run_subscriber(
    client: redis::Client,
    mut pubsub: PubSub,
    local: InMemoryChannelLayer,
    subscribed: Arc<AtomicBool>,
) {
    loop {
        {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                let event: GroupEvent = match serde_json::from_str(&payload) {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::warn!("Dropping undecodable group event: {}", e);
                        continue;
                    }
                };
                if let Some(group) = msg.get_channel_name().strip_prefix(GROUP_CHANNEL_PREFIX) {
                    local.deliver(group, &event);
                }
            }
        }
        subscribed.store(false, Ordering::Release);
        tracing::warn!("Redis pub/sub stream ended, reconnecting...");

        pubsub = loop {
            match subscribe(&client).await {
                Ok(p) => {
                    subscribed.store(true, Ordering::Release);
                    tracing::info!("Redis pub/sub subscriber reconnected");
                    break p;
                }
                Err(e) => {
                    tracing::error!("Failed to connect Redis pub/sub: {}, retrying in 5s", e);
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
            }
        };
    }
}

#[axum::async_trait]
impl ChannelLayer for RedisChannelLayer {
    async fn join(&self, group: &str, conn: &ConnectionHandle) -> Result<(), ChannelLayerError> {
        self.ensure_subscribed()?;
        self.local.add_member(group, conn);
        Ok(())
    }

    async fn leave(&self, group: &str, conn_id: Uuid) -> Result<(), ChannelLayerError> {
        self.local.remove_member(group, conn_id);
        Ok(())
    }

    async fn publish(&self, group: &str, event: GroupEvent) -> Result<(), ChannelLayerError> {
        self.ensure_subscribed()?;
        let payload = serde_json::to_string(&event)?;
        let mut conn = self.publisher.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(redis_channel(group))
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| ChannelLayerError::Unavailable(e.to_string()))?;
        check_delivery(receivers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_channel_is_prefixed_group() {
        assert_eq!(redis_channel("user_7"), "staffchat:group:user_7");
        assert_eq!(
            redis_channel("user_7").strip_prefix(GROUP_CHANNEL_PREFIX),
            Some("user_7")
        );
    }

    #[test]
    fn group_event_wire_format() {
        let json = serde_json::to_value(GroupEvent::UserOffline {
            user_id: 3,
            username: "carol".into(),
            version: 2,
        })
        .unwrap();
        assert_eq!(json["type"], "user_offline");
        assert_eq!(json["user_id"], 3);
        assert_eq!(json["version"], 2);
    }

    #[test]
    fn zero_receivers_is_unavailable() {
        assert!(matches!(
            check_delivery(0),
            Err(ChannelLayerError::Unavailable(_))
        ));
        assert!(check_delivery(1).is_ok());
        assert!(check_delivery(3).is_ok());
    }

    /// Live round trip through Redis. Runs only when
    /// `STAFFCHAT_TEST_REDIS_URL` points at a server.
    #[tokio::test]
    async fn publish_reaches_local_member_through_redis() {
        let Ok(url) = std::env::var("STAFFCHAT_TEST_REDIS_URL") else {
            return;
        };
        let layer = RedisChannelLayer::connect(&url).await.unwrap();
        let (conn, mut rx) = ConnectionHandle::new();
        let group = format!("user_{}", std::process::id());
        layer.join(&group, &conn).await.unwrap();

        let event = GroupEvent::ChatMessage {
            message: "over redis".into(),
            sender_id: 1,
            sender_name: "alice".into(),
            attachment_url: None,
        };
        layer.publish(&group, event.clone()).await.unwrap();

        let got = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(event));

        layer.subscribed.store(false, Ordering::Release);
        assert!(layer.join(&group, &conn).await.is_err());
        assert!(matches!(
            layer
                .publish(
                    &group,
                    GroupEvent::UserOnline {
                        user_id: 1,
                        username: "alice".into(),
                        version: 1,
                    },
                )
                .await,
            Err(ChannelLayerError::Unavailable(_))
        ));
    }
}

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use staff_chat::channel_layer::{
    ChannelLayer, ChannelLayerError, ConnectionHandle, GroupEvent, InMemoryChannelLayer,
};
use staff_chat::db::Pool;
use staff_chat::errors::AppError;
use staff_chat::message_router::MessageRouter;
use staff_chat::models::{ChatUser, OnlineStatus, WsServerMessage};
use staff_chat::session::{ConnectionSession, SessionState};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use common::TestApp;

/// In-memory layer that records publishes and can be told to fail or to
/// hold back offline announcements.
#[derive(Default)]
struct ScriptedLayer {
    inner: InMemoryChannelLayer,
    published: Mutex<Vec<(String, GroupEvent)>>,
    fail_publish: AtomicBool,
    hold_offline: AtomicBool,
    offline_waiting: AtomicUsize,
    release: Notify,
}

impl ScriptedLayer {
    fn published(&self) -> Vec<(String, GroupEvent)> {
        self.published.lock().unwrap().clone()
    }
}

#[axum::async_trait]
impl ChannelLayer for ScriptedLayer {
    async fn join(&self, group: &str, conn: &ConnectionHandle) -> Result<(), ChannelLayerError> {
        self.inner.join(group, conn).await
    }

    async fn leave(&self, group: &str, conn_id: Uuid) -> Result<(), ChannelLayerError> {
        self.inner.leave(group, conn_id).await
    }

    async fn publish(&self, group: &str, event: GroupEvent) -> Result<(), ChannelLayerError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(ChannelLayerError::Unavailable("scripted outage".into()));
        }
        if matches!(event, GroupEvent::UserOffline { .. }) && self.hold_offline.load(Ordering::SeqCst)
        {
            self.offline_waiting.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
        }
        self.published
            .lock()
            .unwrap()
            .push((group.to_string(), event.clone()));
        self.inner.publish(group, event).await
    }
}

async fn staff(app: &TestApp, name: &str) -> ChatUser {
    let (_, id) = app.register_user(name).await;
    ChatUser {
        id,
        username: name.to_string(),
    }
}

async fn active_sessions(app: &TestApp, user_id: i64) -> i64 {
    app.state
        .presence
        .get(user_id)
        .await
        .unwrap()
        .map(|p| p.active_sessions)
        .unwrap_or(0)
}

/// Relay everything queued for `session` and return the frames it would send.
fn drain(
    session: &mut ConnectionSession,
    events: &mut mpsc::UnboundedReceiver<GroupEvent>,
) -> Vec<WsServerMessage> {
    let mut frames = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let Some(frame) = session.relay(event) {
            frames.push(frame);
        }
    }
    frames
}

fn frame(receiver_id: i64, text: &str) -> String {
    json!({ "message": text, "receiver_id": receiver_id }).to_string()
}

// ─── Presence ordering ───────────────────────────────────

#[cfg_attr(feature = "postgres", sqlx::test(migrations = "./migrations"))]
#[cfg_attr(feature = "sqlite", sqlx::test(migrations = "./migrations_sqlite"))]
async fn offline_from_a_reloaded_tab_does_not_override_online(pool: Pool) {
    let layer = Arc::new(ScriptedLayer::default());
    let app = TestApp::with_channels(pool, layer.clone()).await;
    let alice = staff(&app, "alice").await;
    let bob = staff(&app, "bob").await;

    let (mut bob_session, mut bob_events) = ConnectionSession::new(bob, &app.state);
    bob_session.open().await.unwrap();
    let (mut old_tab, _old_events) = ConnectionSession::new(alice.clone(), &app.state);
    old_tab.open().await.unwrap();

    // The old tab's offline announcement stalls in the layer...
    layer.hold_offline.store(true, Ordering::SeqCst);
    let closing = tokio::spawn(async move {
        old_tab.close().await;
        old_tab
    });
    for _ in 0..200 {
        if layer.offline_waiting.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(layer.offline_waiting.load(Ordering::SeqCst), 1);

    // ...while the reloaded page opens a new one
    let (mut new_tab, _new_events) = ConnectionSession::new(alice.clone(), &app.state);
    new_tab.open().await.unwrap();

    layer.hold_offline.store(false, Ordering::SeqCst);
    layer.release.notify_one();
    let old_tab = closing.await.unwrap();
    assert_eq!(old_tab.state(), SessionState::Closed);

    let statuses: Vec<OnlineStatus> = drain(&mut bob_session, &mut bob_events)
        .into_iter()
        .filter_map(|f| match f {
            WsServerMessage::UserStatusUpdate { username, status } if username == "alice" => {
                Some(status)
            }
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![OnlineStatus::Online, OnlineStatus::Online]);

    assert!(app.state.presence.is_online(alice.id).await.unwrap());
    assert_eq!(active_sessions(&app, alice.id).await, 1);
}

// ─── Lifecycle ───────────────────────────────────────────

#[cfg_attr(feature = "postgres", sqlx::test(migrations = "./migrations"))]
#[cfg_attr(feature = "sqlite", sqlx::test(migrations = "./migrations_sqlite"))]
async fn session_moves_through_joining_active_closed(pool: Pool) {
    let app = TestApp::new(pool).await;
    let alice = staff(&app, "alice").await;

    let (mut session, _events) = ConnectionSession::new(alice.clone(), &app.state);
    assert_eq!(session.state(), SessionState::Joining);
    session.open().await.unwrap();
    assert_eq!(session.state(), SessionState::Active);
    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);

    // A closed session ignores frames
    assert!(session.handle_frame(&frame(1, "late")).await.unwrap().is_none());
}

#[cfg_attr(feature = "postgres", sqlx::test(migrations = "./migrations"))]
#[cfg_attr(feature = "sqlite", sqlx::test(migrations = "./migrations_sqlite"))]
async fn close_twice_releases_one_session(pool: Pool) {
    let app = TestApp::new(pool).await;
    let alice = staff(&app, "alice").await;

    let (mut first, _e1) = ConnectionSession::new(alice.clone(), &app.state);
    let (mut second, _e2) = ConnectionSession::new(alice.clone(), &app.state);
    first.open().await.unwrap();
    second.open().await.unwrap();
    assert_eq!(active_sessions(&app, alice.id).await, 2);

    first.close().await;
    first.close().await;
    assert_eq!(active_sessions(&app, alice.id).await, 1);
    assert!(app.state.presence.is_online(alice.id).await.unwrap());

    second.close().await;
    assert_eq!(active_sessions(&app, alice.id).await, 0);
    assert!(!app.state.presence.is_online(alice.id).await.unwrap());
}

#[cfg_attr(feature = "postgres", sqlx::test(migrations = "./migrations"))]
#[cfg_attr(feature = "sqlite", sqlx::test(migrations = "./migrations_sqlite"))]
async fn dropping_an_open_session_releases_presence(pool: Pool) {
    let app = TestApp::new(pool).await;
    let alice = staff(&app, "alice").await;
    let bob = staff(&app, "bob").await;

    let (mut bob_session, mut bob_events) = ConnectionSession::new(bob, &app.state);
    bob_session.open().await.unwrap();

    let (mut session, _events) = ConnectionSession::new(alice.clone(), &app.state);
    session.open().await.unwrap();
    drop(session);

    for _ in 0..200 {
        if active_sessions(&app, alice.id).await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(active_sessions(&app, alice.id).await, 0);
    assert!(!app.state.presence.is_online(alice.id).await.unwrap());

    // The spawned teardown also announces the departure
    let mut saw_offline = false;
    for _ in 0..200 {
        saw_offline |= drain(&mut bob_session, &mut bob_events).iter().any(|f| {
            matches!(
                f,
                WsServerMessage::UserStatusUpdate { status: OnlineStatus::Offline, .. }
            )
        });
        if saw_offline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(saw_offline);
}

// ─── Failure handling ────────────────────────────────────

#[cfg_attr(feature = "postgres", sqlx::test(migrations = "./migrations"))]
#[cfg_attr(feature = "sqlite", sqlx::test(migrations = "./migrations_sqlite"))]
async fn failed_open_still_releases_presence_on_close(pool: Pool) {
    let layer = Arc::new(ScriptedLayer::default());
    let app = TestApp::with_channels(pool, layer.clone()).await;
    let alice = staff(&app, "alice").await;

    layer.fail_publish.store(true, Ordering::SeqCst);
    let (mut session, _events) = ConnectionSession::new(alice.clone(), &app.state);
    let err = session.open().await.unwrap_err();
    assert!(err.is_fatal_for_session());
    assert_eq!(session.state(), SessionState::Joining);

    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(active_sessions(&app, alice.id).await, 0);
    assert!(!app.state.presence.is_online(alice.id).await.unwrap());
}

#[cfg_attr(feature = "postgres", sqlx::test(migrations = "./migrations"))]
#[cfg_attr(feature = "sqlite", sqlx::test(migrations = "./migrations_sqlite"))]
async fn channel_outage_while_routing_ends_the_session(pool: Pool) {
    let layer = Arc::new(ScriptedLayer::default());
    let app = TestApp::with_channels(pool, layer.clone()).await;
    let alice = staff(&app, "alice").await;
    let bob = staff(&app, "bob").await;

    let (mut session, _events) = ConnectionSession::new(alice.clone(), &app.state);
    session.open().await.unwrap();

    layer.fail_publish.store(true, Ordering::SeqCst);
    let err = session.handle_frame(&frame(bob.id, "hello?")).await.unwrap_err();
    assert!(matches!(err, AppError::ChannelLayer(_)));

    // The socket loop closes the session on a fatal error
    session.close().await;
    assert_eq!(active_sessions(&app, alice.id).await, 0);
}

#[cfg_attr(feature = "postgres", sqlx::test(migrations = "./migrations"))]
#[cfg_attr(feature = "sqlite", sqlx::test(migrations = "./migrations_sqlite"))]
async fn persistence_failure_reports_error_and_publishes_nothing(pool: Pool) {
    let layer = Arc::new(ScriptedLayer::default());
    let app = TestApp::with_channels(pool, layer.clone()).await;
    let alice = staff(&app, "alice").await;
    let bob = staff(&app, "bob").await;

    let (mut session, _events) = ConnectionSession::new(alice.clone(), &app.state);
    session.open().await.unwrap();
    let published_before = layer.published().len();

    sqlx::query("DROP TABLE messages").execute(&app.pool).await.unwrap();

    let reply = session.handle_frame(&frame(bob.id, "lost")).await.unwrap();
    assert_eq!(
        reply,
        Some(WsServerMessage::Error {
            message: "Internal server error".into()
        })
    );
    assert_eq!(layer.published().len(), published_before);
    assert_eq!(session.state(), SessionState::Active);

    session.close().await;
}

#[cfg_attr(feature = "postgres", sqlx::test(migrations = "./migrations"))]
#[cfg_attr(feature = "sqlite", sqlx::test(migrations = "./migrations_sqlite"))]
async fn router_publishes_nothing_when_insert_fails(pool: Pool) {
    let layer = Arc::new(ScriptedLayer::default());
    let app = TestApp::with_channels(pool, layer.clone()).await;
    let alice = staff(&app, "alice").await;
    let bob = staff(&app, "bob").await;

    let router = MessageRouter::new(app.pool.clone(), layer.clone());
    sqlx::query("DROP TABLE messages").execute(&app.pool).await.unwrap();

    let err = router.route(&alice, bob.id, "lost", None).await.unwrap_err();
    assert!(matches!(err, AppError::Database(_)));
    assert!(layer.published().is_empty());
}

#[cfg_attr(feature = "postgres", sqlx::test(migrations = "./migrations"))]
#[cfg_attr(feature = "sqlite", sqlx::test(migrations = "./migrations_sqlite"))]
async fn whitespace_frame_is_routed_and_empty_frame_is_not(pool: Pool) {
    let app = TestApp::new(pool).await;
    let alice = staff(&app, "alice").await;
    let bob = staff(&app, "bob").await;

    let (mut session, _events) = ConnectionSession::new(alice.clone(), &app.state);
    session.open().await.unwrap();

    assert!(session.handle_frame(&frame(bob.id, "")).await.unwrap().is_none());
    assert_eq!(app.count_messages(alice.id, bob.id).await, 0);

    assert!(session.handle_frame(&frame(bob.id, "  ")).await.unwrap().is_none());
    assert_eq!(app.count_messages(alice.id, bob.id).await, 1);

    session.close().await;
}

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::auth::authenticate_token;
use crate::db::queries;
use crate::errors::AppError;
use crate::models::{ChatUser, WsServerMessage};
use crate::session::ConnectionSession;
use crate::AppState;

/// Query params for WebSocket upgrade. The token travels as a query param
/// since browsers cannot set headers on a WebSocket handshake.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: Option<String>,
}

/// WebSocket upgrade handler. Refuses the upgrade unless the token names an
/// existing user.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(auth): Query<WsAuthQuery>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let user = authenticate(&state, auth.token.as_deref()).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, user, state)))
}

async fn authenticate(state: &AppState, token: Option<&str>) -> Result<ChatUser, AppError> {
    let token = token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::AuthError("Missing token".into()))?;
    let user_id = authenticate_token(token, &state.config)?;

    let user = queries::find_user_by_id(&state.db, user_id)
        .await?
        .ok_or_else(|| AppError::AuthError("Unknown user".into()))?;
    Ok(ChatUser::from(&user))
}

/// Runs one connection: a single task waits on either the next client frame
/// or the next group event, so frames from this socket are handled in order.
/// A ping goes out every `ws_ping_interval_secs`; a peer silent for longer
/// than `ws_idle_timeout_secs` is treated as gone.
async fn handle_socket(socket: WebSocket, user: ChatUser, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (mut session, mut events) = ConnectionSession::new(user, &state);

    if let Err(e) = session.open().await {
        tracing::error!(
            user_id = session.user().id,
            "Failed to join chat groups, closing socket: {}",
            e
        );
        session.close().await;
        let _ = ws_sink.send(Message::Close(None)).await;
        return;
    }

    tracing::info!(
        user_id = session.user().id,
        session_id = %session.id(),
        "WebSocket connected"
    );

    let idle_timeout = Duration::from_secs(state.config.ws_idle_timeout_secs);
    let mut heartbeat = interval(Duration::from_secs(state.config.ws_ping_interval_secs.max(1)));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.reset();
    let mut last_heard = Instant::now();

    loop {
        tokio::select! {
            incoming = ws_stream.next() => {
                if matches!(incoming, Some(Ok(_))) {
                    last_heard = Instant::now();
                }
                match incoming {
                    Some(Ok(Message::Text(text))) => match session.handle_frame(&text).await {
                        Ok(Some(reply)) => {
                            if send_frame(&mut ws_sink, &reply, idle_timeout).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::error!(
                                user_id = session.user().id,
                                "Closing session after infrastructure failure: {}",
                                e
                            );
                            break;
                        }
                    },
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // pongs only refresh `last_heard`; axum answers pings itself
                    Some(Ok(_)) => {}
                }
            },
            _ = heartbeat.tick() => {
                if last_heard.elapsed() > idle_timeout {
                    tracing::info!(
                        user_id = session.user().id,
                        session_id = %session.id(),
                        "Peer silent past idle timeout, closing"
                    );
                    break;
                }
                if send_raw(&mut ws_sink, Message::Ping(Vec::new()), idle_timeout).await.is_err() {
                    break;
                }
            },
            event = events.recv() => match event {
                Some(event) => {
                    if let Some(frame) = session.relay(event) {
                        if send_frame(&mut ws_sink, &frame, idle_timeout).await.is_err() {
                            break;
                        }
                    }
                }
                None => break,
            },
        }
    }

    session.close().await;
    let _ = tokio::time::timeout(idle_timeout, ws_sink.close()).await;

    tracing::info!(
        user_id = session.user().id,
        session_id = %session.id(),
        "WebSocket disconnected"
    );
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: &WsServerMessage,
    limit: Duration,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(msg).map_err(axum::Error::new)?;
    send_raw(sink, Message::Text(text), limit).await
}

/// A peer that stopped reading would otherwise block the loop once its
/// receive buffer fills.
async fn send_raw(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: Message,
    limit: Duration,
) -> Result<(), axum::Error> {
    tokio::time::timeout(limit, sink.send(msg))
        .await
        .map_err(axum::Error::new)?
}

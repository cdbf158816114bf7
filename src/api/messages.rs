use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use crate::db::queries;
use crate::errors::{AppError, AppResult};
use crate::middleware::AuthUser;
use crate::models::*;
use crate::AppState;

/// GET /api/v1/chat/messages?limit=
/// Everything the caller sent or received, newest `limit`, oldest first.
pub async fn list_inbox(
    State(state): State<AppState>,
    AuthUser(me): AuthUser,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<Vec<Message>>> {
    let messages = queries::list_user_messages(&state.db, me, query.resolve()).await?;
    Ok(Json(messages))
}

/// GET /api/v1/chat/:user_id/messages?limit=
/// The latest messages with `user_id`, oldest first. Opening the
/// conversation marks everything `user_id` sent to the caller as read.
pub async fn get_conversation(
    State(state): State<AppState>,
    AuthUser(me): AuthUser,
    Path(other_id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<ConversationResponse>> {
    let target = queries::find_user_by_id(&state.db, other_id)
        .await?
        .ok_or(AppError::UserNotFound)?;

    let (messages, marked_read) =
        queries::get_conversation_and_mark_read(&state.db, me, other_id, query.resolve()).await?;

    if marked_read > 0 {
        tracing::debug!(user_id = me, other_id, marked_read, "Marked conversation read");
    }

    Ok(Json(ConversationResponse {
        target_user: target.into(),
        messages,
        marked_read,
    }))
}

/// POST /api/v1/chat/:user_id/messages
/// Same path as a socket frame, for clients without a live connection.
pub async fn send_message(
    State(state): State<AppState>,
    AuthUser(me): AuthUser,
    Path(receiver_id): Path<i64>,
    Json(req): Json<SendMessageRequest>,
) -> AppResult<(StatusCode, Json<Message>)> {
    let sender = queries::find_user_by_id(&state.db, me)
        .await?
        .ok_or(AppError::AuthError("Unknown user".into()))?;

    let message = state
        .messages
        .route(&ChatUser::from(&sender), receiver_id, &req.message, req.attachment_url)
        .await?;

    Ok((StatusCode::CREATED, Json(message)))
}

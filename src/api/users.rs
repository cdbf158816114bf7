use axum::{extract::State, Json};

use crate::db::queries;
use crate::errors::AppResult;
use crate::middleware::AuthUser;
use crate::models::ChatContact;
use crate::AppState;

/// GET /api/v1/chat/users
/// Every other staff member with presence and unread count.
pub async fn list_contacts(
    State(state): State<AppState>,
    AuthUser(me): AuthUser,
) -> AppResult<Json<Vec<ChatContact>>> {
    let contacts = queries::list_chat_contacts(&state.db, me).await?;
    Ok(Json(contacts))
}

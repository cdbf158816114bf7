use axum::{extract::State, http::StatusCode, Json};
use validator::Validate;

use crate::auth;
use crate::db::queries;
use crate::errors::{AppError, AppResult};
use crate::models::*;
use crate::AppState;

/// POST /api/v1/auth/register
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> AppResult<(StatusCode, Json<AuthResponse>)> {
    req.validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let password_hash = auth::hash_password(&req.password)?;
    let display_name = req
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty());

    let user = queries::create_user(&state.db, &req.username, display_name, &password_hash).await?;
    let access_token = auth::issue_access_token(user.id, &state.config)?;

    tracing::info!(user_id = user.id, "Registered staff account {}", user.username);

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            access_token,
            user: user.into(),
        }),
    ))
}

/// POST /api/v1/auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> AppResult<Json<AuthResponse>> {
    let user = queries::find_user_by_username(&state.db, &req.username)
        .await?
        .ok_or(AppError::AuthError("Invalid username or password".into()))?;

    if !auth::verify_password(&req.password, &user.password_hash)? {
        return Err(AppError::AuthError("Invalid username or password".into()));
    }

    let access_token = auth::issue_access_token(user.id, &state.config)?;

    Ok(Json(AuthResponse {
        access_token,
        user: user.into(),
    }))
}

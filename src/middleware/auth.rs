use axum::{extract::FromRequestParts, http::request::Parts};

use crate::auth::{authenticate_token, bearer_token};
use crate::errors::AppError;
use crate::AppState;

/// Staff user id behind the request's bearer token.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub i64);

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)?;
        authenticate_token(token, &state.config).map(AuthUser)
    }
}

use axum::{
    extract::{Multipart, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};

use crate::errors::{AppError, AppResult};
use crate::middleware::AuthUser;
use crate::models::*;
use crate::storage::{self, ATTACHMENT_PREFIX};
use crate::AppState;

/// POST /api/v1/chat/upload
/// Multipart body with a field named `image` or `file`. The first such field
/// is stored under a fresh random name; other fields are ignored.
pub async fn upload(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    mut multipart: Multipart,
) -> AppResult<Json<UploadResponse>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Malformed multipart body: {}", e)))?
    {
        let Some(kind) = field.name().and_then(AttachmentKind::from_field_name) else {
            continue;
        };
        let original_name = field
            .file_name()
            .map(str::to_string)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "upload".to_string());
        let data = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(format!("Failed to read upload: {}", e)))?;

        let storage_key = storage::attachment_storage_key(&original_name);
        state.storage.store_blob(&storage_key, &data).await?;

        tracing::debug!(
            user_id,
            size = data.len(),
            key = %storage_key,
            "Stored chat attachment"
        );

        return Ok(Json(UploadResponse {
            url: storage::public_url(&storage_key),
            name: original_name,
            kind,
        }));
    }

    Err(AppError::BadRequest("Invalid request".into()))
}

/// GET /media/chat_uploads/:name
/// No auth: names are random v4 UUIDs handed out only to the uploader, who
/// passes them on inside a message.
pub async fn download(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    if !storage::is_valid_attachment_name(&name) {
        return Err(AppError::NotFound("Attachment not found".into()));
    }

    let data = state
        .storage
        .load_blob(&format!("{}/{}", ATTACHMENT_PREFIX, name))
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AppError::NotFound("Attachment not found".into()),
            _ => AppError::Storage(e),
        })?;

    let mime = mime_guess::from_path(&name).first_or_octet_stream();
    let disposition = if mime.type_() == mime_guess::mime::IMAGE {
        "inline"
    } else {
        "attachment"
    };

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, mime.essence_str().to_string()),
            (header::CONTENT_DISPOSITION, disposition.to_string()),
            (header::CACHE_CONTROL, "private, max-age=86400".to_string()),
        ],
        data,
    ))
}

//! Upload endpoint
//!
//! `POST /api/upload` (multipart field `file`) stores one media file under
//! `<root>/uploads/<fileId>/` and returns the identifier. A transcription job
//! submitted with that `fileId` uses the directory as its workspace and
//! removes it when done.

use axum::{
    extract::{multipart::Field, DefaultBodyLimit, Multipart, State},
    routing::post,
    Json, Router,
};
use serde::Serialize;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::AppState;

/// Upload response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub file_id: Uuid,
    pub size: u64,
}

/// Keep `[A-Za-z0-9._-]`, replace everything else, never start with a dot
pub fn sanitize_file_name(raw: &str) -> String {
    let base = raw.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    cleaned.chars().take(128).collect()
}

fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "video/webm" => "webm",
        "video/quicktime" => "mov",
        "video/x-matroska" => "mkv",
        "video/x-msvideo" => "avi",
        "video/mpeg" => "mpeg",
        "video/ogg" => "ogv",
        _ => "mp4",
    }
}

/// Content type without parameters, lowercased
fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

async fn store_field(mut field: Field<'_>, path: &Path, max_bytes: u64) -> ApiResult<u64> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut size: u64 = 0;

    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Upload interrupted: {}", e)))?
    {
        size += chunk.len() as u64;
        if size > max_bytes {
            return Err(ApiError::PayloadTooLarge(format!(
                "File exceeds the {} byte limit",
                max_bytes
            )));
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    if size == 0 {
        return Err(ApiError::BadRequest("Uploaded file is empty".to_string()));
    }
    Ok(size)
}

/// POST /api/upload
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadResponse>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed form data: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let content_type = essence(field.content_type().unwrap_or_default());
        if !state
            .upload
            .allowed_mime_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&content_type))
        {
            return Err(ApiError::UnsupportedMediaType(format!(
                "Content type '{}' is not an accepted video format",
                content_type
            )));
        }

        let file_name = field
            .file_name()
            .map(sanitize_file_name)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("video.{}", extension_for_mime(&content_type)));

        let file_id = Uuid::new_v4();
        let dir = state.controller.workspaces().upload_dir(&file_id);
        tokio::fs::create_dir_all(&dir).await?;

        return match store_field(field, &dir.join(&file_name), state.upload.max_bytes).await {
            Ok(size) => {
                info!(file_id = %file_id, file = %file_name, size, "Upload stored");
                Ok(Json(UploadResponse { file_id, size }))
            }
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                    warn!(file_id = %file_id, error = %cleanup, "Failed to remove partial upload");
                }
                Err(e)
            }
        };
    }

    Err(ApiError::BadRequest("Missing 'file' field".to_string()))
}

/// Build upload routes
///
/// The default body limit is lifted; the size ceiling is enforced while
/// streaming the file to disk.
pub fn upload_routes() -> Router<AppState> {
    Router::new()
        .route("/api/upload", post(upload))
        .layer(DefaultBodyLimit::disable())
}

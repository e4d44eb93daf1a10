//! Subtitle translation endpoint
//!
//! `POST /api/translate` with `{"subtitles": "...", "targetLanguage": "fr"}`.
//! A plain request/response call, independent of any transcription stream.

use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::job::LanguageTag;
use crate::translate::{translate_document, TranslateError};
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateRequest {
    pub subtitles: String,
    pub target_language: String,
}

#[derive(Debug, Serialize)]
pub struct TranslateResponse {
    pub translated: String,
}

/// POST /api/translate
pub async fn translate(
    State(state): State<AppState>,
    Json(request): Json<TranslateRequest>,
) -> ApiResult<Json<TranslateResponse>> {
    let target = LanguageTag::parse(&request.target_language)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    if target.is_auto() {
        return Err(ApiError::BadRequest(
            "targetLanguage must name a language".to_string(),
        ));
    }

    let translator = state
        .translator
        .clone()
        .ok_or(TranslateError::NotConfigured)?;

    let translated = translate_document(
        translator.as_ref(),
        &request.subtitles,
        target.as_str(),
        state.translation_batch_size,
    )
    .await?;

    Ok(Json(TranslateResponse { translated }))
}

/// Build translation routes
pub fn translate_routes() -> Router<AppState> {
    Router::new().route("/api/translate", post(translate))
}

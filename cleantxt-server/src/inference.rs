//! Remote inference client
//!
//! Sends the workspace's media file as raw bytes to a hosted speech-recognition
//! endpoint with a bearer credential. Response body:
//! `{"text": "...", "chunks": [{"timestamp": [0.0, 4.2], "text": "..."}]}`
//! (`chunks` optional, end timestamp may be `null`).

use cleantxt_common::events::{Segment, Transcription};
use reqwest::{header, Body, Client, StatusCode};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// Longest upstream error body echoed into an error message
const MAX_ERROR_BODY_CHARS: usize = 300;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("cannot read media file: {0}")]
    Io(#[from] std::io::Error),

    #[error("inference request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("inference endpoint returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("inference response not understood: {0}")]
    Decode(String),
}

#[derive(Debug, Deserialize)]
struct InferenceResponse {
    text: String,
    #[serde(default)]
    chunks: Vec<InferenceChunk>,
}

#[derive(Debug, Deserialize)]
struct InferenceChunk {
    timestamp: (Option<f64>, Option<f64>),
    text: String,
}

/// Client for one configured inference endpoint
#[derive(Debug, Clone)]
pub struct InferenceClient {
    http_client: Client,
    endpoint: String,
    api_key: String,
}

impl InferenceClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, InferenceError> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Transcribe one media file; called at most once per job
    pub async fn transcribe(
        &self,
        media: &Path,
        language: &str,
    ) -> Result<Transcription, InferenceError> {
        let file = tokio::fs::File::open(media).await?;
        let size = file.metadata().await?.len();
        let content_type = content_type_for(media);

        info!(
            endpoint = %self.endpoint,
            file = %media.display(),
            size,
            content_type,
            "Sending media to inference endpoint"
        );

        let response = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CONTENT_LENGTH, size)
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Status {
                status,
                body: truncate(body.trim(), MAX_ERROR_BODY_CHARS),
            });
        }

        let body = response.text().await?;
        debug!(bytes = body.len(), "Inference response received");
        parse_response(&body, language)
    }
}

fn parse_response(body: &str, language: &str) -> Result<Transcription, InferenceError> {
    let parsed: InferenceResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::Decode(e.to_string()))?;

    let text = parsed.text.trim().to_string();
    if text.is_empty() {
        return Err(InferenceError::Decode("empty transcription text".to_string()));
    }

    let segments = parsed
        .chunks
        .into_iter()
        .filter_map(|chunk| {
            let start = chunk.timestamp.0?;
            Some(Segment {
                start,
                end: chunk.timestamp.1,
                text: chunk.text.trim().to_string(),
            })
        })
        .collect();

    Ok(Transcription {
        segments,
        ..Transcription::new(text, language)
    })
}

/// MIME type sent for a media file, by extension
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "mpeg" | "mpg" => "video/mpeg",
        "ogv" | "ogg" => "video/ogg",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::{HeaderMap, StatusCode as AxumStatus},
        routing::post,
        Router,
    };

    #[test]
    fn test_parse_response_with_chunks() {
        let body = r#"{"text":" Hello there. General Kenobi. ","chunks":[
            {"timestamp":[0.0,1.5],"text":" Hello there."},
            {"timestamp":[1.5,null],"text":"General Kenobi."},
            {"timestamp":[null,null],"text":"dropped"}
        ]}"#;
        let transcription = parse_response(body, "en").unwrap();
        assert_eq!(transcription.text, "Hello there. General Kenobi.");
        assert_eq!(transcription.language, "en");
        assert_eq!(transcription.segments.len(), 2);
        assert_eq!(transcription.segments[0].text, "Hello there.");
        assert_eq!(transcription.segments[1].end, None);
    }

    #[test]
    fn test_parse_response_rejects_garbage() {
        assert!(matches!(
            parse_response("<html>", "auto"),
            Err(InferenceError::Decode(_))
        ));
        assert!(matches!(
            parse_response(r#"{"text":"   "}"#, "auto"),
            Err(InferenceError::Decode(_))
        ));
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for(Path::new("/w/video.MP4")), "video/mp4");
        assert_eq!(content_type_for(Path::new("talk.mkv")), "video/x-matroska");
        assert_eq!(content_type_for(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate("héllo", 2), "hé...");
        assert_eq!(truncate("ok", 10), "ok");
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/transcribe", addr)
    }

    #[tokio::test]
    async fn test_transcribe_sends_bearer_and_bytes() {
        let app = Router::new().route(
            "/transcribe",
            post(|headers: HeaderMap, body: axum::body::Bytes| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                if auth != "Bearer test-key" || body.as_ref() != b"fake-video" {
                    return (AxumStatus::UNAUTHORIZED, "bad request".to_string());
                }
                (AxumStatus::OK, r#"{"text":"remote words"}"#.to_string())
            }),
        );
        let endpoint = serve(app).await;

        let temp = tempfile::TempDir::new().unwrap();
        let media = temp.path().join("video.mp4");
        std::fs::write(&media, b"fake-video").unwrap();

        let client = InferenceClient::new(endpoint, "test-key", Duration::from_secs(10)).unwrap();
        let transcription = client.transcribe(&media, "auto").await.unwrap();
        assert_eq!(transcription.text, "remote words");
    }

    #[tokio::test]
    async fn test_non_success_status_is_error() {
        let app = Router::new().route(
            "/transcribe",
            post(|| async { (AxumStatus::SERVICE_UNAVAILABLE, "model loading") }),
        );
        let endpoint = serve(app).await;

        let temp = tempfile::TempDir::new().unwrap();
        let media = temp.path().join("clip.webm");
        std::fs::write(&media, b"bytes").unwrap();

        let client = InferenceClient::new(endpoint, "k", Duration::from_secs(10)).unwrap();
        match client.transcribe(&media, "auto").await {
            Err(InferenceError::Status { status, body }) => {
                assert_eq!(status.as_u16(), 503);
                assert_eq!(body, "model loading");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}

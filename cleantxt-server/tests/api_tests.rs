//! HTTP surface tests using tower's oneshot

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use cleantxt_common::config::UploadConfig;
use cleantxt_server::job::{JobController, PipelineSettings, Preflight, PreflightError};
use cleantxt_server::translate::{BatchTranslator, TranslateError, TranslationContext};
use cleantxt_server::workspace::WorkspaceManager;
use cleantxt_server::{build_router, AppState};
use http_body_util::BodyExt;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

const BOUNDARY: &str = "cleantxt-test-boundary";

struct PassingPreflight;

#[async_trait]
impl Preflight for PassingPreflight {
    async fn check(&self) -> Result<(), PreflightError> {
        Ok(())
    }
}

struct UpperCase;

#[async_trait]
impl BatchTranslator for UpperCase {
    async fn translate_lines(
        &self,
        lines: &[String],
        _target_language: &str,
        _context: &TranslationContext,
    ) -> Result<Vec<String>, TranslateError> {
        Ok(lines.iter().map(|l| l.to_uppercase()).collect())
    }
}

fn test_state(root: &Path, max_bytes: u64) -> AppState {
    let uploads = root.join("uploads");
    let jobs = root.join("jobs");
    std::fs::create_dir_all(&uploads).unwrap();
    std::fs::create_dir_all(&jobs).unwrap();

    let settings = PipelineSettings::python("sh", Path::new("dl.py"), Path::new("tx.py"));
    let controller = JobController::new(
        settings,
        WorkspaceManager::new(uploads, jobs),
        Arc::new(PassingPreflight),
    );
    let upload = UploadConfig {
        max_bytes,
        allowed_mime_types: vec!["video/mp4".to_string(), "video/webm".to_string()],
    };
    AppState::new(controller, upload, 16)
}

fn test_app(root: &Path) -> Router {
    build_router(test_state(root, 1024))
}

/// Multipart body with one part per `(name, filename, content_type, bytes)`
fn multipart_body(parts: &[(&str, Option<&str>, Option<&str>, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, filename, content_type, bytes) in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        let mut disposition = format!("Content-Disposition: form-data; name=\"{}\"", name);
        if let Some(filename) = filename {
            disposition.push_str(&format!("; filename=\"{}\"", filename));
        }
        body.extend_from_slice(disposition.as_bytes());
        body.extend_from_slice(b"\r\n");
        if let Some(content_type) = content_type {
            body.extend_from_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
        }
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

fn multipart_request(uri: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

fn json_request(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let temp = TempDir::new().unwrap();
    let response = test_app(temp.path())
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["module"], "cleantxt-server");
    assert_eq!(json["active_jobs"], 0);
}

#[tokio::test]
async fn test_transcribe_without_source_streams_invalid_input() {
    let temp = TempDir::new().unwrap();
    let body = multipart_body(&[("language", None, None, b"auto")]);
    let response = test_app(temp.path())
        .oneshot(multipart_request("/api/transcribe", body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");

    let text = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(text.contains("event: error"), "body: {}", text);
    assert!(text.contains("\"code\":\"INVALID_INPUT\""), "body: {}", text);
    assert!(!text.contains("event: complete"));
}

#[tokio::test]
async fn test_transcribe_unknown_file_id_streams_invalid_input() {
    let temp = TempDir::new().unwrap();
    let id = Uuid::new_v4().to_string();
    let body = multipart_body(&[("fileId", None, None, id.as_bytes())]);
    let response = test_app(temp.path())
        .oneshot(multipart_request("/api/transcribe", body))
        .await
        .unwrap();

    let text = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(text.contains("INVALID_INPUT"), "body: {}", text);
}

#[tokio::test]
async fn test_upload_stores_file() {
    let temp = TempDir::new().unwrap();
    let body = multipart_body(&[("file", Some("talk.mp4"), Some("video/mp4"), b"0123456789")]);
    let response = test_app(temp.path())
        .oneshot(multipart_request("/api/upload", body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["size"], 10);
    let file_id = json["fileId"].as_str().unwrap();
    let stored = temp.path().join("uploads").join(file_id).join("talk.mp4");
    assert_eq!(std::fs::read(stored).unwrap(), b"0123456789");
}

#[tokio::test]
async fn test_upload_rejects_unsupported_type() {
    let temp = TempDir::new().unwrap();
    let body = multipart_body(&[("file", Some("notes.txt"), Some("text/plain"), b"hello")]);
    let response = test_app(temp.path())
        .oneshot(multipart_request("/api/upload", body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "UNSUPPORTED_MEDIA_TYPE");
    assert_eq!(std::fs::read_dir(temp.path().join("uploads")).unwrap().count(), 0);
}

#[tokio::test]
async fn test_upload_rejects_oversized_file() {
    let temp = TempDir::new().unwrap();
    let app = build_router(test_state(temp.path(), 8));
    let body = multipart_body(&[("file", Some("big.mp4"), Some("video/mp4"), &[7u8; 32])]);
    let response = app
        .oneshot(multipart_request("/api/upload", body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "PAYLOAD_TOO_LARGE");
    assert_eq!(std::fs::read_dir(temp.path().join("uploads")).unwrap().count(), 0);
}

#[tokio::test]
async fn test_translate_unavailable_without_translator() {
    let temp = TempDir::new().unwrap();
    let request = json_request(
        "/api/translate",
        serde_json::json!({
            "subtitles": "1\n00:00:01,000 --> 00:00:02,000\nHello\n",
            "targetLanguage": "fr"
        }),
    );
    let response = test_app(temp.path()).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "SERVICE_UNAVAILABLE");
}

#[tokio::test]
async fn test_translate_rejects_auto_target() {
    let temp = TempDir::new().unwrap();
    let state = test_state(temp.path(), 1024).with_translator(Arc::new(UpperCase), 10);
    let request = json_request(
        "/api/translate",
        serde_json::json!({ "subtitles": "x", "targetLanguage": "auto" }),
    );
    let response = build_router(state).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_translate_subtitles() {
    let temp = TempDir::new().unwrap();
    let state = test_state(temp.path(), 1024).with_translator(Arc::new(UpperCase), 10);
    let request = json_request(
        "/api/translate",
        serde_json::json!({
            "subtitles": "1\n00:00:01,000 --> 00:00:02,000\nHello there\n\n2\n00:00:03,000 --> 00:00:04,000\nGeneral Kenobi\n",
            "targetLanguage": "fr"
        }),
    );
    let response = build_router(state).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let translated = json["translated"].as_str().unwrap();
    assert!(translated.contains("00:00:01,000 --> 00:00:02,000\nHELLO THERE"));
    assert!(translated.contains("GENERAL KENOBI"));
}

//! cleantxt-server library interface
//!
//! Exposes the job pipeline and router for the binary and integration tests.

pub mod api;
pub mod channel;
pub mod config;
pub mod error;
pub mod inference;
pub mod job;
pub mod progress_parser;
pub mod stream_writer;
pub mod supervisor;
pub mod translate;
pub mod workspace;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use cleantxt_common::config::UploadConfig;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::job::JobController;
use crate::translate::BatchTranslator;

/// Cancellation tokens of in-flight jobs
#[derive(Clone, Default)]
pub struct JobRegistry {
    cancellation_tokens: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, job_id: Uuid, token: CancellationToken) {
        self.cancellation_tokens.write().await.insert(job_id, token);
    }

    pub async fn remove(&self, job_id: &Uuid) {
        self.cancellation_tokens.write().await.remove(job_id);
    }

    pub async fn len(&self) -> usize {
        self.cancellation_tokens.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Cancel every in-flight job (shutdown); returns how many were signalled
    pub async fn cancel_all(&self) -> usize {
        let tokens = self.cancellation_tokens.read().await;
        for token in tokens.values() {
            token.cancel();
        }
        tokens.len()
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Pipeline shared by all jobs
    pub controller: Arc<JobController>,
    /// Active jobs
    pub jobs: JobRegistry,
    /// Upload size/type constraints
    pub upload: Arc<UploadConfig>,
    /// Subtitle translator, when configured
    pub translator: Option<Arc<dyn BatchTranslator>>,
    pub translation_batch_size: usize,
    /// Capacity of each job's event channel
    pub event_buffer: usize,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(controller: JobController, upload: UploadConfig, event_buffer: usize) -> Self {
        Self {
            controller: Arc::new(controller),
            jobs: JobRegistry::new(),
            upload: Arc::new(upload),
            translator: None,
            translation_batch_size: 20,
            event_buffer,
            startup_time: Utc::now(),
        }
    }

    pub fn with_translator(mut self, translator: Arc<dyn BatchTranslator>, batch_size: usize) -> Self {
        self.translator = Some(translator);
        self.translation_batch_size = batch_size.max(1);
        self
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::transcribe_routes())
        .merge(api::upload_routes())
        .merge(api::translate_routes())
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

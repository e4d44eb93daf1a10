//! Transcription job endpoint
//!
//! `POST /api/transcribe` (multipart: `fileId` | `url`, optional `language`)
//! answers with a `text/event-stream` for the life of the job. Each job event
//! is one SSE frame; the stream closes after the terminal event. Dropping the
//! connection cancels the job.

use axum::{
    extract::{Multipart, State},
    http::header,
    response::{
        sse::{Event, Sse},
        IntoResponse,
    },
    routing::post,
    Router,
};
use cleantxt_common::events::JobEvent;
use cleantxt_common::sse::{heartbeat, job_event_frame};
use futures::StreamExt;
use std::convert::Infallible;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::channel::event_channel;
use crate::error::{ApiError, ApiResult};
use crate::job::JobRequest;
use crate::stream_writer::StreamWriter;
use crate::AppState;

/// Read the job request fields; unknown fields are ignored
async fn read_request(mut multipart: Multipart) -> ApiResult<JobRequest> {
    let mut request = JobRequest::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed form data: {}", e)))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let slot = match name.as_str() {
            "fileId" => &mut request.file_id,
            "url" => &mut request.url,
            "language" => &mut request.language,
            _ => continue,
        };
        let value = field
            .text()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Unreadable field {}: {}", name, e)))?;
        *slot = Some(value);
    }
    Ok(request)
}

fn to_frame(event: &JobEvent) -> Event {
    match job_event_frame(event) {
        Ok(frame) => frame,
        Err(e) => {
            error!(error = %e, event_type = event.event_type(), "Failed to serialize event");
            Event::default()
                .event("error")
                .data(r#"{"type":"error","code":"TRANSCRIPTION_ERROR","message":"Event serialization failed"}"#)
        }
    }
}

/// POST /api/transcribe
pub async fn transcribe(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    let request = read_request(multipart).await?;

    let job_id = Uuid::new_v4();
    let cancel = CancellationToken::new();
    let (events, receiver) = event_channel(state.event_buffer, cancel.clone());
    state.jobs.register(job_id, cancel.clone()).await;

    info!(job_id = %job_id, "Transcription stream opened");

    let controller = state.controller.clone();
    let job_cancel = cancel.clone();
    let job = tokio::spawn(async move { controller.run(job_id, request, events, job_cancel).await });

    let jobs = state.jobs.clone();
    tokio::spawn(async move {
        match job.await {
            Ok(summary) => info!(job_id = %job_id, final_stage = %summary.final_stage, "Job task finished"),
            Err(e) => warn!(job_id = %job_id, error = %e, "Job task aborted"),
        }
        jobs.remove(&job_id).await;
    });

    let stream = StreamWriter::new(job_id, receiver, cancel)
        .into_stream()
        .map(|event| Ok::<_, Infallible>(to_frame(&event)));

    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(stream).keep_alive(heartbeat()),
    ))
}

/// Build transcription routes
pub fn transcribe_routes() -> Router<AppState> {
    Router::new().route("/api/transcribe", post(transcribe))
}

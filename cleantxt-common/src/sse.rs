//! Server-Sent Events (SSE) utilities
//!
//! One [`JobEvent`] maps to one SSE frame: `event: <type>` plus the JSON body
//! on a single `data:` line, terminated by a blank line.

use crate::events::JobEvent;
use axum::response::sse::{Event, KeepAlive};
use std::time::Duration;

/// Interval between keep-alive comments on an idle stream
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Build the SSE frame for a job event
pub fn job_event_frame(event: &JobEvent) -> Result<Event, serde_json::Error> {
    let data = serde_json::to_string(event)?;
    Ok(Event::default().event(event.event_type()).data(data))
}

/// Keep-alive comments so intermediaries do not time out a quiet stream
/// (model loading can print nothing for minutes)
pub fn heartbeat() -> KeepAlive {
    KeepAlive::new().interval(HEARTBEAT_INTERVAL).text("heartbeat")
}

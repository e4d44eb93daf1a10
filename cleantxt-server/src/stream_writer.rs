//! Stream writer: drains a job's event channel onto the client stream
//!
//! Guarantees on the produced stream:
//! - events come out in push order, each validated once
//! - the stream ends right after the first terminal event
//! - if the channel closes without a terminal event (the job task panicked or
//!   was aborted), a `TRANSCRIPTION_ERROR` is synthesized before the end
//!
//! Dropping the stream (client disconnect) cancels the job through the
//! embedded drop guard.

use crate::channel::EventReceiver;
use cleantxt_common::events::{ErrorCode, JobEvent};
use futures::stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct StreamWriter {
    job_id: Uuid,
    events: EventReceiver,
    cancel: CancellationToken,
}

impl StreamWriter {
    pub fn new(job_id: Uuid, events: EventReceiver, cancel: CancellationToken) -> Self {
        Self {
            job_id,
            events,
            cancel,
        }
    }

    /// Consume the writer into the ordered client event stream
    pub fn into_stream(self) -> impl Stream<Item = JobEvent> + Send + 'static {
        let StreamWriter {
            job_id,
            mut events,
            cancel,
        } = self;

        async_stream::stream! {
            let guard = cancel.drop_guard();
            let mut written = 0usize;

            loop {
                match events.recv().await {
                    Some(event) => {
                        let event = event.validated();
                        let terminal = event.is_terminal();
                        written += 1;
                        debug!(job_id = %job_id, event_type = event.event_type(), "Writing event");
                        yield event;
                        if terminal {
                            info!(job_id = %job_id, events = written, "Terminal event written, closing stream");
                            guard.disarm();
                            break;
                        }
                    }
                    None => {
                        warn!(job_id = %job_id, events = written, "Job ended without a terminal event");
                        yield JobEvent::error(
                            ErrorCode::TranscriptionError,
                            "Transcription job ended unexpectedly",
                        );
                        guard.disarm();
                        break;
                    }
                }
            }
        }
    }
}

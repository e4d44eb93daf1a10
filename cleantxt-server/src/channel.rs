//! Per-job event channel
//!
//! An ordered queue between the job (producer) and the stream writer
//! (consumer). The sender is not `Clone`; the job controller owns it and the
//! supervisor borrows it. [`EventSender::finish`] consumes the sender: at most
//! one terminal event is ever enqueued per job.
//!
//! A failed send means the consumer is gone (client disconnected). The sender
//! then cancels the job's token so every stage stops pulling output.

use cleantxt_common::events::JobEvent;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The receiving side has been dropped
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("event stream closed by client")]
pub struct ChannelClosed;

/// Create a bounded event channel tied to a job's cancellation token
pub fn event_channel(capacity: usize, cancel: CancellationToken) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSender { tx, cancel }, EventReceiver { rx })
}

/// Producer half, owned by the job controller
#[derive(Debug)]
pub struct EventSender {
    tx: mpsc::Sender<JobEvent>,
    cancel: CancellationToken,
}

impl EventSender {
    /// Push a non-terminal event
    ///
    /// Waits for queue space (backpressure from a slow client).
    pub async fn send(&self, event: JobEvent) -> Result<(), ChannelClosed> {
        debug_assert!(
            !event.is_terminal(),
            "terminal events go through EventSender::finish"
        );
        self.push(event).await
    }

    /// Push the terminal event and close the channel
    pub async fn finish(self, terminal: JobEvent) -> Result<(), ChannelClosed> {
        debug_assert!(terminal.is_terminal(), "finish requires a terminal event");
        self.push(terminal).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the receiver is dropped, cancelling the job's token
    ///
    /// Lets a stage that produces no output notice a disconnected client.
    pub async fn closed(&self) {
        self.tx.closed().await;
        self.cancel_on_disconnect();
    }

    fn cancel_on_disconnect(&self) {
        if !self.cancel.is_cancelled() {
            debug!("Event receiver dropped, cancelling job");
            self.cancel.cancel();
        }
    }

    async fn push(&self, event: JobEvent) -> Result<(), ChannelClosed> {
        if self.tx.send(event).await.is_err() {
            self.cancel_on_disconnect();
            return Err(ChannelClosed);
        }
        Ok(())
    }
}

/// Consumer half, drained by the stream writer
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<JobEvent>,
}

impl EventReceiver {
    /// Next event in push order; `None` once the sender is gone and the queue is empty
    pub async fn recv(&mut self) -> Option<JobEvent> {
        self.rx.recv().await
    }
}

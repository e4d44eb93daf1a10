//! Event types for the cleantxt job stream
//!
//! Every job streams a sequence of [`JobEvent`]s to its client, ending in exactly
//! one terminal event ([`JobEvent::Error`] or [`JobEvent::Complete`]).

mod progress_types;
mod result_types;

pub use progress_types::{clamp_percent, ProgressData};
pub use result_types::{Segment, Transcription};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Job stream event
///
/// Serialized as a flat JSON object tagged by `type`:
/// `{"type":"progress","progress":42.5,"speed":"3.2MB/s"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobEvent {
    /// Coarse-grained stage announcement
    Status {
        message: String,
    },

    /// Passthrough line with no recognized structure
    Log {
        message: String,
    },

    /// Fine-grained numeric progress
    Progress(ProgressData),

    /// Terminal failure
    Error {
        code: ErrorCode,
        message: String,
    },

    /// Terminal success carrying the final transcription
    Complete {
        transcription: Transcription,
    },
}

impl JobEvent {
    pub fn status(message: impl Into<String>) -> Self {
        JobEvent::Status {
            message: message.into(),
        }
    }

    pub fn log(message: impl Into<String>) -> Self {
        JobEvent::Log {
            message: message.into(),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        JobEvent::Error {
            code,
            message: message.into(),
        }
    }

    /// Get the event type as a string (SSE `event:` field)
    pub fn event_type(&self) -> &'static str {
        match self {
            JobEvent::Status { .. } => "status",
            JobEvent::Log { .. } => "log",
            JobEvent::Progress(_) => "progress",
            JobEvent::Error { .. } => "error",
            JobEvent::Complete { .. } => "complete",
        }
    }

    /// Terminal events end the stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Error { .. } | JobEvent::Complete { .. })
    }

    /// Normalize an event before it is written to a client
    ///
    /// - Progress percent is clamped to [0, 100] (non-finite values become 0)
    /// - An error with an empty message gets the code's description
    pub fn validated(self) -> Self {
        match self {
            JobEvent::Progress(mut data) => {
                data.percent = clamp_percent(data.percent);
                JobEvent::Progress(data)
            }
            JobEvent::Error { code, message } if message.trim().is_empty() => JobEvent::Error {
                code,
                message: code.description().to_string(),
            },
            other => other,
        }
    }
}

/// Fixed error taxonomy surfaced to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Neither file nor remote source supplied, or both
    InvalidInput,
    /// External runtime lacks required packages/binaries
    PythonEnvError,
    /// Input exceeds the configured size ceiling
    PayloadTooLarge,
    /// Subprocess failure, missing/malformed result, or remote endpoint failure
    TranscriptionError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::PythonEnvError => "PYTHON_ENV_ERROR",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::TranscriptionError => "TRANSCRIPTION_ERROR",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "Please provide either an uploaded file or a video URL",
            ErrorCode::PythonEnvError => "Python environment is not ready for transcription",
            ErrorCode::PayloadTooLarge => "Input exceeds the maximum allowed size",
            ErrorCode::TranscriptionError => "Transcription failed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

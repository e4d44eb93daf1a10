//! # cleantxt Common Library
//!
//! Shared code for the cleantxt transcription service and its clients:
//! - Event protocol (JobEvent enum) streamed to clients during a job
//! - Error taxonomy surfaced in terminal error events
//! - Bootstrap configuration loading (TOML + environment)
//! - SSE frame helpers

pub mod config;
pub mod error;
pub mod events;
pub mod sse;

pub use error::{Error, Result};
pub use events::{ErrorCode, JobEvent, ProgressData, Transcription};

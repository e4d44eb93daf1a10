//! Final transcription payload carried by the `complete` event

use serde::{Deserialize, Serialize};

/// Transcription result delivered to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcription {
    /// Full transcript text
    pub text: String,
    /// Language tag the job ran with (or the detected language)
    pub language: String,
    /// Name of the transcript or media file the text came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    /// Per-segment metadata, when the backend provides it
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<Segment>,
}

impl Transcription {
    pub fn new(text: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            language: language.into(),
            source_file: None,
            segments: Vec::new(),
        }
    }
}

/// Timed transcript segment (seconds)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<f64>,
    pub text: String,
}

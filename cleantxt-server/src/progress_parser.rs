//! Progress parser for pipeline subprocess output
//!
//! The pipeline has several emitters (the download helper, tqdm bars inside the
//! transcription library, the transcription script's own markers), so several
//! line formats coexist. [`classify`] maps one raw line to a [`ParsedLine`];
//! it is pure and total: anything it cannot interpret comes back as
//! [`ParsedLine::Log`] carrying the original text unchanged.
//!
//! # Recognized shapes (highest priority first)
//! - `LOG_OUTPUT:{"level": "...", "message": "..."}`
//! - `PROGRESS_OUTPUT:{"progress": 42.0, "description": "..."}`
//! - `JSON_OUTPUT_START` / `JSON_OUTPUT_END` result envelope markers
//! - `CHUNK:<fragment>` result envelope payload
//! - `PROGRESS:<percent>|<speed>|<eta>|<elapsed?>`
//! - yt-dlp `[download]  42.5% of 10.00MiB at 3.20MiB/s ETA 00:10`
//! - tqdm `37%|█████     | 370/1000 [00:20<00:34, 18.50s/it]`, optionally after `TRANSCRIBE_PROGRESS:`
//! - bare `NN%|` anywhere in the line
//!
//! The result envelope spans many lines, so its accumulation lives in
//! [`ResultCollector`], one per output stream.

use cleantxt_common::events::{JobEvent, ProgressData};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

pub const LOG_MARKER: &str = "LOG_OUTPUT:";
pub const PROGRESS_MARKER: &str = "PROGRESS_OUTPUT:";
pub const TRANSCRIBE_MARKER: &str = "TRANSCRIBE_PROGRESS:";
pub const RESULT_START_MARKER: &str = "JSON_OUTPUT_START";
pub const RESULT_END_MARKER: &str = "JSON_OUTPUT_END";
pub const CHUNK_PREFIX: &str = "CHUNK:";

static DELIMITED_PROGRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^PROGRESS:\s*(-?\d+(?:\.\d+)?)\|([^|]*)\|([^|]*)(?:\|([^|]*))?\|?$")
        .expect("valid delimited progress regex")
});

static YTDLP_PROGRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\[download\]\s+(\d+(?:\.\d+)?)%\s+of\s+~?\s*(\S+)(?:\s+at\s+(\S+))?(?:\s+ETA\s+(\S+))?",
    )
    .expect("valid yt-dlp progress regex")
});

static BAR_FRACTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(\d+(?:\.\d+)?)%\|[^|]*\|\s*(\d+)/(\d+)\s*\[([^<\]]+)<([^,\]]+),\s*([0-9.]+|\?)\s*(s/it|it/s)\]",
    )
    .expect("valid bar-and-fraction regex")
});

static PERCENT_PIPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)%\|").expect("valid percent-pipe regex"));

/// Classification of one line of subprocess output
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Status(String),
    Log(String),
    Progress(ProgressData),
    ResultStart,
    ResultChunk(String),
    ResultEnd,
}

impl ParsedLine {
    /// Client-facing event for this line; envelope markers and chunks have none
    pub fn into_event(self) -> Option<JobEvent> {
        match self {
            ParsedLine::Status(message) => Some(JobEvent::Status { message }),
            ParsedLine::Log(message) => Some(JobEvent::Log { message }),
            ParsedLine::Progress(data) => Some(JobEvent::Progress(data)),
            ParsedLine::ResultStart | ParsedLine::ResultChunk(_) | ParsedLine::ResultEnd => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LogPayload {
    level: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ProgressPayload {
    progress: f64,
    #[serde(default)]
    description: Option<String>,
}

/// Classify one line of subprocess output
pub fn classify(line: &str) -> ParsedLine {
    let trimmed = line.trim();

    if let Some(rest) = trimmed.strip_prefix(LOG_MARKER) {
        return match serde_json::from_str::<LogPayload>(rest.trim()) {
            Ok(payload) => match payload.level.to_ascii_lowercase().as_str() {
                "info" | "status" => ParsedLine::Status(payload.message),
                _ => ParsedLine::Log(payload.message),
            },
            Err(_) => ParsedLine::Log(line.to_string()),
        };
    }

    if let Some(rest) = trimmed.strip_prefix(PROGRESS_MARKER) {
        return match serde_json::from_str::<ProgressPayload>(rest.trim()) {
            Ok(payload) => ParsedLine::Progress(ProgressData {
                description: payload.description.filter(|d| !d.is_empty()),
                ..ProgressData::new(payload.progress)
            }),
            Err(_) => ParsedLine::Log(line.to_string()),
        };
    }

    if trimmed == RESULT_START_MARKER {
        return ParsedLine::ResultStart;
    }
    if trimmed == RESULT_END_MARKER {
        return ParsedLine::ResultEnd;
    }

    // Chunk payloads are JSON fragments: only leading whitespace may be dropped
    if let Some(fragment) = line.trim_start().strip_prefix(CHUNK_PREFIX) {
        return ParsedLine::ResultChunk(fragment.to_string());
    }

    if let Some(progress) = parse_delimited(trimmed) {
        return ParsedLine::Progress(progress);
    }

    if let Some(progress) = parse_ytdlp(trimmed) {
        return ParsedLine::Progress(progress);
    }

    let body = trimmed
        .strip_prefix(TRANSCRIBE_MARKER)
        .map(str::trim)
        .unwrap_or(trimmed);

    if let Some(progress) = parse_bar_fraction(body) {
        return ParsedLine::Progress(progress);
    }

    if let Some(progress) = parse_percent_pipe(body) {
        return ParsedLine::Progress(progress);
    }

    ParsedLine::Log(line.to_string())
}

fn non_empty(field: Option<regex::Match<'_>>) -> Option<String> {
    field
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_delimited(line: &str) -> Option<ProgressData> {
    let caps = DELIMITED_PROGRESS.captures(line)?;
    let percent: f64 = caps.get(1)?.as_str().parse().ok()?;
    Some(ProgressData {
        speed: non_empty(caps.get(2)),
        eta: non_empty(caps.get(3)),
        time_elapsed: non_empty(caps.get(4)),
        ..ProgressData::new(percent)
    })
}

fn parse_ytdlp(line: &str) -> Option<ProgressData> {
    let caps = YTDLP_PROGRESS.captures(line)?;
    let percent: f64 = caps.get(1)?.as_str().parse().ok()?;
    let known = |s: String| (!s.starts_with("Unknown")).then_some(s);
    Some(ProgressData {
        speed: non_empty(caps.get(3)).and_then(known),
        eta: non_empty(caps.get(4)).and_then(known),
        description: non_empty(caps.get(2)).map(|size| format!("Downloading {}", size)),
        ..ProgressData::new(percent)
    })
}

fn parse_bar_fraction(line: &str) -> Option<ProgressData> {
    let caps = BAR_FRACTION.captures(line)?;
    let percent: f64 = caps.get(1)?.as_str().parse().ok()?;
    let rate = caps
        .get(6)
        .map(|m| m.as_str())
        .filter(|r| *r != "?")
        .map(|r| format!("{} chunks/sec", r));
    Some(ProgressData {
        current_step: non_empty(caps.get(2)),
        total_steps: non_empty(caps.get(3)),
        time_elapsed: non_empty(caps.get(4)),
        eta: non_empty(caps.get(5)).filter(|eta| eta != "?"),
        steps_per_second: rate,
        ..ProgressData::new(percent)
    })
}

fn parse_percent_pipe(line: &str) -> Option<ProgressData> {
    let caps = PERCENT_PIPE.captures(line)?;
    let percent: f64 = caps.get(1)?.as_str().parse().ok()?;
    Some(ProgressData::new(percent))
}

/// Outcome of feeding one classified line through a [`ResultCollector`]
#[derive(Debug, Clone, PartialEq)]
pub enum Collected {
    /// Forward this line's event (if any) to the client
    Forward(ParsedLine),
    /// Line was consumed by an open envelope
    Absorbed,
    /// Envelope closed and its payload parsed as JSON
    Result(serde_json::Value),
    /// Envelope closed (or was abandoned) with a payload that is not JSON
    Malformed(String),
}

/// Accumulates a `JSON_OUTPUT_START` … `JSON_OUTPUT_END` envelope
///
/// Between the markers, `CHUNK:` fragments are concatenated verbatim and any
/// other unstructured line is appended as-is (the download helper prints its
/// JSON without the chunk prefix). Status and progress lines keep flowing to
/// the client while the envelope is open.
#[derive(Debug, Default)]
pub struct ResultCollector {
    buffer: Option<String>,
}

impl ResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.buffer.is_some()
    }

    /// Feed a raw line and its classification
    pub fn accept(&mut self, raw: &str, parsed: ParsedLine) -> Collected {
        match parsed {
            ParsedLine::ResultStart => match self.buffer.replace(String::new()) {
                Some(previous) if !previous.trim().is_empty() => Collected::Malformed(previous),
                _ => Collected::Absorbed,
            },
            ParsedLine::ResultChunk(fragment) => match self.buffer.as_mut() {
                Some(buffer) => {
                    buffer.push_str(&fragment);
                    Collected::Absorbed
                }
                None => Collected::Forward(ParsedLine::Log(raw.to_string())),
            },
            ParsedLine::ResultEnd => match self.buffer.take() {
                Some(payload) => match serde_json::from_str(payload.trim()) {
                    Ok(value) => Collected::Result(value),
                    Err(_) => Collected::Malformed(payload),
                },
                None => Collected::Forward(ParsedLine::Log(raw.to_string())),
            },
            ParsedLine::Log(text) if is_marked(raw) => Collected::Forward(ParsedLine::Log(text)),
            ParsedLine::Log(text) => match self.buffer.as_mut() {
                Some(buffer) => {
                    buffer.push_str(text.trim());
                    Collected::Absorbed
                }
                None => Collected::Forward(ParsedLine::Log(text)),
            },
            other => Collected::Forward(other),
        }
    }

    /// Stream ended; return the payload of an envelope that was never closed
    pub fn finish(&mut self) -> Option<String> {
        self.buffer.take().filter(|payload| !payload.trim().is_empty())
    }
}

/// Line carries one of the emitter markers, so it is never part of a payload
fn is_marked(raw: &str) -> bool {
    let trimmed = raw.trim_start();
    [LOG_MARKER, PROGRESS_MARKER, TRANSCRIBE_MARKER]
        .iter()
        .any(|marker| trimmed.starts_with(marker))
}

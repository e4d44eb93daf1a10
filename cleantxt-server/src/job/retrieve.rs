//! Retrieve stage: locate and read the transcript the transcribe stage wrote

use super::JobError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Output directory the transcription library writes under its input directory
pub const TRANSCRIPTIONS_DIR: &str = "v2clntxt_transcriptions";

/// Sentence-cleaned results, preferred over the raw transcripts
pub const CLEANED_RESULTS_DIR: &str = "results_SC_pipeline";

/// Structured result printed by the transcription script
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StructuredResult {
    #[serde(default)]
    pub text_output_dir: Option<PathBuf>,
    #[serde(default)]
    pub metadata_output_dir: Option<PathBuf>,
    #[serde(default)]
    pub detected_language: Option<String>,
}

impl StructuredResult {
    pub fn from_value(value: serde_json::Value) -> Result<Self, JobError> {
        serde_json::from_value(value)
            .map_err(|e| JobError::MalformedResult(format!("unexpected result shape: {}", e)))
    }

    /// Detected language, when it is a concrete tag
    pub fn language(&self) -> Option<&str> {
        self.detected_language
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.eq_ignore_ascii_case("auto"))
    }
}

/// Transcript read from the workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedTranscript {
    pub text: String,
    pub file_name: String,
}

/// Directories searched for the transcript, in order
pub fn candidate_dirs(workspace: &Path, structured: Option<&StructuredResult>) -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    if let Some(dir) = structured.and_then(|s| s.text_output_dir.as_deref()) {
        let dir = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            workspace.join(dir)
        };
        dirs.push(dir.join(CLEANED_RESULTS_DIR));
        dirs.push(dir);
    }

    let default = workspace.join(TRANSCRIPTIONS_DIR);
    dirs.push(default.join(CLEANED_RESULTS_DIR));
    dirs.push(default);
    dirs
}

/// Read the lexicographically first `.txt` transcript from the candidate directories
///
/// Directories outside the workspace are ignored.
pub async fn retrieve_transcript(
    workspace: &Path,
    structured: Option<&StructuredResult>,
) -> Result<RetrievedTranscript, JobError> {
    let root = tokio::fs::canonicalize(workspace).await.map_err(|e| {
        JobError::ResultMissing(format!("workspace unavailable: {}", e))
    })?;

    for dir in candidate_dirs(workspace, structured) {
        let Ok(dir) = tokio::fs::canonicalize(&dir).await else {
            continue;
        };
        if !dir.starts_with(&root) {
            warn!(dir = %dir.display(), "Result directory outside workspace ignored");
            continue;
        }
        let Some(file) = first_transcript(&dir).await? else {
            continue;
        };

        debug!(file = %file.display(), "Reading transcript");
        let text = tokio::fs::read_to_string(&file).await.map_err(|e| {
            JobError::ResultMissing(format!("transcript unreadable ({}): {}", file.display(), e))
        })?;
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(JobError::ResultMissing(format!(
                "transcript is empty: {}",
                file.display()
            )));
        }

        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        return Ok(RetrievedTranscript { text, file_name });
    }

    Err(JobError::ResultMissing(
        "No transcription files found".to_string(),
    ))
}

async fn first_transcript(dir: &Path) -> Result<Option<PathBuf>, JobError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return Ok(None),
    };

    let mut transcripts = Vec::new();
    loop {
        let entry = entries.next_entry().await.map_err(|e| {
            JobError::ResultMissing(format!("cannot list {}: {}", dir.display(), e))
        })?;
        let Some(entry) = entry else { break };
        let path = entry.path();
        let is_txt = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("txt"))
            .unwrap_or(false);
        if is_txt && path.is_file() {
            transcripts.push(path);
        }
    }
    transcripts.sort();
    Ok(transcripts.into_iter().next())
}

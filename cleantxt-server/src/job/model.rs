//! Job data model: request validation, input variants and the stage machine

use super::JobError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Raw transcription request fields as submitted by the client
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub file_id: Option<String>,
    pub url: Option<String>,
    pub language: Option<String>,
}

/// Where the job's media comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobInput {
    /// Previously uploaded file; the upload directory becomes the workspace
    UploadedWorkspace { path: PathBuf },
    /// Remote video link, downloaded into a fresh workspace
    RemoteSource { url: String },
}

impl JobInput {
    pub fn kind(&self) -> &'static str {
        match self {
            JobInput::UploadedWorkspace { .. } => "upload",
            JobInput::RemoteSource { .. } => "remote",
        }
    }
}

/// Language tag: `auto` or a short ISO-like code (`en`, `pt-BR`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LanguageTag(String);

impl LanguageTag {
    pub const AUTO: &'static str = "auto";

    pub fn auto() -> Self {
        LanguageTag(Self::AUTO.to_string())
    }

    pub fn parse(raw: &str) -> Result<Self, JobError> {
        let tag = raw.trim();
        if tag.is_empty() || tag.eq_ignore_ascii_case(Self::AUTO) {
            return Ok(Self::auto());
        }
        let well_formed = (2..=8).contains(&tag.len())
            && tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !tag.starts_with('-')
            && !tag.ends_with('-');
        if !well_formed {
            return Err(JobError::InvalidInput(format!(
                "Unsupported language tag: {}",
                tag
            )));
        }
        Ok(LanguageTag(tag.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_auto(&self) -> bool {
        self.0 == Self::AUTO
    }
}

impl fmt::Display for LanguageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl JobRequest {
    /// Validate the request against the uploads root
    ///
    /// Exactly one of `fileId` and `url` must be present (blank counts as
    /// absent). Runs before anything else in a job: no subprocess, no
    /// workspace.
    pub fn validate(&self, uploads_root: &Path) -> Result<(JobInput, LanguageTag), JobError> {
        let file_id = non_blank(self.file_id.as_deref());
        let url = non_blank(self.url.as_deref());

        let input = match (file_id, url) {
            (None, None) => {
                return Err(JobError::InvalidInput(
                    "Please provide either a file or a YouTube URL".to_string(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(JobError::InvalidInput(
                    "Provide either a file or a URL, not both".to_string(),
                ))
            }
            (Some(id), None) => {
                let id = Uuid::parse_str(id).map_err(|_| {
                    JobError::InvalidInput(format!("Malformed file identifier: {}", id))
                })?;
                let path = uploads_root.join(id.to_string());
                if !path.is_dir() {
                    return Err(JobError::InvalidInput(format!(
                        "Uploaded file not found: {}",
                        id
                    )));
                }
                JobInput::UploadedWorkspace { path }
            }
            (None, Some(url)) => {
                if !(url.starts_with("https://") || url.starts_with("http://"))
                    || url.chars().any(char::is_whitespace)
                {
                    return Err(JobError::InvalidInput(format!(
                        "Unsupported video URL: {}",
                        url
                    )));
                }
                JobInput::RemoteSource {
                    url: url.to_string(),
                }
            }
        };

        let language = match self.language.as_deref() {
            Some(raw) => LanguageTag::parse(raw)?,
            None => LanguageTag::auto(),
        };

        Ok((input, language))
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Pipeline stage
///
/// Progression is forward-only; stages may be skipped (an upload has no
/// acquire stage) but never revisited. `Failed` is reachable from any
/// non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Preflight,
    AcquireInput,
    Transcribe,
    Retrieve,
    Cleanup,
    Done,
    Failed,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }

    /// Whether `self → next` is a legal transition
    pub fn can_advance_to(&self, next: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Stage::Failed => true,
            Stage::Done => *self == Stage::Cleanup,
            _ => next > *self,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Preflight => "preflight",
            Stage::AcquireInput => "acquire_input",
            Stage::Transcribe => "transcribe",
            Stage::Retrieve => "retrieve",
            Stage::Cleanup => "cleanup",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One transcription job, owned by the controller for its lifetime
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub input: JobInput,
    pub language: LanguageTag,
    /// Set once the workspace is acquired
    pub workspace: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    stage: Stage,
}

impl Job {
    pub fn new(id: Uuid, input: JobInput, language: LanguageTag) -> Self {
        Self {
            id,
            input,
            language,
            workspace: None,
            started_at: Utc::now(),
            stage: Stage::Preflight,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Move to `next`, rejecting backwards or post-terminal transitions
    pub fn advance(&mut self, next: Stage) -> Result<(), JobError> {
        if !self.stage.can_advance_to(next) {
            return Err(JobError::StageTransition {
                from: self.stage,
                to: next,
            });
        }
        tracing::debug!(job_id = %self.id, from = %self.stage, to = %next, "Stage transition");
        self.stage = next;
        Ok(())
    }

    pub fn elapsed_seconds(&self) -> u64 {
        Utc::now()
            .signed_duration_since(self.started_at)
            .num_seconds()
            .max(0) as u64
    }
}

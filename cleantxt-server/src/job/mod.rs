//! Job controller
//!
//! Sequences one transcription job through its stages:
//!
//! ```text
//! validate → preflight → acquire workspace → [acquire input] → transcribe → retrieve → cleanup
//! ```
//!
//! Every path ends with exactly one terminal event. Once a workspace has been
//! acquired it is released before the terminal event is enqueued, so a client
//! that sees the stream close will find the directory gone. Nothing is retried.

mod model;
pub mod preflight;
pub mod retrieve;

pub use model::{Job, JobInput, JobRequest, LanguageTag, Stage};
pub use preflight::{Preflight, PreflightError, PythonPreflight};
pub use retrieve::{retrieve_transcript, StructuredResult};

use crate::channel::EventSender;
use crate::inference::{InferenceClient, InferenceError};
use crate::supervisor::{run_stage, ExitOutcome, StageCommand, StageReport, SupervisorError};
use crate::workspace::{Workspace, WorkspaceManager, WorkspaceSource, DOWNLOADED_MEDIA_FILE};
use cleantxt_common::config::InferenceBackend;
use cleantxt_common::events::{ErrorCode, JobEvent, Transcription};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Stderr lines quoted in a stage failure message
const FAILURE_STDERR_LINES: usize = 3;

/// Every way a job can fail, each mapped to a client-facing [`ErrorCode`]
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Preflight(#[from] PreflightError),

    #[error("Input is {size} bytes, above the {limit} byte limit")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("Could not start the {stage} stage: {source}")]
    Spawn {
        stage: &'static str,
        #[source]
        source: SupervisorError,
    },

    #[error("The {stage} stage failed: {detail}")]
    StageFailed { stage: &'static str, detail: String },

    #[error("The {stage} stage timed out after {}s", .after.as_secs())]
    TimedOut { stage: &'static str, after: Duration },

    #[error("Transcription result missing: {0}")]
    ResultMissing(String),

    #[error("Transcription result malformed: {0}")]
    MalformedResult(String),

    #[error("Remote transcription failed: {0}")]
    Inference(#[from] InferenceError),

    #[error("Workspace unavailable: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("Invalid stage transition {from} → {to}")]
    StageTransition { from: Stage, to: Stage },

    #[error("Job cancelled")]
    Cancelled,
}

impl JobError {
    pub fn code(&self) -> ErrorCode {
        match self {
            JobError::InvalidInput(_) => ErrorCode::InvalidInput,
            JobError::Preflight(_) => ErrorCode::PythonEnvError,
            JobError::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            JobError::Spawn { source, .. } => match source.io_kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    ErrorCode::PythonEnvError
                }
                _ => ErrorCode::TranscriptionError,
            },
            JobError::StageFailed { .. }
            | JobError::TimedOut { .. }
            | JobError::ResultMissing(_)
            | JobError::MalformedResult(_)
            | JobError::Inference(_)
            | JobError::Workspace(_)
            | JobError::StageTransition { .. }
            | JobError::Cancelled => ErrorCode::TranscriptionError,
        }
    }

    pub fn into_event(self) -> JobEvent {
        JobEvent::error(self.code(), self.to_string())
    }
}

/// Values substituted into stage argument templates
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    pub workspace: String,
    pub output: String,
    pub url: String,
    pub language: String,
}

/// Program plus argument template with `{workspace}`, `{output}`, `{url}`, `{language}` placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn render(&self, vars: &TemplateVars) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{workspace}", &vars.workspace)
                    .replace("{output}", &vars.output)
                    .replace("{url}", &vars.url)
                    .replace("{language}", &vars.language)
            })
            .collect()
    }
}

/// Process-wide pipeline configuration shared by all jobs
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub download: CommandTemplate,
    pub transcribe: CommandTemplate,
    /// Environment overrides for every stage process
    pub env: BTreeMap<String, String>,
    pub acquire_timeout: Duration,
    pub transcribe_timeout: Duration,
    /// Ceiling on the media file a job may transcribe
    pub max_input_bytes: u64,
    pub backend: InferenceBackend,
}

impl PipelineSettings {
    /// Standard Python invocation of the download and transcription scripts
    pub fn python(interpreter: &str, download_script: &Path, transcribe_script: &Path) -> Self {
        let download_script = download_script.to_string_lossy();
        let transcribe_script = transcribe_script.to_string_lossy();
        Self {
            download: CommandTemplate::new(
                interpreter,
                &[download_script.as_ref(), "download", "{output}", "{url}"],
            ),
            transcribe: CommandTemplate::new(
                interpreter,
                &[transcribe_script.as_ref(), "{workspace}", "{language}"],
            ),
            env: BTreeMap::new(),
            acquire_timeout: Duration::from_secs(30 * 60),
            transcribe_timeout: Duration::from_secs(2 * 60 * 60),
            max_input_bytes: 2 * 1024 * 1024 * 1024,
            backend: InferenceBackend::Local,
        }
    }
}

/// How a job ended, for logging and the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub job_id: Uuid,
    /// `Err` carries the code of the terminal error event
    pub outcome: Result<(), ErrorCode>,
    pub final_stage: Stage,
    pub elapsed: Duration,
}

/// Drives jobs from request to terminal event
pub struct JobController {
    settings: PipelineSettings,
    workspaces: WorkspaceManager,
    preflight: Arc<dyn Preflight>,
    inference: Option<Arc<InferenceClient>>,
}

impl JobController {
    pub fn new(
        settings: PipelineSettings,
        workspaces: WorkspaceManager,
        preflight: Arc<dyn Preflight>,
    ) -> Self {
        Self {
            settings,
            workspaces,
            preflight,
            inference: None,
        }
    }

    /// Attach the remote inference client used by the remote backend
    pub fn with_inference(mut self, client: Arc<InferenceClient>) -> Self {
        self.inference = Some(client);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Run one job to completion
    ///
    /// Consumes the event sender: the terminal event is always the last event
    /// enqueued. Never panics on job failure; all failures become an `error`
    /// event.
    pub async fn run(
        &self,
        job_id: Uuid,
        request: JobRequest,
        events: EventSender,
        cancel: CancellationToken,
    ) -> JobSummary {
        let started = Instant::now();

        // Step 1: Validate input (no side effects on failure)
        let (input, language) = match request.validate(self.workspaces.uploads_root()) {
            Ok(validated) => validated,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Rejected job input");
                return finish_without_workspace(job_id, Stage::Preflight, events, e, started)
                    .await;
            }
        };

        let mut job = Job::new(job_id, input, language);
        info!(
            job_id = %job.id,
            input = job.input.kind(),
            language = %job.language,
            "Job started"
        );

        // Step 2: Preflight (no workspace allocated on failure)
        if let Err(e) = self.run_preflight(&events, &cancel).await {
            return finish_without_workspace(job_id, job.stage(), events, e, started).await;
        }

        // Step 3: Acquire workspace
        let source = match &job.input {
            JobInput::UploadedWorkspace { path } => WorkspaceSource::Existing(path.clone()),
            JobInput::RemoteSource { .. } => WorkspaceSource::Fresh(job.id),
        };
        let workspace = match self.workspaces.acquire(source).await {
            Ok(workspace) => workspace,
            Err(e) => {
                let err = match (&job.input, e.kind()) {
                    (JobInput::UploadedWorkspace { .. }, std::io::ErrorKind::AlreadyExists) => {
                        warn!(job_id = %job.id, error = %e, "Upload already claimed by another job");
                        JobError::InvalidInput(
                            "This file is already being transcribed by another job".to_string(),
                        )
                    }
                    _ => {
                        error!(job_id = %job.id, error = %e, "Workspace acquisition failed");
                        JobError::Workspace(e)
                    }
                };
                return finish_without_workspace(job_id, job.stage(), events, err, started).await;
            }
        };
        job.workspace = Some(workspace.path().to_path_buf());

        // Steps 4-6: Stages
        let outcome = self.run_stages(&mut job, &workspace, &events, &cancel).await;

        // Step 7: Cleanup, always before the terminal event
        if let Err(e) = job.advance(Stage::Cleanup) {
            debug!(job_id = %job.id, error = %e, "Cleanup transition skipped");
        }
        if !cancel.is_cancelled()
            && events
                .send(JobEvent::status("Cleaning up..."))
                .await
                .is_err()
        {
            debug!(job_id = %job.id, "Client gone before cleanup status");
        }
        if let Err(e) = workspace.release().await {
            warn!(job_id = %job.id, error = %e, "Workspace cleanup failed");
        }

        // Step 8: Terminal event
        let (terminal, final_stage, result) = match outcome {
            Ok(transcription) => (
                JobEvent::Complete { transcription },
                Stage::Done,
                Ok(()),
            ),
            Err(e) => {
                let code = e.code();
                if matches!(e, JobError::Cancelled) {
                    info!(job_id = %job.id, stage = %job.stage(), "Job cancelled");
                } else {
                    error!(job_id = %job.id, code = %code, error = %e, "Job failed");
                }
                (e.into_event(), Stage::Failed, Err(code))
            }
        };
        if let Err(e) = job.advance(final_stage) {
            debug!(job_id = %job.id, error = %e, "Final transition skipped");
        }
        if events.finish(terminal).await.is_err() {
            debug!(job_id = %job.id, "Client gone before terminal event");
        }

        let summary = JobSummary {
            job_id,
            outcome: result,
            final_stage: job.stage(),
            elapsed: started.elapsed(),
        };
        info!(
            job_id = %job_id,
            outcome = ?summary.outcome,
            elapsed_secs = job.elapsed_seconds(),
            "Job finished"
        );
        summary
    }

    async fn run_preflight(
        &self,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        announce(events, "Checking Python environment...").await?;
        let checked = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(JobError::Cancelled),
            checked = self.preflight.check() => checked,
        };
        checked.map_err(|e| {
            warn!(error = %e, "Preflight check failed");
            JobError::from(e)
        })
    }

    async fn run_stages(
        &self,
        job: &mut Job,
        workspace: &Workspace,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<Transcription, JobError> {
        let vars = TemplateVars {
            workspace: workspace.path().to_string_lossy().into_owned(),
            output: workspace
                .path()
                .join(DOWNLOADED_MEDIA_FILE)
                .to_string_lossy()
                .into_owned(),
            url: match &job.input {
                JobInput::RemoteSource { url } => url.clone(),
                JobInput::UploadedWorkspace { .. } => String::new(),
            },
            language: job.language.to_string(),
        };

        // Step 4: Acquire input (remote sources only)
        if matches!(job.input, JobInput::RemoteSource { .. }) {
            job.advance(Stage::AcquireInput)?;
            announce(events, "Downloading video...").await?;
            let command =
                self.stage_command("acquire", &self.settings.download, &vars, self.settings.acquire_timeout);
            self.supervise(&command, events, cancel).await?;
            announce(events, "Download complete").await?;
        }
        ensure_live(cancel)?;

        let media = self.locate_media(job, workspace).await?;
        debug!(job_id = %job.id, media = %media.display(), "Media file located");

        // Step 5: Transcribe
        job.advance(Stage::Transcribe)?;
        announce(events, "Starting transcription...").await?;

        let mut transcription = match self.settings.backend {
            InferenceBackend::Local => {
                let command = self.stage_command(
                    "transcribe",
                    &self.settings.transcribe,
                    &vars,
                    self.settings.transcribe_timeout,
                );
                let report = self.supervise(&command, events, cancel).await?;
                let structured = structured_result(report)?;
                ensure_live(cancel)?;

                // Step 6: Retrieve
                job.advance(Stage::Retrieve)?;
                announce(events, "Reading transcription results...").await?;
                let transcript = retrieve_transcript(workspace.path(), structured.as_ref()).await?;
                let language = structured
                    .as_ref()
                    .and_then(|s| s.language())
                    .unwrap_or(job.language.as_str())
                    .to_string();
                Transcription {
                    source_file: Some(transcript.file_name),
                    ..Transcription::new(transcript.text, language)
                }
            }
            InferenceBackend::Remote => {
                let client = self.inference.as_ref().ok_or_else(|| JobError::StageFailed {
                    stage: "transcribe",
                    detail: "remote inference backend is not configured".to_string(),
                })?;
                let transcription = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(JobError::Cancelled),
                    result = client.transcribe(&media, job.language.as_str()) => result?,
                };
                job.advance(Stage::Retrieve)?;
                transcription
            }
        };
        ensure_live(cancel)?;

        if transcription.source_file.is_none() {
            transcription.source_file = media
                .file_name()
                .map(|n| n.to_string_lossy().into_owned());
        }
        announce(events, "Transcription complete").await?;
        Ok(transcription)
    }

    fn stage_command(
        &self,
        stage: &'static str,
        template: &CommandTemplate,
        vars: &TemplateVars,
        timeout: Duration,
    ) -> StageCommand {
        let mut env = self.settings.env.clone();
        env.entry("PYTHONUNBUFFERED".to_string())
            .or_insert_with(|| "1".to_string());
        StageCommand {
            stage,
            program: template.program.clone(),
            args: template.render(vars),
            env,
            current_dir: None,
            timeout,
        }
    }

    async fn supervise(
        &self,
        command: &StageCommand,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<StageReport, JobError> {
        let report = run_stage(command, events, cancel)
            .await
            .map_err(|source| JobError::Spawn {
                stage: command.stage,
                source,
            })?;

        match &report.outcome {
            ExitOutcome::Success => Ok(report),
            ExitOutcome::Failed { code, signal } => {
                let status = match (code, signal) {
                    (Some(code), _) => format!("exit code {}", code),
                    (None, Some(signal)) => format!("killed by signal {}", signal),
                    (None, None) => "abnormal exit".to_string(),
                };
                let detail = match report.stderr_summary(FAILURE_STDERR_LINES) {
                    Some(stderr) => format!("{}: {}", status, stderr),
                    None => status,
                };
                Err(JobError::StageFailed {
                    stage: command.stage,
                    detail,
                })
            }
            ExitOutcome::TimedOut(after) => Err(JobError::TimedOut {
                stage: command.stage,
                after: *after,
            }),
            ExitOutcome::Cancelled => Err(JobError::Cancelled),
        }
    }

    /// The media file the transcribe stage will read, with the size ceiling enforced
    async fn locate_media(&self, job: &Job, workspace: &Workspace) -> Result<PathBuf, JobError> {
        let media = workspace
            .find_media_file()
            .await
            .map_err(JobError::Workspace)?
            .ok_or_else(|| match job.input {
                JobInput::UploadedWorkspace { .. } => {
                    JobError::InvalidInput("Uploaded file not found".to_string())
                }
                JobInput::RemoteSource { .. } => JobError::StageFailed {
                    stage: "acquire",
                    detail: "download produced no media file".to_string(),
                },
            })?;

        let size = tokio::fs::metadata(&media)
            .await
            .map_err(JobError::Workspace)?
            .len();
        if size > self.settings.max_input_bytes {
            return Err(JobError::PayloadTooLarge {
                size,
                limit: self.settings.max_input_bytes,
            });
        }
        Ok(media)
    }
}

fn structured_result(report: StageReport) -> Result<Option<StructuredResult>, JobError> {
    match (report.result, report.malformed_result) {
        (Some(value), _) => StructuredResult::from_value(value).map(Some),
        (None, Some(payload)) => Err(JobError::MalformedResult(format!(
            "{} bytes of unparseable output",
            payload.len()
        ))),
        (None, None) => Ok(None),
    }
}

async fn announce(events: &EventSender, message: &str) -> Result<(), JobError> {
    events
        .send(JobEvent::status(message))
        .await
        .map_err(|_| JobError::Cancelled)
}

fn ensure_live(cancel: &CancellationToken) -> Result<(), JobError> {
    if cancel.is_cancelled() {
        return Err(JobError::Cancelled);
    }
    Ok(())
}

async fn finish_without_workspace(
    job_id: Uuid,
    stage: Stage,
    events: EventSender,
    err: JobError,
    started: Instant,
) -> JobSummary {
    let code = err.code();
    info!(job_id = %job_id, code = %code, error = %err, "Job ended before workspace allocation");
    if events.finish(err.into_event()).await.is_err() {
        debug!(job_id = %job_id, "Client gone before terminal event");
    }
    JobSummary {
        job_id,
        outcome: Err(code),
        final_stage: if stage.is_terminal() { stage } else { Stage::Failed },
        elapsed: started.elapsed(),
    }
}

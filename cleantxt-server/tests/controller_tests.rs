//! Job controller scenarios driven by shell-script stages
#![cfg(unix)]

use async_trait::async_trait;
use cleantxt_common::events::{ErrorCode, JobEvent};
use cleantxt_server::channel::{event_channel, EventReceiver};
use cleantxt_server::job::{
    CommandTemplate, JobController, JobRequest, PipelineSettings, Preflight, PreflightError,
    Stage,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Preflight stub counting how often it ran
struct StubPreflight {
    calls: AtomicUsize,
    missing: Vec<String>,
}

impl StubPreflight {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            missing: Vec::new(),
        })
    }

    fn missing(modules: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            missing: modules.iter().map(|m| m.to_string()).collect(),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Preflight for StubPreflight {
    async fn check(&self) -> Result<(), PreflightError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.missing.is_empty() {
            Ok(())
        } else {
            Err(PreflightError::MissingModules(self.missing.clone()))
        }
    }
}

struct Fixture {
    _root: TempDir,
    uploads: std::path::PathBuf,
    jobs: std::path::PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let uploads = root.path().join("uploads");
        let jobs = root.path().join("jobs");
        std::fs::create_dir_all(&uploads).unwrap();
        std::fs::create_dir_all(&jobs).unwrap();
        Self {
            _root: root,
            uploads,
            jobs,
        }
    }

    /// Stage an uploaded file the way the upload endpoint does
    fn upload(&self, name: &str, bytes: &[u8]) -> Uuid {
        let id = Uuid::new_v4();
        let dir = self.uploads.join(id.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(name), bytes).unwrap();
        id
    }

    fn controller(
        &self,
        download: &str,
        transcribe: &str,
        preflight: Arc<StubPreflight>,
    ) -> Arc<JobController> {
        let mut settings = PipelineSettings::python(
            "sh",
            Path::new("unused-download.py"),
            Path::new("unused-transcribe.py"),
        );
        settings.download = CommandTemplate::new("sh", &["-c", download, "sh", "{output}", "{url}"]);
        settings.transcribe =
            CommandTemplate::new("sh", &["-c", transcribe, "sh", "{workspace}", "{language}"]);
        settings.acquire_timeout = Duration::from_secs(10);
        settings.transcribe_timeout = Duration::from_secs(10);

        let workspaces =
            cleantxt_server::workspace::WorkspaceManager::new(&self.uploads, &self.jobs);
        Arc::new(JobController::new(settings, workspaces, preflight))
    }

    fn jobs_dir_entries(&self) -> usize {
        std::fs::read_dir(&self.jobs).unwrap().count()
    }
}

async fn drain(mut rx: EventReceiver) -> Vec<JobEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn terminal_error(events: &[JobEvent]) -> (ErrorCode, String) {
    match events.last() {
        Some(JobEvent::Error { code, message }) => (*code, message.clone()),
        other => panic!("expected terminal error, got {:?}", other),
    }
}

fn assert_single_terminal(events: &[JobEvent]) {
    let terminals = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminals, 1, "events: {:?}", events);
    assert!(events.last().map(JobEvent::is_terminal).unwrap_or(false));
}

const WRITE_TRANSCRIPT: &str = r#"
out="$1/v2clntxt_transcriptions/results_SC_pipeline"
mkdir -p "$out"
printf '  Hello from the test suite.\n' > "$out/clip.txt"
echo 'PROGRESS_OUTPUT: {"progress": 50, "description": "Transcribing"}'
echo 'JSON_OUTPUT_START'
echo 'CHUNK:{"detected_language": "en"}'
echo 'JSON_OUTPUT_END'
"#;

#[tokio::test]
async fn test_uploaded_file_transcribes_to_complete() {
    let fixture = Fixture::new();
    let file_id = fixture.upload("clip.mp4", b"not really a video");
    let preflight = StubPreflight::ok();
    let controller = fixture.controller("exit 99", WRITE_TRANSCRIPT, preflight.clone());

    let cancel = CancellationToken::new();
    let (tx, rx) = event_channel(64, cancel.clone());
    let request = JobRequest {
        file_id: Some(file_id.to_string()),
        ..Default::default()
    };

    let summary = controller.run(Uuid::new_v4(), request, tx, cancel).await;
    let events = drain(rx).await;

    assert_eq!(summary.outcome, Ok(()));
    assert_eq!(summary.final_stage, Stage::Done);
    assert_single_terminal(&events);
    assert_eq!(preflight.calls(), 1);

    match events.last() {
        Some(JobEvent::Complete { transcription }) => {
            assert_eq!(transcription.text, "Hello from the test suite.");
            assert_eq!(transcription.language, "en");
            assert_eq!(transcription.source_file.as_deref(), Some("clip.txt"));
        }
        other => panic!("expected complete, got {:?}", other),
    }

    assert!(events
        .iter()
        .any(|e| matches!(e, JobEvent::Progress(p) if p.percent == 50.0)));
    assert!(events.contains(&JobEvent::status("Starting transcription...")));

    // Upload directory consumed by the job
    assert!(!fixture.uploads.join(file_id.to_string()).exists());
    let counters = controller.workspaces().counters();
    assert_eq!(counters.acquired(), 1);
    assert_eq!(counters.released(), 1);
    assert_eq!(counters.outstanding(), 0);
}

#[tokio::test]
async fn test_failed_download_reports_error_and_removes_workspace() {
    let fixture = Fixture::new();
    let controller = fixture.controller(
        "echo 'ERROR: Video unavailable' >&2; exit 1",
        WRITE_TRANSCRIPT,
        StubPreflight::ok(),
    );

    let cancel = CancellationToken::new();
    let (tx, rx) = event_channel(64, cancel.clone());
    let request = JobRequest {
        url: Some("https://www.youtube.com/watch?v=unavailable".to_string()),
        ..Default::default()
    };

    let summary = controller.run(Uuid::new_v4(), request, tx, cancel).await;
    let events = drain(rx).await;

    assert_eq!(summary.outcome, Err(ErrorCode::TranscriptionError));
    assert_single_terminal(&events);
    let (code, message) = terminal_error(&events);
    assert_eq!(code, ErrorCode::TranscriptionError);
    assert!(message.contains("acquire"), "message: {}", message);
    assert!(message.contains("Video unavailable"), "message: {}", message);
    assert!(!events.iter().any(|e| matches!(e, JobEvent::Complete { .. })));
    assert!(!events.contains(&JobEvent::status("Starting transcription...")));

    assert_eq!(fixture.jobs_dir_entries(), 0);
    assert_eq!(controller.workspaces().counters().outstanding(), 0);
}

#[tokio::test]
async fn test_preflight_failure_allocates_nothing() {
    let fixture = Fixture::new();
    let preflight = StubPreflight::missing(&["whisper", "torch"]);
    let controller = fixture.controller("exit 0", WRITE_TRANSCRIPT, preflight.clone());

    let cancel = CancellationToken::new();
    let (tx, rx) = event_channel(64, cancel.clone());
    let request = JobRequest {
        url: Some("https://youtu.be/abc".to_string()),
        ..Default::default()
    };

    controller.run(Uuid::new_v4(), request, tx, cancel).await;
    let events = drain(rx).await;

    assert_single_terminal(&events);
    let (code, message) = terminal_error(&events);
    assert_eq!(code, ErrorCode::PythonEnvError);
    assert!(message.contains("whisper"), "message: {}", message);
    assert_eq!(preflight.calls(), 1);
    assert_eq!(fixture.jobs_dir_entries(), 0);
    assert_eq!(controller.workspaces().counters().acquired(), 0);
}

#[tokio::test]
async fn test_missing_source_is_rejected_before_preflight() {
    let fixture = Fixture::new();
    let preflight = StubPreflight::ok();
    let controller = fixture.controller("exit 0", WRITE_TRANSCRIPT, preflight.clone());

    let cancel = CancellationToken::new();
    let (tx, rx) = event_channel(64, cancel.clone());

    let summary = controller
        .run(Uuid::new_v4(), JobRequest::default(), tx, cancel)
        .await;
    let events = drain(rx).await;

    assert_eq!(events.len(), 1);
    assert_eq!(terminal_error(&events).0, ErrorCode::InvalidInput);
    assert_eq!(summary.final_stage, Stage::Failed);
    assert_eq!(preflight.calls(), 0);
    assert_eq!(controller.workspaces().counters().acquired(), 0);
}

#[tokio::test]
async fn test_download_then_transcribe() {
    let fixture = Fixture::new();
    let download = r#"
echo '[download]  40.0% of 10.00MiB at 1.00MiB/s ETA 00:06'
printf 'media' > "$1"
"#;
    let controller = fixture.controller(download, WRITE_TRANSCRIPT, StubPreflight::ok());

    let cancel = CancellationToken::new();
    let (tx, rx) = event_channel(64, cancel.clone());
    let request = JobRequest {
        url: Some("https://youtu.be/abc".to_string()),
        language: Some("en".to_string()),
        ..Default::default()
    };

    let summary = controller.run(Uuid::new_v4(), request, tx, cancel).await;
    let events = drain(rx).await;

    assert_eq!(summary.outcome, Ok(()), "events: {:?}", events);
    let download_done = events
        .iter()
        .position(|e| *e == JobEvent::status("Download complete"))
        .unwrap();
    let transcribe_start = events
        .iter()
        .position(|e| *e == JobEvent::status("Starting transcription..."))
        .unwrap();
    assert!(download_done < transcribe_start);
    assert_eq!(fixture.jobs_dir_entries(), 0);
}

#[tokio::test]
async fn test_oversized_upload_is_rejected() {
    let fixture = Fixture::new();
    let file_id = fixture.upload("clip.mp4", &[0u8; 64]);
    let preflight = StubPreflight::ok();
    let controller = {
        let mut settings = PipelineSettings::python("sh", Path::new("a"), Path::new("b"));
        settings.transcribe = CommandTemplate::new("sh", &["-c", WRITE_TRANSCRIPT]);
        settings.max_input_bytes = 16;
        let workspaces =
            cleantxt_server::workspace::WorkspaceManager::new(&fixture.uploads, &fixture.jobs);
        JobController::new(settings, workspaces, preflight)
    };

    let cancel = CancellationToken::new();
    let (tx, rx) = event_channel(64, cancel.clone());
    let request = JobRequest {
        file_id: Some(file_id.to_string()),
        ..Default::default()
    };

    controller.run(Uuid::new_v4(), request, tx, cancel).await;
    let events = drain(rx).await;

    assert_eq!(terminal_error(&events).0, ErrorCode::PayloadTooLarge);
    assert!(!fixture.uploads.join(file_id.to_string()).exists());
}

#[tokio::test]
async fn test_cancellation_stops_running_stage() {
    let fixture = Fixture::new();
    let file_id = fixture.upload("clip.mp4", b"video");
    let controller = fixture.controller("exit 0", "sleep 30", StubPreflight::ok());

    let cancel = CancellationToken::new();
    let (tx, mut rx) = event_channel(64, cancel.clone());
    let request = JobRequest {
        file_id: Some(file_id.to_string()),
        ..Default::default()
    };

    let job_cancel = cancel.clone();
    let job_controller = controller.clone();
    let job = tokio::spawn(async move {
        job_controller
            .run(Uuid::new_v4(), request, tx, job_cancel)
            .await
    });

    while let Some(event) = rx.recv().await {
        if event == JobEvent::status("Starting transcription...") {
            break;
        }
    }
    cancel.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(5), job)
        .await
        .expect("job should stop promptly")
        .unwrap();
    let rest = drain(rx).await;

    assert_eq!(summary.outcome, Err(ErrorCode::TranscriptionError));
    assert!(!rest.iter().any(|e| matches!(e, JobEvent::Complete { .. })));
    assert!(!fixture.uploads.join(file_id.to_string()).exists());
    assert_eq!(controller.workspaces().counters().outstanding(), 0);
}

#[tokio::test]
async fn test_client_disconnect_stops_running_stage() {
    let fixture = Fixture::new();
    let file_id = fixture.upload("clip.mp4", b"video");
    let controller = fixture.controller("exit 0", "sleep 30", StubPreflight::ok());

    let cancel = CancellationToken::new();
    let (tx, mut rx) = event_channel(64, cancel.clone());
    let request = JobRequest {
        file_id: Some(file_id.to_string()),
        ..Default::default()
    };

    let job_cancel = cancel.clone();
    let job_controller = controller.clone();
    let job = tokio::spawn(async move {
        job_controller
            .run(Uuid::new_v4(), request, tx, job_cancel)
            .await
    });

    while let Some(event) = rx.recv().await {
        if event == JobEvent::status("Starting transcription...") {
            break;
        }
    }
    drop(rx);

    let summary = tokio::time::timeout(Duration::from_secs(5), job)
        .await
        .expect("job should stop promptly after the client leaves")
        .unwrap();

    assert_eq!(summary.outcome, Err(ErrorCode::TranscriptionError));
    assert!(cancel.is_cancelled());
    assert!(!fixture.uploads.join(file_id.to_string()).exists());
    assert_eq!(controller.workspaces().counters().outstanding(), 0);
}

#[tokio::test]
async fn test_second_job_on_same_upload_is_rejected() {
    let fixture = Fixture::new();
    let file_id = fixture.upload("clip.mp4", b"video");
    let controller = fixture.controller("exit 0", "sleep 30", StubPreflight::ok());
    let upload_dir = fixture.uploads.join(file_id.to_string());

    let first_cancel = CancellationToken::new();
    let (first_tx, mut first_rx) = event_channel(64, first_cancel.clone());
    let first_request = JobRequest {
        file_id: Some(file_id.to_string()),
        ..Default::default()
    };
    let job_cancel = first_cancel.clone();
    let job_controller = controller.clone();
    let first = tokio::spawn(async move {
        job_controller
            .run(Uuid::new_v4(), first_request, first_tx, job_cancel)
            .await
    });

    while let Some(event) = first_rx.recv().await {
        if event == JobEvent::status("Starting transcription...") {
            break;
        }
    }

    let second_cancel = CancellationToken::new();
    let (second_tx, second_rx) = event_channel(64, second_cancel.clone());
    let second_request = JobRequest {
        file_id: Some(file_id.to_string()),
        ..Default::default()
    };
    let summary = controller
        .run(Uuid::new_v4(), second_request, second_tx, second_cancel)
        .await;
    let events = drain(second_rx).await;

    assert_eq!(summary.outcome, Err(ErrorCode::InvalidInput));
    assert_single_terminal(&events);
    let (code, message) = terminal_error(&events);
    assert_eq!(code, ErrorCode::InvalidInput);
    assert!(message.contains("already being transcribed"), "message: {}", message);
    // The running job still owns its input
    assert!(upload_dir.is_dir());
    assert_eq!(controller.workspaces().counters().acquired(), 1);

    first_cancel.cancel();
    let first_summary = tokio::time::timeout(Duration::from_secs(5), first)
        .await
        .expect("first job should stop promptly")
        .unwrap();
    drop(first_rx);

    assert_eq!(first_summary.outcome, Err(ErrorCode::TranscriptionError));
    assert!(!upload_dir.exists());
    assert_eq!(controller.workspaces().counters().outstanding(), 0);
}

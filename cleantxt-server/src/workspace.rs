//! Workspace manager
//!
//! A workspace is the job-private directory the external stages read from and
//! write into. It is either an upload directory provided by the caller or a
//! fresh `jobs/job-<uuid>` directory. [`Workspace`] is a scoped handle:
//! [`Workspace::release`] removes the tree, and a handle dropped without
//! being released removes it synchronously in `Drop`. Each workspace is
//! released exactly once.
//!
//! An upload directory can be claimed by one job at a time; a second claim
//! fails with `AlreadyExists` until the holder releases it.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Name of the media file the acquire stage downloads into a fresh workspace
pub const DOWNLOADED_MEDIA_FILE: &str = "video.mp4";

/// Acquire/release bookkeeping (exposed for health reporting and tests)
#[derive(Debug, Default)]
pub struct WorkspaceCounters {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl WorkspaceCounters {
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Workspaces currently held by jobs
    pub fn outstanding(&self) -> usize {
        self.acquired().saturating_sub(self.released())
    }
}

/// Where a job's workspace comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceSource {
    /// Pre-existing upload directory
    Existing(PathBuf),
    /// New directory under the jobs root, named after the job
    Fresh(Uuid),
}

/// Upload directories currently owned by a running job
#[derive(Debug, Default)]
struct Claims {
    paths: Mutex<HashSet<PathBuf>>,
}

impl Claims {
    fn lock(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        // The set stays consistent even if a holder panicked
        self.paths.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn claim(&self, path: &Path) -> bool {
        self.lock().insert(path.to_path_buf())
    }

    fn drop_claim(&self, path: &Path) {
        self.lock().remove(path);
    }
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    uploads_root: PathBuf,
    jobs_root: PathBuf,
    counters: Arc<WorkspaceCounters>,
    claims: Arc<Claims>,
}

impl WorkspaceManager {
    pub fn new(uploads_root: impl Into<PathBuf>, jobs_root: impl Into<PathBuf>) -> Self {
        Self {
            uploads_root: uploads_root.into(),
            jobs_root: jobs_root.into(),
            counters: Arc::new(WorkspaceCounters::default()),
            claims: Arc::new(Claims::default()),
        }
    }

    pub fn uploads_root(&self) -> &Path {
        &self.uploads_root
    }

    pub fn jobs_root(&self) -> &Path {
        &self.jobs_root
    }

    pub fn counters(&self) -> Arc<WorkspaceCounters> {
        Arc::clone(&self.counters)
    }

    /// Directory an upload identifier resolves to (existence not checked)
    pub fn upload_dir(&self, file_id: &Uuid) -> PathBuf {
        self.uploads_root.join(file_id.to_string())
    }

    /// Acquire a workspace that exists, is writable and is owned by no other job
    pub async fn acquire(&self, source: WorkspaceSource) -> io::Result<Workspace> {
        let mut claimed = false;
        let path = match source {
            WorkspaceSource::Existing(path) => {
                let metadata = tokio::fs::metadata(&path).await?;
                if !metadata.is_dir() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("workspace is not a directory: {}", path.display()),
                    ));
                }
                if metadata.permissions().readonly() {
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("workspace is not writable: {}", path.display()),
                    ));
                }
                if !self.claims.claim(&path) {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("workspace is in use by another job: {}", path.display()),
                    ));
                }
                claimed = true;
                path
            }
            WorkspaceSource::Fresh(job_id) => {
                tokio::fs::create_dir_all(&self.jobs_root).await?;
                let path = self.jobs_root.join(format!("job-{}", job_id));
                // create_dir fails if the path exists: no two jobs share a directory
                tokio::fs::create_dir(&path).await?;
                path
            }
        };

        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        info!(workspace = %path.display(), "Workspace acquired");

        Ok(Workspace {
            path,
            released: false,
            counters: Arc::clone(&self.counters),
            claims: claimed.then(|| Arc::clone(&self.claims)),
        })
    }
}

/// Scoped handle to an acquired workspace
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    released: bool,
    counters: Arc<WorkspaceCounters>,
    /// Set for claimed upload directories
    claims: Option<Arc<Claims>>,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the workspace: recursive removal
    ///
    /// An already-missing directory counts as removed. Other removal errors are
    /// returned for logging; the workspace is considered released either way.
    pub async fn release(mut self) -> io::Result<()> {
        self.released = true;
        self.counters.released.fetch_add(1, Ordering::SeqCst);

        let removed = match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {
                info!(workspace = %self.path.display(), "Workspace removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(workspace = %self.path.display(), "Workspace already gone");
                Ok(())
            }
            Err(e) => Err(e),
        };
        self.unclaim();
        removed
    }

    fn unclaim(&mut self) {
        if let Some(claims) = self.claims.take() {
            claims.drop_claim(&self.path);
        }
    }

    /// The single media file in the workspace (first regular non-hidden file by name)
    pub async fn find_media_file(&self) -> io::Result<Option<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.path).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || name.ends_with(".part") {
                continue;
            }
            files.push(entry.path());
        }
        files.sort();
        Ok(files.into_iter().next())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.counters.released.fetch_add(1, Ordering::SeqCst);
        warn!(workspace = %self.path.display(), "Workspace dropped without release, removing");
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(workspace = %self.path.display(), error = %e, "Workspace removal failed");
            }
        }
        self.unclaim();
    }
}

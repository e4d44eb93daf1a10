//! Bootstrap configuration loading and root folder resolution
//!
//! Configuration sources, highest priority first:
//! 1. Command-line arguments (resolved by the service binary)
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Compiled defaults
//!
//! A missing TOML file is not an error: a warning is logged and compiled
//! defaults are used. A TOML file that exists but does not parse is an error.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV: &str = "CLEANTXT_ROOT_FOLDER";

/// Environment variable overriding the TOML config file location
pub const CONFIG_PATH_ENV: &str = "CLEANTXT_CONFIG";

/// Bootstrap configuration loaded from TOML file
///
/// Every section is optional; absent keys take compiled defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// Root folder holding `uploads/` and `jobs/` (optional)
    pub root_folder: Option<PathBuf>,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub python: PythonConfig,
    pub stages: StageConfig,
    pub upload: UploadConfig,
    pub inference: InferenceConfig,
    pub translation: TranslationConfig,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5730,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` takes precedence
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// External Python runtime used by the pipeline stages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PythonConfig {
    /// Interpreter binary (name on PATH or absolute path)
    pub interpreter: String,
    /// Download helper script (`download <output> <url>`)
    pub download_script: PathBuf,
    /// Transcription script (`<input_dir> <language>`)
    pub transcribe_script: PathBuf,
    /// Modules the preflight check requires to be importable
    pub required_modules: Vec<String>,
    /// Environment overrides passed to every subprocess (cache dirs, PYTHONPATH)
    pub env: BTreeMap<String, String>,
}

impl Default for PythonConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            download_script: PathBuf::from("scripts/youtube_download.py"),
            transcribe_script: PathBuf::from("scripts/transcribe_script.py"),
            required_modules: vec![
                "vid2cleantxt".to_string(),
                "yt_dlp".to_string(),
                "torch".to_string(),
            ],
            env: BTreeMap::new(),
        }
    }
}

/// Per-stage ceilings and stream buffering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub preflight_timeout_secs: u64,
    pub acquire_timeout_secs: u64,
    pub transcribe_timeout_secs: u64,
    /// Capacity of each job's event channel
    pub event_buffer: usize,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            preflight_timeout_secs: 60,
            acquire_timeout_secs: 30 * 60,
            transcribe_timeout_secs: 2 * 60 * 60,
            event_buffer: 256,
        }
    }
}

/// Upload size and type constraints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub max_bytes: u64,
    pub allowed_mime_types: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_bytes: 2 * 1024 * 1024 * 1024,
            allowed_mime_types: [
                "video/mp4",
                "video/webm",
                "video/quicktime",
                "video/x-matroska",
                "video/x-msvideo",
                "video/mpeg",
                "video/ogg",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Which backend runs the transcribe stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    /// Local transcription subprocess
    #[default]
    Local,
    /// Remote inference endpoint
    Remote,
}

/// Remote inference endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub backend: InferenceBackend,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            backend: InferenceBackend::Local,
            endpoint: None,
            api_key: None,
            timeout_secs: 600,
        }
    }
}

/// Subtitle translation helper settings (OpenAI-compatible chat endpoint)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    /// Subtitle cues per model call
    pub batch_size: usize,
    pub timeout_secs: u64,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            batch_size: 20,
            timeout_secs: 120,
        }
    }
}

/// Default TOML location: `<config_dir>/cleantxt/cleantxt-server.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("cleantxt").join("cleantxt-server.toml"))
}

/// Pick the config file path: explicit argument, then `CLEANTXT_CONFIG`, then the default
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    default_config_path()
}

/// Load TOML configuration
///
/// Missing file → warning + defaults. Unreadable or malformed file → `Error::Config`.
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        warn!(
            "Config file not found at {}, using compiled defaults",
            path.display()
        );
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read TOML failed ({}): {}", path.display(), e)))?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML failed ({}): {}", path.display(), e)))?;

    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Get OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("cleantxt"))
        .unwrap_or_else(|| PathBuf::from("./cleantxt_data"))
}

/// Root folder resolution: CLI argument → `CLEANTXT_ROOT_FOLDER` → TOML → compiled default
pub struct RootFolderResolver<'a> {
    cli_arg: Option<&'a Path>,
    toml_root: Option<&'a Path>,
}

impl<'a> RootFolderResolver<'a> {
    pub fn new(cli_arg: Option<&'a Path>, toml_root: Option<&'a Path>) -> Self {
        Self { cli_arg, toml_root }
    }

    pub fn resolve(&self) -> PathBuf {
        if let Some(path) = self.cli_arg {
            debug!("Root folder from command line: {}", path.display());
            return path.to_path_buf();
        }

        if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
            if !path.trim().is_empty() {
                debug!("Root folder from {}: {}", ROOT_FOLDER_ENV, path);
                return PathBuf::from(path);
            }
        }

        if let Some(path) = self.toml_root {
            debug!("Root folder from TOML: {}", path.display());
            return path.to_path_buf();
        }

        default_root_folder()
    }
}

/// Creates the root folder layout on startup
pub struct RootFolderInitializer {
    root: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Create `<root>`, `<root>/uploads` and `<root>/jobs` if missing
    pub fn ensure_directory_exists(&self) -> Result<()> {
        for dir in [self.root.clone(), self.uploads_dir(), self.jobs_dir()] {
            if !dir.exists() {
                info!("Creating directory: {}", dir.display());
            }
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Uploaded files, one directory per upload identifier
    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join("uploads")
    }

    /// Job-private workspaces for remote sources
    pub fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }
}

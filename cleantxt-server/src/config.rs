//! Service configuration for cleantxt-server
//!
//! Priority: command line → environment → TOML → compiled defaults. The
//! command line and environment are handled together by clap (`env`
//! attributes); the root folder follows [`RootFolderResolver`].

use crate::job::PipelineSettings;
use clap::Parser;
use cleantxt_common::config::{
    load_toml_config, resolve_config_path, InferenceBackend, RootFolderResolver, TomlConfig,
    UploadConfig,
};
use cleantxt_common::{Error, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

pub const INFERENCE_API_KEY_ENV: &str = "CLEANTXT_INFERENCE_API_KEY";
pub const TRANSLATION_API_KEY_ENV: &str = "CLEANTXT_TRANSLATION_API_KEY";

/// Command-line arguments
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "cleantxt-server", version, about = "Streaming transcription job service")]
pub struct Args {
    /// TOML configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Root folder for uploads and job workspaces (also CLEANTXT_ROOT_FOLDER)
    #[arg(long, value_name = "PATH")]
    pub root_folder: Option<PathBuf>,

    /// Listen address
    #[arg(long, env = "CLEANTXT_HOST")]
    pub host: Option<String>,

    /// Listen port
    #[arg(long, env = "CLEANTXT_PORT")]
    pub port: Option<u16>,

    /// Log level when RUST_LOG is unset
    #[arg(long, env = "CLEANTXT_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Python interpreter for the pipeline scripts
    #[arg(long, env = "CLEANTXT_PYTHON")]
    pub python: Option<String>,

    /// Transcription backend (local or remote)
    #[arg(long, env = "CLEANTXT_BACKEND", value_parser = parse_backend)]
    pub backend: Option<InferenceBackend>,
}

fn parse_backend(raw: &str) -> std::result::Result<InferenceBackend, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "local" => Ok(InferenceBackend::Local),
        "remote" => Ok(InferenceBackend::Remote),
        other => Err(format!("unknown backend '{}' (expected local or remote)", other)),
    }
}

/// Preflight probe parameters
#[derive(Debug, Clone)]
pub struct PreflightSettings {
    pub interpreter: String,
    pub required_modules: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
}

/// Remote inference endpoint, resolved
#[derive(Debug, Clone)]
pub struct InferenceSettings {
    pub endpoint: String,
    pub api_key: String,
    pub timeout: Duration,
}

/// Translation endpoint, resolved
#[derive(Debug, Clone)]
pub struct TranslationSettings {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub batch_size: usize,
    pub timeout: Duration,
}

/// Fully resolved service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub root_folder: PathBuf,
    pub pipeline: PipelineSettings,
    pub preflight: PreflightSettings,
    pub upload: UploadConfig,
    pub event_buffer: usize,
    pub inference: Option<InferenceSettings>,
    pub translation: Option<TranslationSettings>,
}

impl ServiceConfig {
    /// Locate and read the TOML file, then resolve it against the arguments
    ///
    /// Logs where configuration came from; call after tracing is installed.
    pub fn load(args: &Args) -> Result<Self> {
        let toml = match resolve_config_path(args.config.as_deref()) {
            Some(path) => load_toml_config(&path)?,
            None => {
                warn!("No configuration directory available, using defaults");
                TomlConfig::default()
            }
        };
        Self::resolve(args, toml)
    }

    /// Merge command-line arguments over the TOML file
    pub fn resolve(args: &Args, toml: TomlConfig) -> Result<Self> {
        let root_folder =
            RootFolderResolver::new(args.root_folder.as_deref(), toml.root_folder.as_deref())
                .resolve();

        let interpreter = args
            .python
            .clone()
            .unwrap_or_else(|| toml.python.interpreter.clone());

        let mut pipeline = PipelineSettings::python(
            &interpreter,
            &toml.python.download_script,
            &toml.python.transcribe_script,
        );
        pipeline.env = toml.python.env.clone();
        pipeline.acquire_timeout = Duration::from_secs(toml.stages.acquire_timeout_secs);
        pipeline.transcribe_timeout = Duration::from_secs(toml.stages.transcribe_timeout_secs);
        pipeline.max_input_bytes = toml.upload.max_bytes;
        pipeline.backend = args.backend.unwrap_or(toml.inference.backend);

        let inference = match (
            toml.inference.endpoint.as_deref().filter(|e| is_valid_key(e)),
            resolve_api_key("inference", INFERENCE_API_KEY_ENV, toml.inference.api_key.as_deref()),
        ) {
            (Some(endpoint), Some(api_key)) => Some(InferenceSettings {
                endpoint: endpoint.to_string(),
                api_key,
                timeout: Duration::from_secs(toml.inference.timeout_secs),
            }),
            _ => None,
        };
        if pipeline.backend == InferenceBackend::Remote && inference.is_none() {
            return Err(Error::Config(format!(
                "Remote inference backend selected but not configured. Set [inference] endpoint \
                 and either {} or [inference] api_key",
                INFERENCE_API_KEY_ENV
            )));
        }

        let translation = match (
            toml.translation.endpoint.as_deref().filter(|e| is_valid_key(e)),
            resolve_api_key(
                "translation",
                TRANSLATION_API_KEY_ENV,
                toml.translation.api_key.as_deref(),
            ),
        ) {
            (Some(endpoint), Some(api_key)) => Some(TranslationSettings {
                endpoint: endpoint.to_string(),
                api_key,
                model: toml.translation.model.clone(),
                batch_size: toml.translation.batch_size.max(1),
                timeout: Duration::from_secs(toml.translation.timeout_secs),
            }),
            _ => {
                info!("Translation endpoint not configured, /api/translate disabled");
                None
            }
        };

        Ok(Self {
            host: args.host.clone().unwrap_or(toml.server.host),
            port: args.port.unwrap_or(toml.server.port),
            log_level: args.log_level.clone().unwrap_or(toml.logging.level),
            root_folder,
            preflight: PreflightSettings {
                interpreter,
                required_modules: toml.python.required_modules,
                env: toml.python.env,
                timeout: Duration::from_secs(toml.stages.preflight_timeout_secs),
            },
            pipeline,
            upload: toml.upload,
            event_buffer: toml.stages.event_buffer.max(1),
            inference,
            translation,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Resolve an API key: environment → TOML
///
/// Warns when both sources carry a key.
pub fn resolve_api_key(name: &str, env_var: &str, toml_key: Option<&str>) -> Option<String> {
    let env_key = std::env::var(env_var).ok().filter(|k| is_valid_key(k));
    let toml_key = toml_key.filter(|k| is_valid_key(k));

    if env_key.is_some() && toml_key.is_some() {
        warn!(
            "{} API key found in multiple sources: environment, TOML. Using environment (highest priority).",
            name
        );
    }

    if let Some(key) = env_key {
        info!("{} API key loaded from environment variable", name);
        return Some(key);
    }
    if let Some(key) = toml_key {
        info!("{} API key loaded from TOML config", name);
        return Some(key.to_string());
    }
    None
}

/// Validate API key (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

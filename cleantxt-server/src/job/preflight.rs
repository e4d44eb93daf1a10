//! Preflight capability check
//!
//! Verifies the external Python runtime can import everything the pipeline
//! needs before a job commits any resources.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Prints missing module names (comma separated) and exits 1 when any are missing
const PROBE_SCRIPT: &str = "import importlib.util, sys\n\
missing = [m for m in sys.argv[1:] if importlib.util.find_spec(m) is None]\n\
print(','.join(missing))\n\
sys.exit(1 if missing else 0)\n";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PreflightError {
    #[error("Missing Python packages: {}", .0.join(", "))]
    MissingModules(Vec<String>),

    #[error("Python interpreter unavailable: {0}")]
    Interpreter(String),

    #[error("Python environment check timed out after {0:?}")]
    TimedOut(Duration),
}

/// Capability probe run once per job before any workspace is allocated
#[async_trait]
pub trait Preflight: Send + Sync {
    async fn check(&self) -> Result<(), PreflightError>;
}

/// Probe the configured interpreter for importable modules
#[derive(Debug, Clone)]
pub struct PythonPreflight {
    interpreter: String,
    modules: Vec<String>,
    env: BTreeMap<String, String>,
    timeout: Duration,
}

impl PythonPreflight {
    pub fn new(
        interpreter: impl Into<String>,
        modules: Vec<String>,
        env: BTreeMap<String, String>,
        timeout: Duration,
    ) -> Self {
        Self {
            interpreter: interpreter.into(),
            modules,
            env,
            timeout,
        }
    }
}

#[async_trait]
impl Preflight for PythonPreflight {
    async fn check(&self) -> Result<(), PreflightError> {
        if self.modules.is_empty() {
            return Ok(());
        }

        let mut cmd = Command::new(&self.interpreter);
        cmd.arg("-c")
            .arg(PROBE_SCRIPT)
            .args(&self.modules)
            .envs(&self.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| PreflightError::TimedOut(self.timeout))?
            .map_err(|e| PreflightError::Interpreter(format!("{}: {}", self.interpreter, e)))?;

        if output.status.success() {
            info!(interpreter = %self.interpreter, modules = ?self.modules, "Python environment ready");
            return Ok(());
        }

        let missing = missing_modules(&String::from_utf8_lossy(&output.stdout));
        if !missing.is_empty() {
            return Err(PreflightError::MissingModules(missing));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(interpreter = %self.interpreter, stderr = %stderr.trim(), "Probe failed");
        Err(PreflightError::Interpreter(format!(
            "{} exited with {}",
            self.interpreter, output.status
        )))
    }
}

fn missing_modules(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .last()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}

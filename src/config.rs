use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::buffer::{DEFAULT_BUFFER_SIZE, HEADER_BYTES};

/// Runtime configuration shared by every sandbox a coordinator creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Capacity of the shared transfer buffer in bytes, header included.
    pub buffer_size: usize,
    /// Directory holding `<dump_id>.sql` files for [`crate::store::DirectoryDumpStore`].
    pub dump_dir: PathBuf,
    /// Extra `sys.path` entries for the embedded interpreter. Empty unless
    /// set; anything listed here is importable by guest code.
    pub python_path: Vec<String>,
    /// Caller-side deadline for one run/submit, in milliseconds.
    pub execution_timeout_ms: Option<u64>,
    /// Deadline for one bridge round trip, in milliseconds.
    pub bridge_timeout_ms: Option<u64>,
    /// Drop the Python sandbox after guest code fails.
    pub discard_python_after_error: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            dump_dir: PathBuf::from("db_dumps"),
            python_path: Vec::new(),
            execution_timeout_ms: None,
            bridge_timeout_ms: None,
            discard_python_after_error: true,
        }
    }
}

impl SandboxConfig {
    /// Build a config from `QUERYBOX_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("QUERYBOX_BUFFER_SIZE") {
            config.buffer_size = raw
                .parse()
                .with_context(|| format!("QUERYBOX_BUFFER_SIZE is not a byte count: {}", raw))?;
        }
        if let Ok(dir) = std::env::var("QUERYBOX_DUMP_DIR") {
            config.dump_dir = PathBuf::from(dir);
        }
        if let Ok(paths) = std::env::var("QUERYBOX_PYTHON_PATH") {
            config.python_path = std::env::split_paths(&paths)
                .map(|p| p.to_string_lossy().to_string())
                .collect();
        }
        if let Ok(raw) = std::env::var("QUERYBOX_EXEC_TIMEOUT_MS") {
            config.execution_timeout_ms = Some(
                raw.parse()
                    .with_context(|| format!("QUERYBOX_EXEC_TIMEOUT_MS is not a number: {}", raw))?,
            );
        }
        if let Ok(raw) = std::env::var("QUERYBOX_BRIDGE_TIMEOUT_MS") {
            config.bridge_timeout_ms = Some(
                raw.parse()
                    .with_context(|| format!("QUERYBOX_BRIDGE_TIMEOUT_MS is not a number: {}", raw))?,
            );
        }
        if let Ok(raw) = std::env::var("QUERYBOX_KEEP_PYTHON_AFTER_ERROR") {
            config.discard_python_after_error = !matches!(raw.as_str(), "1" | "true" | "yes");
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_size <= HEADER_BYTES {
            anyhow::bail!(
                "buffer_size must exceed the {}-byte header, got {}",
                HEADER_BYTES,
                self.buffer_size
            );
        }
        if self.execution_timeout_ms == Some(0) || self.bridge_timeout_ms == Some(0) {
            anyhow::bail!("timeouts must be positive when set");
        }
        Ok(())
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_ms.map(Duration::from_millis)
    }

    pub fn bridge_timeout(&self) -> Option<Duration> {
        self.bridge_timeout_ms.map(Duration::from_millis)
    }
}

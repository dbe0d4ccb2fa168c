//! Run-scoped filesystem layout.
//!
//! Everything a run produces lives below `<output root>/<timestamp>`, so a
//! later single-step invocation with the same timestamp picks up where the
//! previous one stopped.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Resolve the run timestamp from the environment snapshot.
///
/// `BUILD_TIMESTAMP` wins, then `build-<BUILD_NUMBER>`. Without either,
/// single-step runs are rejected (they could not find the earlier run's
/// output) and full runs fall back to the local wall clock.
pub fn resolve_timestamp(env: &BTreeMap<String, String>, single_step: bool) -> Result<String> {
    if let Some(ts) = env.get("BUILD_TIMESTAMP").filter(|v| !v.trim().is_empty()) {
        return Ok(ts.trim().to_string());
    }
    if let Some(number) = env.get("BUILD_NUMBER").filter(|v| !v.trim().is_empty()) {
        return Ok(format!("build-{}", number.trim()));
    }
    if single_step {
        return Err(
            Error::config_missing_key("BUILD_NUMBER", None).with_hint(
                "Single steps share state through the output directory: set BUILD_NUMBER or BUILD_TIMESTAMP to the value used by the earlier run",
            ),
        );
    }
    Ok(chrono::Local::now().format("%Y-%m-%d-%H-%M-%S").to_string())
}

#[derive(Debug, Clone)]
pub struct OutputDirectory {
    root: PathBuf,
}

impl OutputDirectory {
    pub fn new(output_root: &Path, timestamp: &str) -> Self {
        Self {
            root: output_root.join(timestamp),
        }
    }

    /// Create the directory. An existing one is reused with a warning.
    pub fn create(&self) -> Result<()> {
        if self.root.is_dir() {
            log_status!(
                "output",
                "Output directory {} already exists, reusing it",
                self.root.display()
            );
            tracing::warn!(path = %self.root.display(), "output directory already exists");
            return Ok(());
        }
        fs::create_dir_all(&self.root).map_err(|e| {
            Error::internal_io(
                e.to_string(),
                Some(format!("create directory {}", self.root.display())),
            )
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn default_log_file(&self) -> PathBuf {
        self.root.join("output.log")
    }

    pub fn known_hosts(&self) -> PathBuf {
        self.root.join("known_hosts")
    }

    pub fn total_result(&self) -> PathBuf {
        self.root.join("total_result.json")
    }

    pub fn mail_file(&self) -> PathBuf {
        self.root.join("mail.txt")
    }
}

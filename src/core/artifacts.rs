//! Pulls a suite's artifacts from the controller into the output directory.

use crate::config::ArtifactPolicy;
use crate::error::{Error, Result};
use crate::ssh::{RemoteFiles, Transfer};
use crate::suite::ArtifactSet;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionReport {
    pub pulled: Vec<String>,
    /// Directories that exist remotely but hold nothing.
    pub empty: Vec<String>,
    pub not_found: Vec<String>,
}

impl CollectionReport {
    pub fn is_empty(&self) -> bool {
        self.pulled.is_empty()
    }
}

pub struct ArtifactCollector<'a> {
    remote: &'a dyn RemoteFiles,
    policy: ArtifactPolicy,
}

impl<'a> ArtifactCollector<'a> {
    pub fn new(remote: &'a dyn RemoteFiles, policy: ArtifactPolicy) -> Self {
        Self { remote, policy }
    }

    /// Pull every pattern and directory of `set` found below `results_dir`.
    /// Anything missing remotely is logged and skipped; transfer failures
    /// are errors.
    pub fn collect(
        &self,
        results_dir: &str,
        set: &ArtifactSet,
        local_dir: &Path,
    ) -> Result<CollectionReport> {
        let base = results_dir.trim_end_matches('/');
        let mut report = CollectionReport::default();

        for pattern in set.files {
            let remote = format!("{}/{}", base, pattern);
            match self.remote.pull_file(&remote, local_dir)? {
                Transfer::Copied { entries } => {
                    tracing::info!(pattern = %remote, entries, "pulled files");
                    report.pulled.push(remote);
                }
                Transfer::NotFound => {
                    tracing::info!(pattern = %remote, "no remote files match, skipping");
                    report.not_found.push(remote);
                }
            }
        }

        for dir in set.directories {
            let remote = format!("{}/{}", base, dir);
            match self.remote.pull_directory(&remote, &local_dir.join(dir))? {
                Transfer::Copied { entries: 0 } => {
                    tracing::info!(directory = %remote, "remote directory is empty");
                    report.empty.push(remote);
                }
                Transfer::Copied { entries } => {
                    tracing::info!(directory = %remote, entries, "pulled directory");
                    report.pulled.push(remote);
                }
                Transfer::NotFound => {
                    tracing::info!(directory = %remote, "remote directory missing, skipping");
                    report.not_found.push(remote);
                }
            }
        }

        log_status!(
            "collect",
            "Pulled {} of {} artifact sources from {}",
            report.pulled.len(),
            set.files.len() + set.directories.len(),
            base
        );

        if report.is_empty() && self.policy == ArtifactPolicy::RequireAny {
            return Err(Error::artifacts_empty(base));
        }
        Ok(report)
    }
}

//! Test suites the pipeline can drive on a provisioned host.

use serde::Serialize;

/// Glob patterns and directory names pulled back after a run, relative to
/// the suite's remote results directory.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactSet {
    pub files: &'static [&'static str],
    pub directories: &'static [&'static str],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Suite {
    Cucumber,
    Saltshaker,
}

impl Suite {
    pub fn as_str(&self) -> &'static str {
        match self {
            Suite::Cucumber => "cucumber",
            Suite::Saltshaker => "saltshaker",
        }
    }

    /// Provisioning resource whose host runs the suite.
    pub fn controller_resource(&self) -> &'static str {
        match self {
            Suite::Cucumber => "controller",
            Suite::Saltshaker => "saltshaker",
        }
    }

    /// Configuration key holding the default remote command.
    pub fn command_key(&self) -> &'static str {
        match self {
            Suite::Cucumber => "CUCUMBER_COMMAND",
            Suite::Saltshaker => "SALTSHAKER_COMMAND",
        }
    }

    pub fn results_dir(&self) -> &'static str {
        match self {
            Suite::Cucumber => "/root/spacewalk/testsuite",
            Suite::Saltshaker => "/root/salt-shaker/results",
        }
    }

    pub fn artifacts(&self) -> ArtifactSet {
        match self {
            Suite::Cucumber => ArtifactSet {
                files: &[
                    "output*.html",
                    "output*.json",
                    "*.log",
                    "spacewalk-debug.tar.bz2",
                ],
                directories: &["cucumber_report", "logs", "results_junit", "screenshots"],
            },
            Suite::Saltshaker => ArtifactSet {
                files: &["*.xml", "*.log"],
                directories: &["results_junit", "logs"],
            },
        }
    }
}

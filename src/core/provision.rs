//! Environment provisioning through terraform.

use crate::credentials::HostLookup;
use crate::error::{Error, ProvisionFailedDetails, Result};
use crate::utils::command;
use regex::Regex;
use serde_json::Value;
use serde_json_path::JsonPath;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ProvisionOptions {
    pub parallelism: u32,
    pub destroy: bool,
    /// Resource address pattern to taint before applying.
    pub taint: Option<String>,
    pub resource_cleaner: bool,
}

/// Creates the test environment and answers hostname lookups for it.
pub trait Provisioner: HostLookup {
    fn provision(&self, options: &ProvisionOptions, sink: &mut dyn Write) -> Result<()>;

    fn as_lookup(&self) -> &dyn HostLookup;
}

pub struct TerraformBackend {
    dir: PathBuf,
    binary: String,
    env: Vec<(String, String)>,
}

impl TerraformBackend {
    /// `env` is passed to every terraform invocation, on top of the inherited
    /// environment.
    pub fn new(dir: &Path, env: Vec<(String, String)>) -> Self {
        Self {
            dir: dir.to_path_buf(),
            binary: "terraform".to_string(),
            env,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn stream(&self, action: &str, args: &[&str], sink: &mut dyn Write) -> Result<()> {
        log_status!("provision", "terraform {}", args.join(" "));
        let exit_code = command::stream_in(
            &self.dir,
            &self.binary,
            args,
            &self.env,
            sink,
            &format!("terraform {}", action),
        )?;
        if exit_code != 0 {
            return Err(Error::provision_failed(ProvisionFailedDetails {
                action: action.to_string(),
                exit_code,
            }));
        }
        Ok(())
    }

    fn taint_matching(&self, pattern: &str, sink: &mut dyn Write) -> Result<()> {
        let re = Regex::new(pattern).map_err(|e| {
            Error::config_invalid_value("taint", Some(pattern.to_string()), e.to_string())
        })?;
        let state = command::run_in(
            &self.dir,
            &self.binary,
            &["state", "list"],
            &self.env,
            "terraform state list",
        )?;

        let resources: Vec<&str> = state.lines().filter(|l| re.is_match(l)).collect();
        if resources.is_empty() {
            tracing::info!(pattern, "no resources to taint");
        }
        for resource in resources {
            self.stream("taint", &["taint", resource], sink)?;
        }
        Ok(())
    }

    fn configuration(&self) -> Result<Value> {
        let raw = command::run_in(
            &self.dir,
            &self.binary,
            &["output", "-json", "configuration"],
            &self.env,
            "terraform output",
        )?;
        serde_json::from_str(&raw).map_err(|e| {
            Error::internal_json(e.to_string(), Some("parse terraform output".to_string()))
        })
    }
}

impl Provisioner for TerraformBackend {
    fn provision(&self, options: &ProvisionOptions, sink: &mut dyn Write) -> Result<()> {
        self.stream("init", &["init", "-input=false"], sink)?;

        if options.resource_cleaner {
            self.stream(
                "refresh",
                &["apply", "-refresh-only", "-auto-approve", "-input=false"],
                sink,
            )?;
        }

        if options.destroy {
            self.stream("destroy", &["destroy", "-auto-approve", "-input=false"], sink)?;
        }

        if let Some(pattern) = &options.taint {
            self.taint_matching(pattern, sink)?;
        }

        let parallelism = format!("-parallelism={}", options.parallelism);
        self.stream(
            "apply",
            &["apply", "-auto-approve", "-input=false", &parallelism],
            sink,
        )
    }

    fn as_lookup(&self) -> &dyn HostLookup {
        self
    }
}

impl HostLookup for TerraformBackend {
    fn hostname(&self, resource: &str) -> Result<String> {
        let configuration = self.configuration()?;
        hostname_from_configuration(&configuration, resource)
    }
}

/// Pick `<resource>.hostname` out of the `configuration` output.
pub fn hostname_from_configuration(configuration: &Value, resource: &str) -> Result<String> {
    let escaped = resource.replace('\\', "\\\\").replace('\'', "\\'");
    let path = JsonPath::parse(&format!("$['{}'].hostname", escaped))
        .map_err(|e| Error::hostname_lookup_failed(resource, e.to_string()))?;

    let node = path
        .query(configuration)
        .exactly_one()
        .map_err(|_| Error::hostname_lookup_failed(resource, "no hostname in terraform output"))?;

    node.as_str()
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::hostname_lookup_failed(resource, "hostname is not a string"))
}

//! Run configuration: built once from CLI input, the terraform file's
//! variable defaults and the `TF_VAR_` environment overlay, then never
//! mutated.

use crate::credentials::Secret;
use crate::error::{Error, Result};
use crate::ledger::Step;
use crate::paths;
use crate::suite::Suite;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const TF_VAR_PREFIX: &str = "TF_VAR_";

/// Snapshot of the process environment.
pub type EnvSnapshot = BTreeMap<String, String>;

pub fn env_snapshot() -> EnvSnapshot {
    std::env::vars().collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    All,
    Single { step: Step, suite: Suite },
}

const RUNSTEPS: [&str; 9] = [
    "all",
    "gitsync",
    "provision",
    "cucumber",
    "getresults",
    "mail",
    "saltshaker",
    "saltshaker_getresults",
    "saltshaker_mail",
];

impl RunMode {
    pub fn from_runstep(value: &str) -> Result<Self> {
        let single = |step, suite| Ok(RunMode::Single { step, suite });
        match value {
            "all" => Ok(RunMode::All),
            "gitsync" => single(Step::GitSync, Suite::Cucumber),
            "provision" => single(Step::Provision, Suite::Cucumber),
            "cucumber" => single(Step::RemoteTests, Suite::Cucumber),
            "getresults" => single(Step::CollectResults, Suite::Cucumber),
            "mail" => single(Step::Notify, Suite::Cucumber),
            "saltshaker" => single(Step::RemoteTests, Suite::Saltshaker),
            "saltshaker_getresults" => single(Step::CollectResults, Suite::Saltshaker),
            "saltshaker_mail" => single(Step::Notify, Suite::Saltshaker),
            other => Err(Error::validation_invalid_argument(
                "runstep",
                format!("Unknown step '{}'", other),
                Some(other.to_string()),
                Some(RUNSTEPS.iter().map(|s| s.to_string()).collect()),
            )),
        }
    }

    pub fn suite(&self) -> Suite {
        match self {
            RunMode::All => Suite::Cucumber,
            RunMode::Single { suite, .. } => *suite,
        }
    }

    pub fn is_single(&self) -> bool {
        matches!(self, RunMode::Single { .. })
    }

    /// Whether this invocation runs `step`.
    pub fn includes(&self, step: Step) -> bool {
        match self {
            RunMode::All => true,
            RunMode::Single { step: only, .. } => *only == step,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    Libvirt,
    Aws,
}

impl Backend {
    pub fn from_name(value: &str) -> Result<Self> {
        match value {
            "libvirt" => Ok(Backend::Libvirt),
            "aws" => Ok(Backend::Aws),
            other => Err(Error::validation_invalid_argument(
                "backend",
                format!("Unknown provisioning backend '{}'", other),
                Some(other.to_string()),
                Some(vec!["libvirt".to_string(), "aws".to_string()]),
            )),
        }
    }

    /// Resources recreated when tainting is requested.
    pub fn taint_pattern(&self) -> &'static str {
        match self {
            Backend::Libvirt => r".*(domain|main_disk).*",
            Backend::Aws => r".*(aws_instance|aws_ebs_volume).*",
        }
    }
}

/// Whether artifact collection fails when nothing at all was pulled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArtifactPolicy {
    #[default]
    AlwaysSucceed,
    RequireAny,
}

/// Raw CLI input, free of any argument-parser types.
#[derive(Debug, Clone)]
pub struct RunInput {
    pub runstep: String,
    pub tf: Option<PathBuf>,
    pub backend: String,
    pub gitrepo: Option<String>,
    pub gitref: Option<String>,
    pub gitfolder: PathBuf,
    pub gituser: Option<String>,
    pub gitpassword: Option<String>,
    pub outputdir: PathBuf,
    pub logfile: Option<PathBuf>,
    pub bastion_key: Option<String>,
    pub bastion_user: Option<String>,
    pub bastion_hostname: Option<String>,
    pub controller_user: String,
    pub controller_key: Option<String>,
    pub controller_password: Option<String>,
    pub command: Option<String>,
    pub custom_repositories: Option<PathBuf>,
    pub parallelism: u32,
    pub nlines: usize,
    pub destroy: bool,
    pub taint: bool,
    pub resource_cleaner: bool,
    pub trust_new_host_keys: bool,
    pub fail_on_empty_results: bool,
    pub mail_to: Option<String>,
    pub mail_from: Option<String>,
    pub webhook_url: Option<String>,
}

impl Default for RunInput {
    fn default() -> Self {
        Self {
            runstep: "all".to_string(),
            tf: None,
            backend: "libvirt".to_string(),
            gitrepo: None,
            gitref: None,
            gitfolder: PathBuf::from("./spacewalk"),
            gituser: None,
            gitpassword: None,
            outputdir: PathBuf::from("."),
            logfile: None,
            bastion_key: None,
            bastion_user: None,
            bastion_hostname: None,
            controller_user: "root".to_string(),
            controller_key: None,
            controller_password: None,
            command: None,
            custom_repositories: None,
            parallelism: 10,
            nlines: 20,
            destroy: false,
            taint: false,
            resource_cleaner: false,
            trust_new_host_keys: false,
            fail_on_empty_results: false,
            mail_to: None,
            mail_from: None,
            webhook_url: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GitOptions {
    pub repo: String,
    pub reference: String,
    pub folder: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BastionOptions {
    pub key: String,
    pub user: String,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NotifyOptions {
    pub subject: String,
    pub mail_to: Option<String>,
    pub mail_from: Option<String>,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunConfiguration {
    pub mode: RunMode,
    pub tf_file: PathBuf,
    pub backend: Backend,
    /// Remote test command, present whenever the remote tests may run.
    pub command: Option<String>,
    /// Present whenever git sync may run.
    pub git: Option<GitOptions>,
    pub git_user: Option<String>,
    pub git_password: Option<String>,
    pub output_root: PathBuf,
    pub timestamp: String,
    pub log_file: Option<PathBuf>,
    pub parallelism: u32,
    pub max_failure_lines: usize,
    pub destroy: bool,
    pub taint: bool,
    pub resource_cleaner: bool,
    pub trust_new_host_keys: bool,
    pub artifact_policy: ArtifactPolicy,
    pub bastion: Option<BastionOptions>,
    pub controller_user: String,
    pub controller_secret: Option<Secret>,
    pub custom_repositories: Option<PathBuf>,
    pub notify: NotifyOptions,
    /// `TF_VAR_` overlay, keyed without the prefix.
    pub tf_vars: BTreeMap<String, String>,
    /// Terraform variable defaults with the overlay applied on top.
    pub variables: BTreeMap<String, String>,
}

const DEFAULT_SUBJECT: &str = "Results $timestamp: $status";

impl RunConfiguration {
    /// Validate `input` against the environment. Every configuration error is
    /// raised here, before any step runs or any connection is attempted.
    pub fn build(input: RunInput, env: &EnvSnapshot) -> Result<Self> {
        let mode = RunMode::from_runstep(&input.runstep)?;
        let backend = Backend::from_name(&input.backend)?;

        let tf_file = input
            .tf
            .clone()
            .ok_or_else(|| Error::validation_missing_argument(vec!["--tf".to_string()]))?;
        if !tf_file.is_file() {
            return Err(Error::config_missing_file("tf", tf_file.display().to_string()));
        }

        let source = fs::read_to_string(&tf_file).map_err(|e| {
            Error::internal_io(e.to_string(), Some(format!("read {}", tf_file.display())))
        })?;
        let tf_vars = collect_tf_vars(env);
        let mut variables = parse_tf_variables(&source)?;
        variables.extend(tf_vars.clone());

        let timestamp = paths::resolve_timestamp(env, mode.is_single())?;

        let command = if mode.includes(Step::RemoteTests) {
            let key = mode.suite().command_key();
            let command = input
                .command
                .clone()
                .filter(|c| !c.trim().is_empty())
                .or_else(|| non_empty(&variables, key))
                .ok_or_else(|| {
                    Error::config_missing_key(key, Some(tf_file.display().to_string()))
                        .with_hint("Pass --command or define a default for the variable")
                })?;
            Some(command)
        } else {
            input.command.clone()
        };

        let git = if mode.includes(Step::GitSync) {
            let repo = input
                .gitrepo
                .clone()
                .or_else(|| non_empty(&variables, "CUCUMBER_GITREPO"))
                .ok_or_else(|| Error::config_missing_key("CUCUMBER_GITREPO", None))?;
            let reference = input
                .gitref
                .clone()
                .or_else(|| non_empty(&variables, "CUCUMBER_BRANCH"))
                .ok_or_else(|| Error::config_missing_key("CUCUMBER_BRANCH", None))?;
            Some(GitOptions {
                repo,
                reference,
                folder: input.gitfolder.clone(),
            })
        } else {
            None
        };

        let bastion = bastion_options(&input)?;
        let controller_secret = controller_secret(&input)?;

        if let Some(path) = &input.custom_repositories {
            if !path.is_file() {
                return Err(Error::config_missing_file(
                    "custom-repositories",
                    path.display().to_string(),
                ));
            }
        }

        let notify = NotifyOptions {
            subject: non_empty(&variables, "MAIL_SUBJECT")
                .unwrap_or_else(|| DEFAULT_SUBJECT.to_string()),
            mail_to: input.mail_to.clone().or_else(|| non_empty(&variables, "MAIL_TO")),
            mail_from: input
                .mail_from
                .clone()
                .or_else(|| non_empty(&variables, "MAIL_FROM")),
            webhook_url: input.webhook_url.clone(),
        };

        Ok(Self {
            mode,
            tf_file,
            backend,
            command,
            git,
            git_user: input.gituser,
            git_password: input.gitpassword,
            output_root: input.outputdir,
            timestamp,
            log_file: input.logfile,
            parallelism: input.parallelism.max(1),
            max_failure_lines: input.nlines,
            destroy: input.destroy,
            taint: input.taint,
            resource_cleaner: input.resource_cleaner,
            trust_new_host_keys: input.trust_new_host_keys,
            artifact_policy: if input.fail_on_empty_results {
                ArtifactPolicy::RequireAny
            } else {
                ArtifactPolicy::AlwaysSucceed
            },
            bastion,
            controller_user: input.controller_user,
            controller_secret,
            custom_repositories: input.custom_repositories,
            notify,
            tf_vars,
            variables,
        })
    }

    /// Overlay exported to remote commands, with the `TF_VAR_` prefix
    /// restored.
    pub fn remote_env(&self) -> BTreeMap<String, String> {
        self.tf_vars
            .iter()
            .map(|(k, v)| (format!("{}{}", TF_VAR_PREFIX, k), v.clone()))
            .collect()
    }

    /// Working directory for the provisioning backend.
    pub fn tf_dir(&self) -> &Path {
        self.tf_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }
}

fn non_empty(vars: &BTreeMap<String, String>, key: &str) -> Option<String> {
    vars.get(key).filter(|v| !v.trim().is_empty()).cloned()
}

fn expand(path: &str) -> String {
    shellexpand::tilde(path).to_string()
}

/// Bastion routing is requested by any bastion flag; it then needs a key
/// that exists on disk.
fn bastion_options(input: &RunInput) -> Result<Option<BastionOptions>> {
    let requested = input.bastion_key.is_some()
        || input.bastion_user.is_some()
        || input.bastion_hostname.is_some();
    if !requested {
        return Ok(None);
    }

    let key = match input.bastion_key.as_deref().filter(|k| !k.is_empty()) {
        Some(key) => expand(key),
        None => {
            return Err(Error::ssh_identity_file_not_found("bastion", "")
                .with_hint("Pass --bastion-key with the bastion's private key"))
        }
    };
    if !Path::new(&key).is_file() {
        return Err(Error::ssh_identity_file_not_found("bastion", key));
    }

    Ok(Some(BastionOptions {
        key,
        user: input
            .bastion_user
            .clone()
            .unwrap_or_else(|| "ec2-user".to_string()),
        hostname: input.bastion_hostname.clone().filter(|h| !h.is_empty()),
    }))
}

fn controller_secret(input: &RunInput) -> Result<Option<Secret>> {
    if let Some(key) = input.controller_key.as_deref().filter(|k| !k.is_empty()) {
        let key = expand(key);
        if !Path::new(&key).is_file() {
            return Err(Error::ssh_identity_file_not_found("controller", key));
        }
        return Ok(Some(Secret::IdentityFile(key)));
    }
    Ok(input
        .controller_password
        .clone()
        .map(Secret::Password))
}

/// Every `TF_VAR_<NAME>` variable, keyed by `<NAME>`.
pub fn collect_tf_vars(env: &EnvSnapshot) -> BTreeMap<String, String> {
    env.iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(TF_VAR_PREFIX)
                .filter(|name| !name.is_empty())
                .map(|name| (name.to_string(), value.clone()))
        })
        .collect()
}

/// Defaults of the `variable "<NAME>" { default = ... }` blocks in a
/// terraform file. Variables without a scalar default are skipped.
pub fn parse_tf_variables(source: &str) -> Result<BTreeMap<String, String>> {
    let body = hcl::parse(source)
        .map_err(|e| Error::config_invalid_value("tf", None, e.to_string()))?;

    let mut variables = BTreeMap::new();
    for block in body.blocks() {
        if block.identifier() != "variable" {
            continue;
        }
        let Some(name) = block.labels().first() else {
            continue;
        };
        let default = block
            .body()
            .attributes()
            .find(|attr| attr.key() == "default")
            .and_then(|attr| scalar_to_string(attr.expr()));
        if let Some(value) = default {
            variables.insert(name.as_str().to_string(), value);
        }
    }

    Ok(variables)
}

fn scalar_to_string(expr: &hcl::Expression) -> Option<String> {
    match expr {
        hcl::Expression::String(s) => Some(s.clone()),
        hcl::Expression::Bool(b) => Some(b.to_string()),
        hcl::Expression::Number(n) => Some(n.to_string()),
        hcl::Expression::TemplateExpr(template) => match template.as_ref() {
            hcl::TemplateExpr::QuotedString(s) => Some(s.clone()),
            _ => None,
        },
        _ => None,
    }
}

use clap::Args;
use std::path::PathBuf;

use envpipe::config::{self, RunConfiguration, RunInput};
use envpipe::credentials::RemoteContext;
use envpipe::git::GitCli;
use envpipe::logging::{self, RunLog};
use envpipe::notify::{MailNotifier, WebhookNotifier};
use envpipe::paths::OutputDirectory;
use envpipe::pipeline::{self, Pipeline, RunReport};
use envpipe::provision::TerraformBackend;
use envpipe::ssh::BastionTunnel;
use envpipe::ResultLedger;

use super::CmdResult;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Step to run: all, gitsync, provision, cucumber, getresults, mail,
    /// saltshaker, saltshaker_getresults, saltshaker_mail
    #[arg(long, default_value = "all")]
    pub runstep: String,

    /// Terraform main file describing the environment
    #[arg(long)]
    pub tf: Option<PathBuf>,

    /// Provisioning backend (libvirt or aws)
    #[arg(long, default_value = "libvirt")]
    pub backend: String,

    /// Git repository with the test suite
    #[arg(long)]
    pub gitrepo: Option<String>,

    /// Git reference (branch, tag or commit) to check out
    #[arg(long)]
    pub gitref: Option<String>,

    /// Local checkout folder
    #[arg(long, default_value = "./spacewalk")]
    pub gitfolder: PathBuf,

    #[arg(long)]
    pub gituser: Option<String>,

    #[arg(long)]
    pub gitpassword: Option<String>,

    /// Directory receiving one timestamped folder per run
    #[arg(long, default_value = ".")]
    pub outputdir: PathBuf,

    /// Log file (default: <output dir>/output.log)
    #[arg(long)]
    pub logfile: Option<PathBuf>,

    /// Private key for the bastion; enables bastion routing
    #[arg(long)]
    pub bastion_key: Option<String>,

    #[arg(long)]
    pub bastion_user: Option<String>,

    /// Bastion hostname, skipping the provisioning lookup
    #[arg(long)]
    pub bastion_hostname: Option<String>,

    #[arg(long, default_value = "root")]
    pub controller_user: String,

    #[arg(long)]
    pub controller_key: Option<String>,

    #[arg(long)]
    pub controller_password: Option<String>,

    /// Remote test command, overriding the configured default
    #[arg(long)]
    pub command: Option<String>,

    /// Custom repositories JSON pushed to the controller after provisioning
    #[arg(long)]
    pub custom_repositories: Option<PathBuf>,

    #[arg(long, default_value_t = 10)]
    pub parallelism: u32,

    /// Maximum failed tests listed in the notification
    #[arg(long, default_value_t = 20)]
    pub nlines: usize,

    /// Destroy the environment before provisioning
    #[arg(long)]
    pub destroy: bool,

    /// Recreate machines and disks on provisioning
    #[arg(long)]
    pub taint: bool,

    /// Refresh terraform state before provisioning
    #[arg(long = "use-tf-resource-cleaner")]
    pub use_tf_resource_cleaner: bool,

    /// Accept and pin host keys seen for the first time during this run
    #[arg(long)]
    pub trust_new_host_keys: bool,

    /// Fail result collection when no artifact was found
    #[arg(long)]
    pub fail_on_empty_results: bool,

    #[arg(long)]
    pub mail_to: Option<String>,

    #[arg(long)]
    pub mail_from: Option<String>,

    #[arg(long)]
    pub webhook_url: Option<String>,
}

impl From<RunArgs> for RunInput {
    fn from(args: RunArgs) -> Self {
        RunInput {
            runstep: args.runstep,
            tf: args.tf,
            backend: args.backend,
            gitrepo: args.gitrepo,
            gitref: args.gitref,
            gitfolder: args.gitfolder,
            gituser: args.gituser,
            gitpassword: args.gitpassword,
            outputdir: args.outputdir,
            logfile: args.logfile,
            bastion_key: args.bastion_key,
            bastion_user: args.bastion_user,
            bastion_hostname: args.bastion_hostname,
            controller_user: args.controller_user,
            controller_key: args.controller_key,
            controller_password: args.controller_password,
            command: args.command,
            custom_repositories: args.custom_repositories,
            parallelism: args.parallelism,
            nlines: args.nlines,
            destroy: args.destroy,
            taint: args.taint,
            resource_cleaner: args.use_tf_resource_cleaner,
            trust_new_host_keys: args.trust_new_host_keys,
            fail_on_empty_results: args.fail_on_empty_results,
            mail_to: args.mail_to,
            mail_from: args.mail_from,
            webhook_url: args.webhook_url,
        }
    }
}

pub fn run(args: RunArgs) -> CmdResult<RunReport> {
    let runstep = args.runstep.clone();
    let env = config::env_snapshot();
    let config = RunConfiguration::build(args.into(), &env)?;

    let output = OutputDirectory::new(&config.output_root, &config.timestamp);
    output.create()?;

    let log_file = config
        .log_file
        .clone()
        .unwrap_or_else(|| output.default_log_file());
    logging::init(&log_file)?;
    tracing::info!(
        runstep = %runstep,
        timestamp = %config.timestamp,
        output = %output.path().display(),
        "starting run"
    );

    let context = RemoteContext::from_config(&config, &output.known_hosts());
    let tunnels = BastionTunnel::new(context.host_keys.clone(), std::env::temp_dir());
    let backend = TerraformBackend::new(
        config.tf_dir(),
        config.remote_env().into_iter().collect(),
    );
    let mail = MailNotifier::new(
        output.mail_file(),
        config.notify.mail_to.clone(),
        config.notify.mail_from.clone(),
    );

    let mut executor = Pipeline::new(
        &config,
        output.clone(),
        context,
        Box::new(backend),
        Box::new(GitCli),
        Box::new(tunnels),
        Box::new(RunLog::open(&log_file)?),
    )
    .with_notifier(Box::new(mail));
    if let Some(url) = &config.notify.webhook_url {
        executor = executor.with_notifier(Box::new(WebhookNotifier::new(url.clone())));
    }

    let mut ledger = ResultLedger::new();
    pipeline::run(config.mode, &mut ledger, &mut executor)?;
    drop(executor);

    let summary = ledger.summary();
    let exit_code = summary.exit_code;
    tracing::info!(exit_code, "run finished");

    Ok((
        RunReport {
            runstep,
            timestamp: config.timestamp.clone(),
            output_dir: output.path().display().to_string(),
            ledger: summary,
        },
        exit_code,
    ))
}

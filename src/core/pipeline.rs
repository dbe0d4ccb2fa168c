//! Step orchestration.
//!
//! [`run`] decides which steps execute and records their outcomes; the work
//! itself is delegated to a [`StepExecutor`]. [`Pipeline`] is the executor
//! used by the CLI.

use std::io::Write;

use serde::Serialize;

use crate::artifacts::ArtifactCollector;
use crate::config::{RunConfiguration, RunMode};
use crate::credentials::RemoteContext;
use crate::error::{Error, Result};
use crate::git::GitSync;
use crate::ledger::{LedgerSummary, Outcome, ResultLedger, Step};
use crate::notify::{Composer, Notifier, ReportKind};
use crate::paths::OutputDirectory;
use crate::provision::{ProvisionOptions, Provisioner};
use crate::report::{self, TotalResult};
use crate::ssh::TunnelOpener;

/// Remote path of the custom repositories file on the controller.
pub const CUSTOM_REPOSITORIES_PATH: &str =
    "/root/spacewalk/testsuite/features/upload_files/custom_repositories.json";

pub trait StepExecutor {
    /// Resolve the controller and, when routed through a bastion, open the
    /// tunnel. Called before every controller-dependent step.
    fn prepare_remote_access(&mut self) -> Result<()>;
    fn git_sync(&mut self) -> Result<()>;
    fn provision(&mut self) -> Result<()>;
    fn remote_tests(&mut self) -> Result<()>;
    fn collect_results(&mut self) -> Result<()>;
    fn notify(&mut self, kind: ReportKind) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Run,
    Skip,
}

/// Whether `step` may run given its upstream slot.
pub fn gate(step: Step, mode: RunMode, ledger: &ResultLedger) -> Gate {
    let Some(upstream) = step.upstream() else {
        return Gate::Run;
    };
    match ledger.get(upstream) {
        Outcome::Succeeded => Gate::Run,
        Outcome::Failed => Gate::Skip,
        Outcome::NotAttempted => match mode {
            RunMode::Single { .. } => Gate::Run,
            RunMode::All => Gate::Skip,
        },
    }
}

/// Report to send from the notify step.
pub fn report_kind(mode: RunMode, ledger: &ResultLedger) -> ReportKind {
    match mode {
        RunMode::All => match ledger.get(Step::RemoteTests) {
            Outcome::NotAttempted => ReportKind::EnvironmentFailed,
            tests => ReportKind::TestResults { tests },
        },
        RunMode::Single { .. } => ReportKind::TestResults {
            tests: Outcome::NotAttempted,
        },
    }
}

fn execute(
    step: Step,
    mode: RunMode,
    ledger: &ResultLedger,
    executor: &mut dyn StepExecutor,
) -> Result<()> {
    if step.needs_controller() {
        executor.prepare_remote_access()?;
    }
    match step {
        Step::GitSync => executor.git_sync(),
        Step::Provision => executor.provision(),
        Step::RemoteTests => executor.remote_tests(),
        Step::CollectResults => executor.collect_results(),
        Step::Notify => executor.notify(report_kind(mode, ledger)),
    }
}

/// Run the steps selected by `mode` in order, recording each outcome.
///
/// A fatal error (configuration or credentials) stops the run and is
/// returned; the failing step's slot stays unrecorded. Any other error marks
/// the step `Failed` and the run continues.
pub fn run(mode: RunMode, ledger: &mut ResultLedger, executor: &mut dyn StepExecutor) -> Result<()> {
    for step in Step::ALL {
        if !mode.includes(step) {
            continue;
        }

        if gate(step, mode, ledger) == Gate::Skip {
            log_status!("pipeline", "Skipping {}", step);
            tracing::info!(step = %step, "skipped, upstream did not succeed");
            continue;
        }

        log_status!("pipeline", "Running {}", step);
        match execute(step, mode, ledger, executor) {
            Ok(()) => {
                tracing::info!(step = %step, "succeeded");
                ledger.record(step, Outcome::Succeeded);
            }
            Err(e) if e.is_fatal() => {
                tracing::error!(step = %step, code = e.code.as_str(), "{}", e.message);
                return Err(e);
            }
            Err(e) => {
                tracing::error!(step = %step, code = e.code.as_str(), "{}", e.message);
                ledger.record(step, Outcome::Failed);
            }
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub runstep: String,
    pub timestamp: String,
    pub output_dir: String,
    pub ledger: LedgerSummary,
}

/// Executor wiring configuration, credentials and collaborators together.
pub struct Pipeline<'a> {
    config: &'a RunConfiguration,
    output: OutputDirectory,
    context: RemoteContext,
    provisioner: Box<dyn Provisioner>,
    git: Box<dyn GitSync>,
    tunnels: Box<dyn TunnelOpener>,
    notifiers: Vec<Box<dyn Notifier>>,
    log: Box<dyn Write>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a RunConfiguration,
        output: OutputDirectory,
        context: RemoteContext,
        provisioner: Box<dyn Provisioner>,
        git: Box<dyn GitSync>,
        tunnels: Box<dyn TunnelOpener>,
        log: Box<dyn Write>,
    ) -> Self {
        Self {
            config,
            output,
            context,
            provisioner,
            git,
            tunnels,
            notifiers: Vec::new(),
            log,
        }
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn output(&self) -> &OutputDirectory {
        &self.output
    }

    fn provision_options(&self) -> ProvisionOptions {
        ProvisionOptions {
            parallelism: self.config.parallelism,
            destroy: self.config.destroy,
            taint: self
                .config
                .taint
                .then(|| self.config.backend.taint_pattern().to_string()),
            resource_cleaner: self.config.resource_cleaner,
        }
    }

    fn push_custom_repositories(&mut self) -> Result<()> {
        let config = self.config;
        let Some(path) = config.custom_repositories.as_deref() else {
            return Ok(());
        };
        self.prepare_remote_access()?;
        let client = self.context.controller_client()?;
        client.push_file(path, CUSTOM_REPOSITORIES_PATH)?;
        tracing::info!(file = %path.display(), "custom repositories installed on controller");
        Ok(())
    }
}

impl StepExecutor for Pipeline<'_> {
    fn prepare_remote_access(&mut self) -> Result<()> {
        let resource = self.config.mode.suite().controller_resource();
        self.context.connect_controller(
            resource,
            self.provisioner.as_lookup(),
            self.tunnels.as_ref(),
        )
    }

    fn git_sync(&mut self) -> Result<()> {
        let options = self.config.git.as_ref().ok_or_else(|| {
            Error::config_missing_key("CUCUMBER_GITREPO", None)
        })?;
        self.git.sync(options, &self.context.git, self.log.as_mut())
    }

    fn provision(&mut self) -> Result<()> {
        let options = self.provision_options();
        self.provisioner.provision(&options, self.log.as_mut())?;
        self.push_custom_repositories()
    }

    fn remote_tests(&mut self) -> Result<()> {
        let suite = self.config.mode.suite();
        let command = self
            .config
            .command
            .as_deref()
            .ok_or_else(|| Error::config_missing_key(suite.command_key(), None))?;
        let env = self.config.remote_env();
        let client = self.context.controller_client()?;
        client.run_checked(command, &env, self.log.as_mut())
    }

    fn collect_results(&mut self) -> Result<()> {
        let suite = self.config.mode.suite();
        let client = self.context.controller_client()?;
        let collected = ArtifactCollector::new(&client, self.config.artifact_policy).collect(
            suite.results_dir(),
            &suite.artifacts(),
            self.output.path(),
        )?;
        tracing::info!(
            pulled = collected.pulled.len(),
            empty = collected.empty.len(),
            not_found = collected.not_found.len(),
            "artifacts collected"
        );

        let summary = report::summarize_directory(self.output.path(), suite);
        let totals = TotalResult::new(summary.counts);
        report::write_total_result(&self.output.total_result(), &totals)?;
        log_status!(
            "collect",
            "{} tests, {} failed, {} skipped",
            totals.counts.total,
            totals.counts.failed,
            totals.counts.skipped
        );
        Ok(())
    }

    fn notify(&mut self, kind: ReportKind) -> Result<()> {
        let (totals, failures) = match kind {
            ReportKind::EnvironmentFailed => (None, Vec::new()),
            ReportKind::TestResults { .. } => {
                let totals = report::read_total_result(&self.output.total_result())?;
                let failures =
                    report::summarize_directory(self.output.path(), self.config.mode.suite())
                        .failures;
                (totals, failures)
            }
        };

        let composer = Composer {
            subject_template: &self.config.notify.subject,
            timestamp: &self.config.timestamp,
            output_dir: self.output.path(),
            max_failure_lines: self.config.max_failure_lines,
        };
        let notification = composer.compose(kind, totals.as_ref(), &failures);
        log_status!("notify", "{}", notification.subject);

        let mut first_error = None;
        for notifier in &self.notifiers {
            if let Err(e) = notifier.send(&notification) {
                tracing::error!(notifier = notifier.name(), "{}", e.message);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::Suite;

    #[derive(Default)]
    struct Script {
        fail: Vec<Step>,
        fatal: Option<Step>,
        calls: Vec<String>,
        kinds: Vec<ReportKind>,
    }

    impl Script {
        fn step(&mut self, step: Step) -> Result<()> {
            self.calls.push(step.as_str().to_string());
            if self.fatal == Some(step) {
                return Err(Error::config_missing_key("CUCUMBER_COMMAND", None));
            }
            if self.fail.contains(&step) {
                return Err(Error::internal_unexpected(format!("{} broke", step)));
            }
            Ok(())
        }
    }

    impl StepExecutor for Script {
        fn prepare_remote_access(&mut self) -> Result<()> {
            self.calls.push("prepare".to_string());
            Ok(())
        }
        fn git_sync(&mut self) -> Result<()> {
            self.step(Step::GitSync)
        }
        fn provision(&mut self) -> Result<()> {
            self.step(Step::Provision)
        }
        fn remote_tests(&mut self) -> Result<()> {
            self.step(Step::RemoteTests)
        }
        fn collect_results(&mut self) -> Result<()> {
            self.step(Step::CollectResults)
        }
        fn notify(&mut self, kind: ReportKind) -> Result<()> {
            self.kinds.push(kind);
            self.step(Step::Notify)
        }
    }

    fn single(step: Step) -> RunMode {
        RunMode::Single {
            step,
            suite: Suite::Cucumber,
        }
    }

    #[test]
    fn full_run_executes_every_step_in_order() {
        let mut script = Script::default();
        let mut ledger = ResultLedger::new();

        run(RunMode::All, &mut ledger, &mut script).unwrap();

        assert_eq!(
            script.calls,
            vec![
                "gitsync",
                "provision",
                "prepare",
                "remote-tests",
                "prepare",
                "collect-results",
                "notify"
            ]
        );
        assert_eq!(
            script.kinds,
            vec![ReportKind::TestResults {
                tests: Outcome::Succeeded
            }]
        );
        assert_eq!(ledger.exit_code(), 0);
    }

    #[test]
    fn provision_failure_skips_remote_steps_and_reports_environment() {
        let mut script = Script {
            fail: vec![Step::Provision],
            ..Script::default()
        };
        let mut ledger = ResultLedger::new();

        run(RunMode::All, &mut ledger, &mut script).unwrap();

        assert_eq!(ledger.get(Step::RemoteTests), Outcome::NotAttempted);
        assert_eq!(ledger.get(Step::CollectResults), Outcome::NotAttempted);
        assert_eq!(script.kinds, vec![ReportKind::EnvironmentFailed]);
        assert_eq!(ledger.exit_code(), 1);
    }

    #[test]
    fn failed_tests_block_collection_but_not_notification() {
        let mut script = Script {
            fail: vec![Step::RemoteTests],
            ..Script::default()
        };
        let mut ledger = ResultLedger::new();

        run(RunMode::All, &mut ledger, &mut script).unwrap();

        assert!(!script.calls.contains(&"collect-results".to_string()));
        assert_eq!(
            script.kinds,
            vec![ReportKind::TestResults {
                tests: Outcome::Failed
            }]
        );
        assert_eq!(ledger.exit_code(), 1);
    }

    #[test]
    fn notify_runs_exactly_once_whatever_fails() {
        for failing in Step::ALL {
            let mut script = Script {
                fail: vec![failing],
                ..Script::default()
            };
            let mut ledger = ResultLedger::new();
            run(RunMode::All, &mut ledger, &mut script).unwrap();
            assert_eq!(script.kinds.len(), 1, "failing {}", failing);
        }
    }

    #[test]
    fn single_step_runs_with_unattempted_upstream() {
        let mut script = Script::default();
        let mut ledger = ResultLedger::new();

        run(single(Step::CollectResults), &mut ledger, &mut script).unwrap();

        assert_eq!(script.calls, vec!["prepare", "collect-results"]);
        assert_eq!(ledger.get(Step::CollectResults), Outcome::Succeeded);
        assert_eq!(ledger.get(Step::RemoteTests), Outcome::NotAttempted);
    }

    #[test]
    fn single_step_notify_reports_test_results() {
        let mut script = Script::default();
        let mut ledger = ResultLedger::new();

        run(single(Step::Notify), &mut ledger, &mut script).unwrap();

        assert_eq!(
            script.kinds,
            vec![ReportKind::TestResults {
                tests: Outcome::NotAttempted
            }]
        );
    }

    #[test]
    fn gate_is_exhaustive_over_upstream_outcomes() {
        let mut failed = ResultLedger::new();
        failed.record(Step::RemoteTests, Outcome::Failed);
        let mut passed = ResultLedger::new();
        passed.record(Step::RemoteTests, Outcome::Succeeded);
        let empty = ResultLedger::new();
        let collect = single(Step::CollectResults);

        assert_eq!(gate(Step::CollectResults, collect, &failed), Gate::Skip);
        assert_eq!(gate(Step::CollectResults, RunMode::All, &failed), Gate::Skip);
        assert_eq!(gate(Step::CollectResults, RunMode::All, &passed), Gate::Run);
        assert_eq!(gate(Step::CollectResults, collect, &empty), Gate::Run);
        assert_eq!(gate(Step::CollectResults, RunMode::All, &empty), Gate::Skip);
        assert_eq!(gate(Step::GitSync, RunMode::All, &failed), Gate::Run);
    }

    #[test]
    fn fatal_error_aborts_without_recording() {
        let mut script = Script {
            fatal: Some(Step::RemoteTests),
            ..Script::default()
        };
        let mut ledger = ResultLedger::new();

        let err = run(RunMode::All, &mut ledger, &mut script).unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(ledger.get(Step::RemoteTests), Outcome::NotAttempted);
        assert!(script.kinds.is_empty());
    }
}

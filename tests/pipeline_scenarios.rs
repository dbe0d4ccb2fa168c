use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::rc::Rc;

use envpipe::config::{GitOptions, RunConfiguration, RunInput};
use envpipe::credentials::{GitCredentials, HostLookup, RemoteContext};
use envpipe::git::GitSync;
use envpipe::notify::{MailNotifier, Notification, Notifier, Verdict};
use envpipe::paths::OutputDirectory;
use envpipe::pipeline::{self, Pipeline};
use envpipe::provision::{ProvisionOptions, Provisioner};
use envpipe::report::{self, Counts, TotalResult};
use envpipe::ssh::{Endpoint, SshTarget, TunnelChannel, TunnelOpener};
use envpipe::{Error, Outcome, Result, ResultLedger, Step};
use tempfile::TempDir;

const MAIN_TF: &str = r#"
variable "CUCUMBER_COMMAND" {
  default = "cd /root/spacewalk/testsuite && rake cucumber:core"
}
variable "CUCUMBER_GITREPO" {
  default = "https://github.com/uyuni-project/uyuni.git"
}
variable "CUCUMBER_BRANCH" {
  default = "master"
}
variable "MAIL_SUBJECT" {
  default = "Test results $timestamp: $status"
}
"#;

struct FakeProvisioner {
    fail: bool,
    lookups: Rc<RefCell<Vec<String>>>,
}

impl HostLookup for FakeProvisioner {
    fn hostname(&self, resource: &str) -> Result<String> {
        self.lookups.borrow_mut().push(resource.to_string());
        Ok(format!("{}.invalid", resource))
    }
}

impl Provisioner for FakeProvisioner {
    fn provision(&self, options: &ProvisionOptions, sink: &mut dyn Write) -> Result<()> {
        writeln!(sink, "apply -parallelism={}", options.parallelism).unwrap();
        if self.fail {
            return Err(Error::provision_failed(envpipe::error::ProvisionFailedDetails {
                action: "apply".to_string(),
                exit_code: 1,
            }));
        }
        Ok(())
    }

    fn as_lookup(&self) -> &dyn HostLookup {
        self
    }
}

struct FakeGit;

impl GitSync for FakeGit {
    fn sync(&self, options: &GitOptions, _: &GitCredentials, sink: &mut dyn Write) -> Result<()> {
        writeln!(sink, "fetched {}", options.reference).unwrap();
        Ok(())
    }
}

struct NoTunnels;

impl TunnelOpener for NoTunnels {
    fn open(&self, bastion: &SshTarget, _: Endpoint) -> Result<TunnelChannel> {
        Err(Error::ssh_tunnel_failed(bastion.host.clone(), "not reachable in tests"))
    }
}

struct Recorder(Rc<RefCell<Vec<Notification>>>);

impl Notifier for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn send(&self, notification: &Notification) -> Result<()> {
        self.0.borrow_mut().push(notification.clone());
        Ok(())
    }
}

struct Harness {
    _dir: TempDir,
    config: RunConfiguration,
    output: OutputDirectory,
}

impl Harness {
    fn new(runstep: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let tf = dir.path().join("main.tf");
        fs::write(&tf, MAIN_TF).unwrap();

        let mut env = BTreeMap::new();
        env.insert("BUILD_NUMBER".to_string(), "11".to_string());
        let input = RunInput {
            runstep: runstep.to_string(),
            tf: Some(tf),
            outputdir: dir.path().join("results"),
            ..RunInput::default()
        };
        let config = RunConfiguration::build(input, &env).unwrap();
        let output = OutputDirectory::new(&config.output_root, &config.timestamp);
        output.create().unwrap();

        Self {
            _dir: dir,
            config,
            output,
        }
    }

    fn run(
        &self,
        provision_fails: bool,
    ) -> (ResultLedger, Vec<Notification>, Vec<String>, Vec<u8>) {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let lookups = Rc::new(RefCell::new(Vec::new()));
        let log = SharedLog::default();

        let mut executor = Pipeline::new(
            &self.config,
            self.output.clone(),
            RemoteContext::from_config(&self.config, &self.output.known_hosts()),
            Box::new(FakeProvisioner {
                fail: provision_fails,
                lookups: Rc::clone(&lookups),
            }),
            Box::new(FakeGit),
            Box::new(NoTunnels),
            Box::new(log.clone()),
        )
        .with_notifier(Box::new(MailNotifier::new(
            self.output.mail_file(),
            None,
            None,
        )))
        .with_notifier(Box::new(Recorder(Rc::clone(&sent))));

        let mut ledger = ResultLedger::new();
        pipeline::run(self.config.mode, &mut ledger, &mut executor).unwrap();
        drop(executor);

        let sent = sent.borrow().clone();
        let lookups = lookups.borrow().clone();
        let log = log.0.borrow().clone();
        (ledger, sent, lookups, log)
    }
}

#[derive(Clone, Default)]
struct SharedLog(Rc<RefCell<Vec<u8>>>);

impl Write for SharedLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn write_totals(output: &OutputDirectory, failed: u64, total: u64) {
    report::write_total_result(
        &output.total_result(),
        &TotalResult::new(Counts {
            passed: total - failed,
            failed,
            skipped: 0,
            total,
        }),
    )
    .unwrap();
}

#[test]
fn provision_failure_sends_environment_failed_and_exits_one() {
    let harness = Harness::new("all");

    let (ledger, sent, lookups, log) = harness.run(true);

    assert_eq!(ledger.get(Step::GitSync), Outcome::Succeeded);
    assert_eq!(ledger.get(Step::Provision), Outcome::Failed);
    assert_eq!(ledger.get(Step::RemoteTests), Outcome::NotAttempted);
    assert_eq!(ledger.get(Step::CollectResults), Outcome::NotAttempted);
    assert_eq!(ledger.get(Step::Notify), Outcome::Succeeded);
    assert_eq!(ledger.exit_code(), 1);

    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].verdict, Verdict::EnvironmentFailed);
    assert_eq!(sent[0].subject, "Test results build-11: ENVIRONMENT FAILED");
    assert!(lookups.is_empty(), "no controller access after failed provisioning");

    let mail = fs::read_to_string(harness.output.mail_file()).unwrap();
    assert!(mail.contains("ENVIRONMENT FAILED"));
    let log = String::from_utf8(log).unwrap();
    assert!(log.contains("fetched master"));
    assert!(log.contains("apply -parallelism=10"));
}

#[test]
fn single_step_mail_reports_passed_from_earlier_totals() {
    let harness = Harness::new("mail");
    write_totals(&harness.output, 0, 42);

    let (ledger, sent, _, _) = harness.run(false);

    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].verdict, Verdict::Passed);
    assert!(sent[0].body.contains("Total: 42"));
    assert_eq!(ledger.get(Step::Notify), Outcome::Succeeded);
    assert_eq!(ledger.exit_code(), 0);
}

#[test]
fn single_step_mail_with_failures_reports_failed() {
    let harness = Harness::new("mail");
    write_totals(&harness.output, 3, 42);

    let (ledger, sent, _, _) = harness.run(false);

    assert_eq!(sent[0].verdict, Verdict::Failed);
    assert_eq!(ledger.exit_code(), 0);
}

#[test]
fn single_step_mail_without_totals_reports_failed() {
    let harness = Harness::new("mail");

    let (_, sent, _, _) = harness.run(false);

    assert_eq!(sent[0].verdict, Verdict::Failed);
    assert!(sent[0].body.contains("No test results"));
}

#[test]
fn single_step_provision_leaves_other_slots_untouched() {
    let harness = Harness::new("provision");

    let (ledger, sent, _, _) = harness.run(false);

    assert!(sent.is_empty());
    assert_eq!(ledger.get(Step::Provision), Outcome::Succeeded);
    assert_eq!(ledger.get(Step::GitSync), Outcome::NotAttempted);
    assert_eq!(ledger.exit_code(), 0);
    assert!(!Path::new(&harness.output.mail_file()).exists());
}

#[test]
fn unreachable_controller_fails_only_the_remote_step() {
    let harness = Harness::new("cucumber");

    let (ledger, sent, lookups, _) = harness.run(false);

    // The hostname resolves in terraform but not in DNS: a transport
    // failure, recorded against the step.
    assert_eq!(lookups, vec!["controller".to_string()]);
    assert!(sent.is_empty());
    assert_eq!(ledger.get(Step::RemoteTests), Outcome::Failed);
    assert_eq!(ledger.exit_code(), 1);
}

/// Executor that succeeds at every step and composes a real notification
/// from the totals its collection step wrote.
struct AllGreen<'a> {
    output: &'a OutputDirectory,
    sent: Vec<Notification>,
}

impl pipeline::StepExecutor for AllGreen<'_> {
    fn prepare_remote_access(&mut self) -> Result<()> {
        Ok(())
    }
    fn git_sync(&mut self) -> Result<()> {
        Ok(())
    }
    fn provision(&mut self) -> Result<()> {
        Ok(())
    }
    fn remote_tests(&mut self) -> Result<()> {
        Ok(())
    }
    fn collect_results(&mut self) -> Result<()> {
        write_totals(self.output, 0, 7);
        Ok(())
    }
    fn notify(&mut self, kind: envpipe::notify::ReportKind) -> Result<()> {
        let totals = report::read_total_result(&self.output.total_result())?;
        let composer = envpipe::notify::Composer {
            subject_template: "$status",
            timestamp: "build-11",
            output_dir: self.output.path(),
            max_failure_lines: 20,
        };
        self.sent.push(composer.compose(kind, totals.as_ref(), &[]));
        Ok(())
    }
}

#[test]
fn full_success_reports_passed_and_exits_zero() {
    let harness = Harness::new("all");
    let mut executor = AllGreen {
        output: &harness.output,
        sent: Vec::new(),
    };
    let mut ledger = ResultLedger::new();

    pipeline::run(harness.config.mode, &mut ledger, &mut executor).unwrap();

    assert_eq!(executor.sent.len(), 1);
    assert_eq!(executor.sent[0].subject, "PASSED");
    assert!(ledger.entries().all(|(_, outcome)| outcome == Outcome::Succeeded));
    assert_eq!(ledger.exit_code(), 0);
}

//! Result notification: composition and delivery.

use crate::error::{Error, Result};
use crate::ledger::Outcome;
use crate::report::TotalResult;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

/// What the notification reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    /// The environment never reached the point of running tests.
    EnvironmentFailed,
    /// Test results, with the remote-tests outcome of this invocation
    /// (`NotAttempted` when the tests ran in an earlier invocation).
    TestResults { tests: Outcome },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Passed,
    Failed,
    EnvironmentFailed,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Passed => "PASSED",
            Verdict::Failed => "FAILED",
            Verdict::EnvironmentFailed => "ENVIRONMENT FAILED",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub subject: String,
    pub verdict: Verdict,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub totals: Option<TotalResult>,
    pub body: String,
}

pub struct Composer<'a> {
    pub subject_template: &'a str,
    pub timestamp: &'a str,
    pub output_dir: &'a Path,
    pub max_failure_lines: usize,
}

impl Composer<'_> {
    pub fn compose(
        &self,
        kind: ReportKind,
        totals: Option<&TotalResult>,
        failures: &[String],
    ) -> Notification {
        let verdict = match kind {
            ReportKind::EnvironmentFailed => Verdict::EnvironmentFailed,
            ReportKind::TestResults { tests } => match (tests, totals) {
                (Outcome::Failed, _) => Verdict::Failed,
                (_, Some(totals)) if totals.all_passed() => Verdict::Passed,
                _ => Verdict::Failed,
            },
        };

        let subject = self
            .subject_template
            .replace("$status", verdict.as_str())
            .replace("$timestamp", self.timestamp);

        let mut body = vec![
            format!("Status: {}", verdict.as_str()),
            format!("Run: {}", self.timestamp),
        ];

        match (kind, totals) {
            (ReportKind::EnvironmentFailed, _) => {
                body.push(String::new());
                body.push(
                    "The test environment could not be prepared; no tests were run.".to_string(),
                );
            }
            (_, Some(totals)) => {
                let c = &totals.counts;
                body.push(String::new());
                body.push(format!(
                    "Total: {}  Passed: {}  Failed: {}  Skipped: {}",
                    c.total, c.passed, c.failed, c.skipped
                ));
            }
            (_, None) => {
                body.push(String::new());
                body.push("No test results were collected.".to_string());
            }
        }

        if !failures.is_empty() {
            body.push(String::new());
            body.push("Failed:".to_string());
            body.extend(
                failures
                    .iter()
                    .take(self.max_failure_lines)
                    .map(|f| format!("  {}", f)),
            );
            if failures.len() > self.max_failure_lines {
                body.push(format!(
                    "  ... and {} more",
                    failures.len() - self.max_failure_lines
                ));
            }
        }

        body.push(String::new());
        body.push(format!("Artifacts: {}", self.output_dir.display()));

        Notification {
            subject,
            verdict,
            timestamp: self.timestamp.to_string(),
            totals: totals.cloned(),
            body: body.join("\n"),
        }
    }
}

pub trait Notifier {
    fn name(&self) -> &str;
    fn send(&self, notification: &Notification) -> Result<()>;
}

/// Writes the message to `mail.txt` and, when a recipient is configured,
/// hands it to `sendmail -t`.
pub struct MailNotifier {
    mail_file: PathBuf,
    to: Option<String>,
    from: Option<String>,
    sendmail: String,
}

impl MailNotifier {
    pub fn new(mail_file: PathBuf, to: Option<String>, from: Option<String>) -> Self {
        Self {
            mail_file,
            to,
            from,
            sendmail: "sendmail".to_string(),
        }
    }

    pub fn with_sendmail(mut self, program: impl Into<String>) -> Self {
        self.sendmail = program.into();
        self
    }

    pub fn render(&self, notification: &Notification) -> String {
        let mut headers = Vec::new();
        if let Some(to) = &self.to {
            headers.push(format!("To: {}", to));
        }
        if let Some(from) = &self.from {
            headers.push(format!("From: {}", from));
        }
        headers.push(format!("Subject: {}", notification.subject));
        format!("{}\n\n{}\n", headers.join("\n"), notification.body)
    }
}

impl Notifier for MailNotifier {
    fn name(&self) -> &str {
        "mail"
    }

    fn send(&self, notification: &Notification) -> Result<()> {
        let message = self.render(notification);
        fs::write(&self.mail_file, &message).map_err(|e| {
            Error::internal_io(e.to_string(), Some(format!("write {}", self.mail_file.display())))
        })?;
        log_status!("notify", "Wrote {}", self.mail_file.display());

        if self.to.is_none() {
            return Ok(());
        }

        let mut child = Command::new(&self.sendmail)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::notify_failed(self.name(), e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(message.as_bytes())
                .map_err(|e| Error::notify_failed(self.name(), e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| Error::notify_failed(self.name(), e.to_string()))?;
        if !output.status.success() {
            return Err(Error::notify_failed(
                self.name(),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }
}

/// Posts the notification as JSON.
pub struct WebhookNotifier {
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    fn send(&self, notification: &Notification) -> Result<()> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(format!("envpipe/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::internal_io(e.to_string(), Some("create HTTP client".to_string())))?;

        let response = client
            .post(&self.url)
            .json(notification)
            .send()
            .map_err(|e| Error::notify_failed(self.name(), e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::notify_failed(
                self.name(),
                format!("{} answered {}", self.url, response.status()),
            ));
        }
        Ok(())
    }
}

//! Test report totals computed from pulled artifacts.
//!
//! Cucumber runs leave `output*.json` reports (features, scenarios, steps);
//! other suites leave JUnit XML whose `<testsuite>` element carries the
//! counts. Totals are persisted as `total_result.json` so a later
//! notification step can read them without re-parsing artifacts.

use crate::error::{Error, Result};
use crate::suite::Suite;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub total: u64,
}

impl Counts {
    fn add(&mut self, other: Counts) {
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.total += other.total;
    }
}

/// Contents of `total_result.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalResult {
    #[serde(flatten)]
    pub counts: Counts,
    pub timestamp: String,
}

impl TotalResult {
    pub fn new(counts: Counts) -> Self {
        Self {
            counts,
            timestamp: chrono::Local::now().to_rfc3339(),
        }
    }

    pub fn all_passed(&self) -> bool {
        self.counts.failed == 0 && self.counts.total > 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReportSummary {
    pub counts: Counts,
    /// Names of failed scenarios or test cases, in report order.
    pub failures: Vec<String>,
    pub sources: Vec<PathBuf>,
}

impl ReportSummary {
    fn merge(&mut self, other: ReportSummary) {
        self.counts.add(other.counts);
        self.failures.extend(other.failures);
        self.sources.extend(other.sources);
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| Error::internal_io(e.to_string(), Some(format!("read {}", path.display()))))
}

fn matching(pattern: &Path) -> Vec<PathBuf> {
    let Some(pattern) = pattern.to_str() else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = match glob::glob(pattern) {
        Ok(entries) => entries.filter_map(|e| e.ok()).filter(|p| p.is_file()).collect(),
        Err(e) => {
            tracing::warn!(pattern, error = %e, "invalid report pattern");
            Vec::new()
        }
    };
    paths.sort();
    paths
}

/// Summarize the reports found below a local artifact directory.
///
/// Cucumber reports are preferred when present; JUnit XML is the fallback
/// (and the only source for suites that do not produce cucumber JSON).
/// Unreadable reports are skipped with a warning.
pub fn summarize_directory(dir: &Path, suite: Suite) -> ReportSummary {
    let mut summary = ReportSummary::default();

    if suite == Suite::Cucumber {
        for path in matching(&dir.join("output*.json")) {
            match read(&path).and_then(|raw| summarize_cucumber(&raw)) {
                Ok(mut found) => {
                    found.sources.push(path);
                    summary.merge(found);
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping report"),
            }
        }
        if !summary.is_empty() {
            return summary;
        }
    }

    let mut xml = matching(&dir.join("*.xml"));
    xml.extend(matching(&dir.join("results_junit").join("**").join("*.xml")));
    for path in xml {
        match read(&path) {
            Ok(raw) => {
                let mut found = summarize_junit(&raw);
                if found.counts.total == 0 && found.failures.is_empty() {
                    continue;
                }
                found.sources.push(path);
                summary.merge(found);
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping report"),
        }
    }

    summary
}

/// Scenario counts from a cucumber JSON report. A scenario fails when any of
/// its steps failed, is skipped when any step was skipped, pending or
/// undefined, and passes otherwise. Backgrounds are not scenarios.
pub fn summarize_cucumber(raw: &str) -> Result<ReportSummary> {
    let features: Value = serde_json::from_str(raw)
        .map_err(|e| Error::internal_json(e.to_string(), Some("parse cucumber report".to_string())))?;

    let mut summary = ReportSummary::default();
    let Some(features) = features.as_array() else {
        return Ok(summary);
    };

    for feature in features {
        let feature_name = feature["name"].as_str().unwrap_or_default();
        for element in feature["elements"].as_array().into_iter().flatten() {
            if element["type"].as_str() == Some("background") {
                continue;
            }

            let statuses: Vec<&str> = element["steps"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|step| step["result"]["status"].as_str())
                .collect();

            summary.counts.total += 1;
            if statuses.iter().any(|s| *s == "failed") {
                summary.counts.failed += 1;
                summary.failures.push(format!(
                    "{}: {}",
                    feature_name,
                    element["name"].as_str().unwrap_or_default()
                ));
            } else if statuses
                .iter()
                .any(|s| matches!(*s, "skipped" | "pending" | "undefined"))
            {
                summary.counts.skipped += 1;
            } else {
                summary.counts.passed += 1;
            }
        }
    }

    Ok(summary)
}

fn attribute(tag: &str, name: &str) -> u64 {
    let pattern = format!(r#"\b{}\s*=\s*"(\d+)""#, name);
    Regex::new(&pattern)
        .ok()
        .and_then(|re| re.captures(tag))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Totals from JUnit XML. Only `<testsuite>` elements are counted, so a
/// `<testsuites>` wrapper does not double the numbers. Errors count as
/// failures.
pub fn summarize_junit(raw: &str) -> ReportSummary {
    let mut summary = ReportSummary::default();

    let Ok(suite_tag) = Regex::new(r"<testsuite\b[^>]*>") else {
        return summary;
    };
    for tag in suite_tag.find_iter(raw) {
        let tag = tag.as_str();
        let tests = attribute(tag, "tests");
        let failed = attribute(tag, "failures") + attribute(tag, "errors");
        let skipped = attribute(tag, "skipped");
        summary.counts.total += tests;
        summary.counts.failed += failed;
        summary.counts.skipped += skipped;
        summary.counts.passed += tests.saturating_sub(failed + skipped);
    }

    let (Ok(case), Ok(name)) = (
        Regex::new(r"(?s)<testcase\b([^>]*?)(?:/>|>(.*?)</testcase>)"),
        Regex::new(r#"\bname\s*=\s*"([^"]*)""#),
    ) else {
        return summary;
    };
    for captures in case.captures_iter(raw) {
        let body = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
        if !(body.contains("<failure") || body.contains("<error")) {
            continue;
        }
        let attrs = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        if let Some(found) = name.captures(attrs).and_then(|c| c.get(1)) {
            summary.failures.push(found.as_str().to_string());
        }
    }

    summary
}

pub fn write_total_result(path: &Path, result: &TotalResult) -> Result<()> {
    let body = serde_json::to_string_pretty(result)
        .map_err(|e| Error::internal_json(e.to_string(), Some("serialize totals".to_string())))?;
    fs::write(path, body)
        .map_err(|e| Error::internal_io(e.to_string(), Some(format!("write {}", path.display()))))
}

/// Read totals written by an earlier collection. A missing file is `None`.
pub fn read_total_result(path: &Path) -> Result<Option<TotalResult>> {
    if !path.is_file() {
        return Ok(None);
    }
    let raw = read(path)?;
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| Error::internal_json(e.to_string(), Some(format!("parse {}", path.display()))))
}

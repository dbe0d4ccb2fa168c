//! Run logging.
//!
//! Diagnostics go through `tracing` to stderr and to the run's log file.
//! Output of terraform, git and remote commands is appended to the same file
//! through [`RunLog`].

use crate::error::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, IsTerminal, Write};
use std::path::Path;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| {
            Error::internal_io(e.to_string(), Some(format!("create {}", parent.display())))
        })?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::internal_io(e.to_string(), Some(format!("open {}", path.display()))))
}

/// Install the global subscriber. `RUST_LOG` overrides the default `info`
/// filter. Calling this twice keeps the first subscriber.
pub fn init(log_file: &Path) -> Result<()> {
    // Create the file up front so a bad path fails here, not in the appender
    open_append(log_file)?;

    let dir = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = log_file
        .file_name()
        .ok_or_else(|| Error::config_invalid_value("logfile", Some(log_file.display().to_string()), "not a file path"))?;
    let appender = tracing_appender::rolling::never(dir, name);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr).with_target(true))
        .with(fmt::layer().with_ansi(false).with_writer(appender))
        .try_init();

    if let Err(e) = result {
        tracing::debug!(error = %e, "tracing subscriber already installed");
    }
    Ok(())
}

/// Append-only sink for tool output, echoed to stdout when stdout is a
/// terminal.
pub struct RunLog {
    file: File,
    echo: bool,
}

impl RunLog {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            file: open_append(path)?,
            echo: io::stdout().is_terminal(),
        })
    }

    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }
}

impl Write for RunLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write_all(buf)?;
        if self.echo {
            io::stdout().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.echo {
            io::stdout().flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn run_log_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run/output.log");

        let mut log = RunLog::open(&path).unwrap().quiet();
        writeln!(log, "first").unwrap();
        drop(log);

        let mut log = RunLog::open(&path).unwrap().quiet();
        writeln!(log, "second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn init_creates_log_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/output.log");
        init(&path).unwrap();
        assert!(path.is_file());
    }
}

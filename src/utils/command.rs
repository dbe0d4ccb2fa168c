//! Command execution primitives with consistent error handling.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::sync::mpsc;
use std::thread;

use crate::error::{Error, Result};

/// Run a command in a specific directory and return trimmed stdout on success.
///
/// Returns an error with stderr (or stdout fallback) if it fails.
pub fn run_in(
    dir: &Path,
    program: &str,
    args: &[&str],
    envs: &[(String, String)],
    context: &str,
) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .current_dir(dir)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| {
            Error::internal_io(
                format!("Failed to run {}: {}", program, e),
                Some(context.to_string()),
            )
        })?;

    if !output.status.success() {
        return Err(Error::internal_io(
            format!("{} failed: {}", context, error_text(&output)),
            Some(context.to_string()),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run a command in a directory, streaming stdout and stderr into `sink` line
/// by line as they arrive. Returns the exit code (-1 when killed by a signal).
pub fn stream_in(
    dir: &Path,
    program: &str,
    args: &[&str],
    envs: &[(String, String)],
    sink: &mut dyn Write,
    context: &str,
) -> Result<i32> {
    let mut child = Command::new(program)
        .args(args)
        .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            Error::internal_io(
                format!("Failed to run {}: {}", program, e),
                Some(context.to_string()),
            )
        })?;

    stream_child(&mut child, sink)
        .map_err(|e| Error::internal_io(e.to_string(), Some(context.to_string())))?;

    let status = child
        .wait()
        .map_err(|e| Error::internal_io(e.to_string(), Some(context.to_string())))?;

    Ok(status.code().unwrap_or(-1))
}

/// Copy a spawned child's stdout and stderr into `sink`, interleaved in
/// arrival order. Returns everything that was read from stderr.
///
/// The child must have been spawned with piped stdout and stderr.
pub fn stream_child(child: &mut Child, sink: &mut dyn Write) -> io::Result<String> {
    let (tx, rx) = mpsc::channel::<(bool, Vec<u8>)>();

    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_line_reader(stdout, false, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_line_reader(stderr, true, tx.clone()));
    }
    drop(tx);

    let mut stderr_text = Vec::new();
    for (is_stderr, line) in rx {
        sink.write_all(&line)?;
        sink.flush()?;
        if is_stderr {
            stderr_text.extend_from_slice(&line);
        }
    }

    for reader in readers {
        reader
            .join()
            .map_err(|_| io::Error::other("output reader thread panicked"))??;
    }

    Ok(String::from_utf8_lossy(&stderr_text).to_string())
}

fn spawn_line_reader<R: Read + Send + 'static>(
    source: R,
    is_stderr: bool,
    tx: mpsc::Sender<(bool, Vec<u8>)>,
) -> thread::JoinHandle<io::Result<()>> {
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        loop {
            let mut line = Vec::new();
            if reader.read_until(b'\n', &mut line)? == 0 {
                return Ok(());
            }
            if tx.send((is_stderr, line)).is_err() {
                return Ok(());
            }
        }
    })
}

/// Extract error text from command output (stderr, falling back to stdout).
pub fn error_text(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        stderr
    }
}

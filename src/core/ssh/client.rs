use crate::credentials::Secret;
use crate::error::{
    Error, RemoteCommandFailedDetails, Result, SshConnectFailedDetails, TargetDetails,
};
use crate::ssh::{SshTarget, TunnelChannel};
use crate::utils::command::stream_child;
use crate::utils::shell;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// How unknown host keys are treated.
///
/// `TrustOnFirstUse` accepts and pins whatever key a host presents the first
/// time it is seen during this run. It exists for ephemeral test environments
/// whose host keys cannot be distributed ahead of time, and must be requested
/// explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    #[default]
    Strict,
    TrustOnFirstUse { known_hosts: PathBuf },
}

impl HostKeyPolicy {
    pub fn ssh_options(&self) -> Vec<String> {
        match self {
            HostKeyPolicy::Strict => vec!["-o".to_string(), "StrictHostKeyChecking=yes".to_string()],
            HostKeyPolicy::TrustOnFirstUse { known_hosts } => vec![
                "-o".to_string(),
                "StrictHostKeyChecking=accept-new".to_string(),
                "-o".to_string(),
                format!("UserKnownHostsFile={}", known_hosts.display()),
            ],
        }
    }
}

pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub exit_code: i32,
}

/// Outcome of a pull. A missing remote path is an expected condition, not an
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    Copied { entries: usize },
    NotFound,
}

/// Remote file retrieval, implemented over SSH by [`SshClient`].
pub trait RemoteFiles {
    /// Copy every regular file matching `remote_pattern` into `local_dir`.
    fn pull_file(&self, remote_pattern: &str, local_dir: &Path) -> Result<Transfer>;

    /// Mirror the remote directory tree at `remote_path` into `local_path`,
    /// merging into it when it already exists. An empty remote directory is
    /// `Copied { entries: 0 }`.
    fn pull_directory(&self, remote_path: &str, local_path: &Path) -> Result<Transfer>;
}

/// One SSH connection per call, optionally carried over a bastion tunnel.
pub struct SshClient<'a> {
    pub host: String,
    pub user: String,
    pub port: u16,
    secret: Option<Secret>,
    host_keys: HostKeyPolicy,
    proxy: Option<&'a TunnelChannel>,
    ssh_program: String,
    scp_program: String,
}

impl<'a> SshClient<'a> {
    pub fn new(
        target: &SshTarget,
        host_keys: &HostKeyPolicy,
        proxy: Option<&'a TunnelChannel>,
    ) -> Self {
        Self {
            host: target.host.clone(),
            user: target.user.clone(),
            port: target.port,
            secret: target.secret.clone(),
            host_keys: host_keys.clone(),
            proxy,
            ssh_program: "ssh".to_string(),
            scp_program: "scp".to_string(),
        }
    }

    /// Use other executables in place of `ssh` and `scp`.
    pub fn with_programs(mut self, ssh: impl Into<String>, scp: impl Into<String>) -> Self {
        self.ssh_program = ssh.into();
        self.scp_program = scp.into();
        self
    }

    pub fn via_bastion(&self) -> bool {
        self.proxy.is_some()
    }

    /// Options shared by `ssh` and `scp` (everything except the port flag).
    fn connection_options(&self) -> Vec<String> {
        let mut args = Vec::new();

        match &self.secret {
            Some(Secret::IdentityFile(path)) => {
                args.push("-i".to_string());
                args.push(path.clone());
                args.push("-o".to_string());
                args.push("IdentitiesOnly=yes".to_string());
                args.push("-o".to_string());
                args.push("BatchMode=yes".to_string());
            }
            // sshpass answers the password prompt, so batch mode must stay off
            Some(Secret::Password(_)) => {
                args.push("-o".to_string());
                args.push("PubkeyAuthentication=no".to_string());
            }
            None => {
                args.push("-o".to_string());
                args.push("BatchMode=yes".to_string());
            }
        }

        // Timeouts and keepalive so a stalled connection surfaces as an error
        args.extend([
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
        ]);

        args.extend(self.host_keys.ssh_options());

        if let Some(channel) = self.proxy {
            args.push("-o".to_string());
            args.push(format!("ProxyCommand={}", channel.proxy_command()));
        }

        args
    }

    pub fn build_ssh_args(&self, command: Option<&str>) -> Vec<String> {
        let mut args = self.connection_options();

        if self.port != 22 {
            args.push("-p".to_string());
            args.push(self.port.to_string());
        }

        args.push(format!("{}@{}", self.user, self.host));

        if let Some(cmd) = command {
            args.push(cmd.to_string());
        }

        args
    }

    pub fn build_scp_args(&self, recursive: bool) -> Vec<String> {
        let mut args = vec!["-O".to_string()]; // legacy protocol: the remote shell expands globs
        args.extend(self.connection_options());

        if self.port != 22 {
            args.push("-P".to_string()); // scp uses -P (uppercase) for port
            args.push(self.port.to_string());
        }

        if recursive {
            args.push("-r".to_string());
        }

        args
    }

    fn remote_spec(&self, path: &str) -> String {
        format!("{}@{}:{}", self.user, self.host, path)
    }

    /// Build the process for an OpenSSH tool, wrapped in `sshpass` when the
    /// secret is a password.
    fn tool(&self, program: &str, args: &[String]) -> Command {
        match &self.secret {
            Some(Secret::Password(password)) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg(program).args(args).env("SSHPASS", password);
                cmd
            }
            _ => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        }
    }

    fn target_details(&self) -> TargetDetails {
        TargetDetails {
            host: Some(self.host.clone()),
            user: Some(self.user.clone()),
            via_bastion: self.via_bastion(),
        }
    }

    fn connect_failed(&self, stderr: &str, exit_code: i32) -> Error {
        Error::ssh_connect_failed(SshConnectFailedDetails {
            host: self.host.clone(),
            stderr: stderr.trim().to_string(),
            exit_code,
        })
    }

    /// Run `command` remotely with `env` exported, streaming combined output
    /// into `sink`. Returns the remote exit status; transport failures are
    /// errors.
    ///
    /// ssh exits 255 both for its own failures and when the remote command
    /// does. The remote side writes stderr into stdout, so only a 255 that
    /// comes with diagnostics on the local stderr is a connection failure.
    pub fn run_command(
        &self,
        command: &str,
        env: &BTreeMap<String, String>,
        sink: &mut dyn Write,
    ) -> Result<i32> {
        let script = remote_script(command, env);
        let args = self.build_ssh_args(Some(&script));

        log_status!("ssh", "Running on {}: {}", self.host, command);

        let mut child = self
            .tool(&self.ssh_program, &args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.connect_failed(&format!("SSH error: {}", e), -1))?;

        let stderr = stream_child(&mut child, sink)
            .map_err(|e| Error::internal_io(e.to_string(), Some("stream remote output".into())))?;
        let status = child
            .wait()
            .map_err(|e| Error::internal_io(e.to_string(), Some("wait for ssh".into())))?;
        let exit_code = status.code().unwrap_or(-1);

        if exit_code == 255 {
            let diagnostics = ssh_diagnostics(&stderr);
            if !diagnostics.is_empty() {
                return Err(self.connect_failed(&diagnostics, exit_code));
            }
        }

        Ok(exit_code)
    }

    /// Like [`run_command`](Self::run_command) but a non-zero exit status is
    /// returned as a `remote.command_failed` error.
    pub fn run_checked(
        &self,
        command: &str,
        env: &BTreeMap<String, String>,
        sink: &mut dyn Write,
    ) -> Result<()> {
        match self.run_command(command, env, sink)? {
            0 => Ok(()),
            exit_code => Err(Error::remote_command_failed(RemoteCommandFailedDetails {
                command: command.to_string(),
                exit_code,
                target: self.target_details(),
            })),
        }
    }

    /// Run a short probe and capture its output. Probes never exit 255
    /// themselves, so that status is always a connection failure.
    pub fn capture(&self, command: &str) -> Result<CommandOutput> {
        let args = self.build_ssh_args(Some(command));
        let out = self
            .tool(&self.ssh_program, &args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| self.connect_failed(&format!("SSH error: {}", e), -1))?;

        let output = CommandOutput {
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
            success: out.status.success(),
            exit_code: out.status.code().unwrap_or(-1),
        };

        if output.exit_code == 255 {
            return Err(self.connect_failed(&output.stderr, output.exit_code));
        }

        Ok(output)
    }

    /// Upload one local file to an absolute remote path, creating parent
    /// directories and overwriting the destination.
    pub fn push_file(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let file = fs::File::open(local_path).map_err(|e| {
            Error::internal_io(
                e.to_string(),
                Some(format!("open {}", local_path.display())),
            )
        })?;

        let parent = Path::new(remote_path)
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/".to_string());
        let remote_command = format!(
            "mkdir -p {} && cat > {}",
            shell::quote_path(&parent),
            shell::quote_path(remote_path)
        );
        let args = self.build_ssh_args(Some(&remote_command));

        log_status!(
            "transfer",
            "Pushing {} -> {}:{}",
            local_path.display(),
            self.host,
            remote_path
        );

        let out = self
            .tool(&self.ssh_program, &args)
            .stdin(file)
            .output()
            .map_err(|e| self.connect_failed(&format!("SSH error: {}", e), -1))?;

        let stderr = String::from_utf8_lossy(&out.stderr).to_string();
        match out.status.code().unwrap_or(-1) {
            0 => Ok(()),
            255 => Err(self.connect_failed(&stderr, 255)),
            _ => Err(Error::remote_transfer_failed(remote_path, stderr)),
        }
    }

    fn execute_scp(&self, args: &[String], what: &str) -> Result<()> {
        let out = self
            .tool(&self.scp_program, args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::remote_transfer_failed(what, format!("Failed to execute scp: {}", e)))?;

        if out.status.success() {
            Ok(())
        } else {
            Err(Error::remote_transfer_failed(
                what,
                String::from_utf8_lossy(&out.stderr).to_string(),
            ))
        }
    }
}

impl RemoteFiles for SshClient<'_> {
    fn pull_file(&self, remote_pattern: &str, local_dir: &Path) -> Result<Transfer> {
        let probe = self.capture(&regular_files_probe(remote_pattern))?;
        let files = listed(&probe.stdout);
        if files.is_empty() {
            return Ok(Transfer::NotFound);
        }

        ensure_dir(local_dir)?;

        let mut args = self.build_scp_args(false);
        args.push(self.remote_spec(&quote_each(files.iter().map(|f| f.to_string()))));
        args.push(format!("{}/", local_dir.display()));

        log_status!(
            "transfer",
            "Pulling {}:{} -> {}",
            self.host,
            remote_pattern,
            local_dir.display()
        );
        self.execute_scp(&args, remote_pattern)?;

        Ok(Transfer::Copied {
            entries: files.len(),
        })
    }

    fn pull_directory(&self, remote_path: &str, local_path: &Path) -> Result<Transfer> {
        let quoted = shell::quote_path(remote_path);
        let probe = self.capture(&format!("test -d {0} && ls -A {0}", quoted))?;
        if !probe.success {
            return Ok(Transfer::NotFound);
        }

        ensure_dir(local_path)?;

        let entries = listed(&probe.stdout);
        if entries.is_empty() {
            return Ok(Transfer::Copied { entries: 0 });
        }

        // Entries are copied one by one into the local tree, so an existing
        // local directory is merged into instead of nested
        let base = remote_path.trim_end_matches('/');
        let mut args = self.build_scp_args(true);
        args.push(self.remote_spec(&quote_each(
            entries.iter().map(|entry| format!("{}/{}", base, entry)),
        )));
        args.push(local_path.display().to_string());

        log_status!(
            "transfer",
            "Pulling {}:{} -> {}",
            self.host,
            remote_path,
            local_path.display()
        );
        self.execute_scp(&args, remote_path)?;

        Ok(Transfer::Copied {
            entries: entries.len(),
        })
    }
}

/// Remote script printing the regular files matching `pattern`, one per
/// line. The pattern is left unquoted so the remote shell expands it.
fn regular_files_probe(pattern: &str) -> String {
    format!(
        "for f in {}; do [ -f \"$f\" ] && printf '%s\\n' \"$f\"; done; exit 0",
        pattern
    )
}

fn listed(stdout: &str) -> Vec<&str> {
    stdout.lines().filter(|l| !l.trim().is_empty()).collect()
}

/// Several remote paths in one scp source; the remote shell splits them.
fn quote_each(paths: impl Iterator<Item = String>) -> String {
    paths
        .map(|p| shell::quote_path(&p))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Local stderr of an ssh process without the informational host key notice
/// printed on first contact.
fn ssh_diagnostics(stderr: &str) -> String {
    stderr
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.starts_with("Warning: Permanently added"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| {
        Error::internal_io(e.to_string(), Some(format!("create directory {}", dir.display())))
    })
}

/// Remote shell script for a command: stderr merged into stdout, then the
/// variable overlay exported, then the command itself.
pub fn remote_script(command: &str, env: &BTreeMap<String, String>) -> String {
    let exports = shell::export_statement(env);
    if exports.is_empty() {
        format!("exec 2>&1; {}", command)
    } else {
        format!("exec 2>&1; {} {}", exports, command)
    }
}

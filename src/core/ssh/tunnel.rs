//! Bastion tunnel: one control-master SSH session to the bastion per run,
//! with a direct-tcpip channel to the controller's SSH port multiplexed over
//! it for every controller connection.

use crate::credentials::Secret;
use crate::error::{Error, Result};
use crate::ssh::{HostKeyPolicy, SshTarget};
use crate::utils::shell;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Forwarded TCP stream from the bastion's network namespace to the
/// controller. Owns the bastion session; dropping the channel closes it.
#[derive(Debug)]
pub struct TunnelChannel {
    pub source: Endpoint,
    pub destination: Endpoint,
    session: BastionSession,
}

impl TunnelChannel {
    /// `ProxyCommand` that opens the channel over the running bastion session.
    pub fn proxy_command(&self) -> String {
        let mut args = vec![
            "ssh".to_string(),
            "-S".to_string(),
            self.session.control_path.display().to_string(),
            "-o".to_string(),
            "ControlMaster=no".to_string(),
        ];
        args.extend(self.session.host_keys.ssh_options());
        if self.source.port != 22 {
            args.push("-p".to_string());
            args.push(self.source.port.to_string());
        }
        args.push("-W".to_string());
        args.push(self.destination.to_string());
        args.push(self.session.destination.clone());
        shell::quote_args(&args)
    }

    #[cfg(test)]
    pub(crate) fn detached(source: Endpoint, destination: Endpoint, control_path: PathBuf) -> Self {
        Self {
            session: BastionSession {
                destination: format!("tester@{}", source.host),
                control_path,
                host_keys: HostKeyPolicy::Strict,
                live: false,
            },
            source,
            destination,
        }
    }
}

#[derive(Debug)]
struct BastionSession {
    destination: String,
    control_path: PathBuf,
    host_keys: HostKeyPolicy,
    live: bool,
}

impl Drop for BastionSession {
    fn drop(&mut self) {
        if !self.live {
            return;
        }
        let closed = Command::new("ssh")
            .arg("-S")
            .arg(&self.control_path)
            .args(["-O", "exit"])
            .arg(&self.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = closed {
            tracing::warn!(error = %e, "could not close bastion session");
        }
        let _ = fs::remove_file(&self.control_path);
    }
}

/// Opens a channel from the bastion to a destination endpoint.
pub trait TunnelOpener {
    fn open(&self, bastion: &SshTarget, destination: Endpoint) -> Result<TunnelChannel>;
}

/// OpenSSH control-master implementation of [`TunnelOpener`].
pub struct BastionTunnel {
    host_keys: HostKeyPolicy,
    control_dir: PathBuf,
}

impl BastionTunnel {
    pub fn new(host_keys: HostKeyPolicy, control_dir: impl Into<PathBuf>) -> Self {
        Self {
            host_keys,
            control_dir: control_dir.into(),
        }
    }

    fn control_path(&self) -> PathBuf {
        // Unix socket paths are short; keep the name compact
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.control_dir.join(format!("envpipe-{}.sock", &id[..12]))
    }

    fn master_args(&self, bastion: &SshTarget, key: &str, control_path: &Path) -> Vec<String> {
        let mut args = vec![
            "-M".to_string(),
            "-S".to_string(),
            control_path.display().to_string(),
            "-f".to_string(),
            "-N".to_string(),
            "-E".to_string(),
            log_path(control_path).display().to_string(),
            "-i".to_string(),
            key.to_string(),
            "-o".to_string(),
            "IdentitiesOnly=yes".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
        ];
        args.extend(self.host_keys.ssh_options());
        if bastion.port != 22 {
            args.push("-p".to_string());
            args.push(bastion.port.to_string());
        }
        args.push(bastion.destination());
        args
    }
}

fn log_path(control_path: &Path) -> PathBuf {
    control_path.with_extension("log")
}

/// The bastion only accepts key authentication.
pub fn bastion_key(bastion: &SshTarget) -> Result<String> {
    match &bastion.secret {
        Some(Secret::IdentityFile(path)) if Path::new(path).is_file() => Ok(path.clone()),
        Some(Secret::IdentityFile(path)) => {
            Err(Error::ssh_identity_file_not_found("bastion", path.clone()))
        }
        _ => Err(Error::ssh_identity_file_not_found("bastion", "")),
    }
}

impl TunnelOpener for BastionTunnel {
    fn open(&self, bastion: &SshTarget, destination: Endpoint) -> Result<TunnelChannel> {
        let key = bastion_key(bastion)?;
        let control_path = self.control_path();
        let args = self.master_args(bastion, &key, &control_path);

        log_status!(
            "tunnel",
            "Opening bastion session {} -> {}",
            bastion.endpoint(),
            destination
        );

        // -f backgrounds ssh after authentication, so the exit status tells
        // whether the session is up. Output goes to the -E log file.
        let status = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| Error::ssh_tunnel_failed(bastion.host.clone(), e.to_string()))?;

        let log = fs::read_to_string(log_path(&control_path)).unwrap_or_default();
        let _ = fs::remove_file(log_path(&control_path));

        if !status.success() {
            return Err(Error::ssh_tunnel_failed(bastion.host.clone(), log));
        }

        tracing::info!(
            bastion = %bastion.endpoint(),
            destination = %destination,
            "bastion tunnel established"
        );

        Ok(TunnelChannel {
            source: bastion.endpoint(),
            destination,
            session: BastionSession {
                destination: bastion.destination(),
                control_path,
                host_keys: self.host_keys.clone(),
                live: true,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn bastion(secret: Option<Secret>) -> SshTarget {
        SshTarget {
            host: "bastion.example.com".to_string(),
            user: "ec2-user".to_string(),
            port: 22,
            secret,
        }
    }

    #[test]
    fn proxy_command_forwards_to_controller_over_control_socket() {
        let channel = TunnelChannel::detached(
            Endpoint {
                host: "bastion.example.com".into(),
                port: 22,
            },
            Endpoint {
                host: "ctl.internal".into(),
                port: 22,
            },
            PathBuf::from("/tmp/envpipe-abc.sock"),
        );

        let proxy = channel.proxy_command();
        assert!(proxy.starts_with("ssh -S /tmp/envpipe-abc.sock -o ControlMaster=no"));
        assert!(proxy.contains("-W ctl.internal:22"));
        assert!(proxy.ends_with("tester@bastion.example.com"));
    }

    #[test]
    fn bastion_without_key_is_a_credential_error() {
        let err = bastion_key(&bastion(None)).unwrap_err();
        assert_eq!(err.code.as_str(), "ssh.identity_file_not_found");
        assert!(err.is_fatal());

        let err = bastion_key(&bastion(Some(Secret::Password("pw".into())))).unwrap_err();
        assert_eq!(err.code.as_str(), "ssh.identity_file_not_found");
    }

    #[test]
    fn bastion_key_must_exist_on_disk() {
        let dir = tempdir().unwrap();
        let key = dir.path().join("id_bastion");
        let target = bastion(Some(Secret::IdentityFile(key.display().to_string())));
        assert!(bastion_key(&target).is_err());

        fs::write(&key, "key").unwrap();
        assert_eq!(bastion_key(&target).unwrap(), key.display().to_string());
    }

    #[test]
    fn master_args_request_persistent_background_session() {
        let tunnel = BastionTunnel::new(HostKeyPolicy::Strict, "/tmp");
        let target = bastion(None);
        let args = tunnel.master_args(&target, "/keys/bastion", Path::new("/tmp/x.sock"));

        assert_eq!(&args[0..3], &["-M", "-S", "/tmp/x.sock"]);
        assert!(args.contains(&"-f".to_string()));
        assert!(args.contains(&"-N".to_string()));
        assert!(args.contains(&"ControlPersist=yes".to_string()));
        assert!(args.contains(&"/tmp/x.log".to_string()));
        assert_eq!(args.last().unwrap(), "ec2-user@bastion.example.com");
    }
}

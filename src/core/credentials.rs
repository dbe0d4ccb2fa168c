//! Connection credentials for the controller, the bastion and git.
//!
//! Host credentials follow a construct-then-resolve lifecycle: they are built
//! from CLI input with no hostname (unless pinned), and the hostname is filled
//! in on first need from the provisioning backend. The controller record also
//! receives the bastion tunnel channel once one is opened.

use crate::config::RunConfiguration;
use crate::error::{Error, Result};
use crate::ssh::{Endpoint, HostKeyPolicy, SshClient, SshTarget, TunnelChannel, TunnelOpener};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

#[derive(Clone, PartialEq, Eq)]
pub enum Secret {
    Password(String),
    IdentityFile(String),
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Secret::Password(_) => f.write_str("Password(***)"),
            Secret::IdentityFile(path) => f.debug_tuple("IdentityFile").field(path).finish(),
        }
    }
}

/// Hostname lookup offered by the provisioning backend.
pub trait HostLookup {
    fn hostname(&self, resource: &str) -> Result<String>;
}

#[derive(Debug)]
pub struct HostCredentials {
    pub role: &'static str,
    hostname: Option<String>,
    pub user: String,
    pub port: u16,
    pub secret: Option<Secret>,
    proxy: Option<TunnelChannel>,
}

impl HostCredentials {
    pub fn new(role: &'static str, user: impl Into<String>, secret: Option<Secret>) -> Self {
        Self {
            role,
            hostname: None,
            user: user.into(),
            port: 22,
            secret,
            proxy: None,
        }
    }

    /// Pin the hostname so it is never looked up.
    pub fn pinned(mut self, hostname: Option<String>) -> Self {
        self.hostname = hostname.filter(|h| !h.is_empty());
        self
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Fill in the hostname from `lookup` unless it is already known.
    pub fn resolve(&mut self, lookup: &dyn HostLookup, resource: &str) -> Result<&str> {
        if self.hostname.is_none() {
            let host = lookup.hostname(resource)?;
            tracing::info!(role = self.role, resource, host = %host, "resolved hostname");
            self.hostname = Some(host);
        }
        Ok(self.hostname.as_deref().unwrap_or_default())
    }

    pub fn target(&self) -> Result<SshTarget> {
        let host = self.hostname.clone().ok_or_else(|| {
            Error::internal_unexpected(format!("{} hostname used before resolution", self.role))
        })?;
        Ok(SshTarget {
            host,
            user: self.user.clone(),
            port: self.port,
            secret: self.secret.clone(),
        })
    }

    pub fn proxy(&self) -> Option<&TunnelChannel> {
        self.proxy.as_ref()
    }

    pub fn attach_proxy(&mut self, channel: TunnelChannel) {
        self.proxy = Some(channel);
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct GitCredentials {
    pub user: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for GitCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitCredentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl GitCredentials {
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }
}

/// Explicit CLI values win, then `GIT_USER`/`GIT_PASSWORD` from the
/// terraform variable overlay, otherwise unauthenticated. Never fails:
/// bad credentials surface from the transport later.
pub fn resolve_git_credentials(
    cli_user: Option<&str>,
    cli_password: Option<&str>,
    tf_vars: &BTreeMap<String, String>,
) -> GitCredentials {
    if let Some(user) = cli_user.filter(|u| !u.is_empty()) {
        return GitCredentials {
            user: Some(user.to_string()),
            password: cli_password.map(str::to_string),
        };
    }

    match tf_vars.get("GIT_USER").filter(|u| !u.is_empty()) {
        Some(user) => GitCredentials {
            user: Some(user.clone()),
            password: tf_vars.get("GIT_PASSWORD").cloned(),
        },
        None => GitCredentials::default(),
    }
}

/// Everything a step needs to reach remote hosts. Passed explicitly (by
/// `&mut` while hostnames and the tunnel are being filled in).
#[derive(Debug)]
pub struct RemoteContext {
    pub controller: HostCredentials,
    /// Present when bastion routing was requested.
    pub bastion: Option<HostCredentials>,
    pub git: GitCredentials,
    pub host_keys: HostKeyPolicy,
}

pub const BASTION_RESOURCE: &str = "bastion";

impl RemoteContext {
    /// Unresolved credentials for a run. `known_hosts` is only used when new
    /// host keys are trusted.
    pub fn from_config(config: &RunConfiguration, known_hosts: &Path) -> Self {
        let bastion = config.bastion.as_ref().map(|b| {
            HostCredentials::new("bastion", b.user.clone(), Some(Secret::IdentityFile(b.key.clone())))
                .pinned(b.hostname.clone())
        });

        let host_keys = if config.trust_new_host_keys {
            HostKeyPolicy::TrustOnFirstUse {
                known_hosts: known_hosts.to_path_buf(),
            }
        } else {
            HostKeyPolicy::Strict
        };

        Self {
            controller: HostCredentials::new(
                "controller",
                config.controller_user.clone(),
                config.controller_secret.clone(),
            ),
            bastion,
            git: resolve_git_credentials(
                config.git_user.as_deref(),
                config.git_password.as_deref(),
                &config.tf_vars,
            ),
            host_keys,
        }
    }

    /// Resolve the controller (named `resource` in the provisioning backend)
    /// and, when routing through a bastion, resolve the bastion and open the
    /// tunnel. Both hostnames are known before the channel is requested. Safe
    /// to call repeatedly; work already done is kept.
    pub fn connect_controller(
        &mut self,
        resource: &str,
        lookup: &dyn HostLookup,
        opener: &dyn TunnelOpener,
    ) -> Result<()> {
        let controller_host = self.controller.resolve(lookup, resource)?.to_string();

        let Some(bastion) = self.bastion.as_mut() else {
            return Ok(());
        };
        if self.controller.proxy().is_some() {
            return Ok(());
        }

        bastion.resolve(lookup, BASTION_RESOURCE)?;
        let bastion_target = bastion.target()?;
        let destination = Endpoint {
            host: controller_host,
            port: self.controller.port,
        };

        let channel = opener.open(&bastion_target, destination)?;
        self.controller.attach_proxy(channel);
        Ok(())
    }

    pub fn controller_client(&self) -> Result<SshClient<'_>> {
        let target = self.controller.target()?;
        Ok(SshClient::new(
            &target,
            &self.host_keys,
            self.controller.proxy(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::path::PathBuf;

    struct RecordingLookup {
        calls: RefCell<Vec<String>>,
    }

    impl RecordingLookup {
        fn new() -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl HostLookup for RecordingLookup {
        fn hostname(&self, resource: &str) -> Result<String> {
            self.calls.borrow_mut().push(resource.to_string());
            Ok(format!("{}.tf.local", resource))
        }
    }

    struct RecordingOpener {
        opened: RefCell<Vec<(String, String)>>,
    }

    impl TunnelOpener for RecordingOpener {
        fn open(&self, bastion: &SshTarget, destination: Endpoint) -> Result<TunnelChannel> {
            self.opened
                .borrow_mut()
                .push((bastion.host.clone(), destination.to_string()));
            Ok(TunnelChannel::detached(
                bastion.endpoint(),
                destination,
                PathBuf::from("/tmp/test.sock"),
            ))
        }
    }

    fn context(bastion: Option<HostCredentials>) -> RemoteContext {
        RemoteContext {
            controller: HostCredentials::new("controller", "root", None),
            bastion,
            git: GitCredentials::default(),
            host_keys: HostKeyPolicy::Strict,
        }
    }

    fn bastion_creds() -> HostCredentials {
        HostCredentials::new(
            "bastion",
            "ec2-user",
            Some(Secret::IdentityFile("/keys/bastion".into())),
        )
    }

    #[test]
    fn git_credentials_prefer_cli_values() {
        let mut vars = BTreeMap::new();
        vars.insert("GIT_USER".to_string(), "env-user".to_string());
        vars.insert("GIT_PASSWORD".to_string(), "env-pass".to_string());

        let creds = resolve_git_credentials(Some("cli-user"), Some("cli-pass"), &vars);
        assert_eq!(creds.user.as_deref(), Some("cli-user"));
        assert_eq!(creds.password.as_deref(), Some("cli-pass"));
    }

    #[test]
    fn git_credentials_fall_back_to_tf_vars_then_none() {
        let mut vars = BTreeMap::new();
        vars.insert("GIT_USER".to_string(), "env-user".to_string());
        vars.insert("GIT_PASSWORD".to_string(), "env-pass".to_string());

        let creds = resolve_git_credentials(None, None, &vars);
        assert_eq!(creds.user.as_deref(), Some("env-user"));
        assert_eq!(creds.password.as_deref(), Some("env-pass"));

        let creds = resolve_git_credentials(None, None, &BTreeMap::new());
        assert!(!creds.is_authenticated());
        assert!(creds.password.is_none());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let creds = GitCredentials {
            user: Some("u".into()),
            password: Some("hunter2".into()),
        };
        assert!(!format!("{:?}", creds).contains("hunter2"));
        assert!(!format!("{:?}", Secret::Password("hunter2".into())).contains("hunter2"));
    }

    #[test]
    fn direct_connection_resolves_controller_only() {
        let lookup = RecordingLookup::new();
        let opener = RecordingOpener {
            opened: RefCell::new(Vec::new()),
        };
        let mut ctx = context(None);

        ctx.connect_controller("controller", &lookup, &opener).unwrap();

        assert_eq!(*lookup.calls.borrow(), vec!["controller".to_string()]);
        assert!(opener.opened.borrow().is_empty());
        assert!(ctx.controller.proxy().is_none());
        assert_eq!(ctx.controller.hostname(), Some("controller.tf.local"));
    }

    #[test]
    fn tunnel_opens_after_both_hostnames_are_resolved() {
        let lookup = RecordingLookup::new();
        let opener = RecordingOpener {
            opened: RefCell::new(Vec::new()),
        };
        let mut ctx = context(Some(bastion_creds()));

        ctx.connect_controller("controller", &lookup, &opener).unwrap();

        assert_eq!(
            *lookup.calls.borrow(),
            vec!["controller".to_string(), "bastion".to_string()]
        );
        assert_eq!(
            *opener.opened.borrow(),
            vec![(
                "bastion.tf.local".to_string(),
                "controller.tf.local:22".to_string()
            )]
        );
        let channel = ctx.controller.proxy().unwrap();
        assert_eq!(channel.source.to_string(), "bastion.tf.local:22");
        assert_eq!(channel.destination.to_string(), "controller.tf.local:22");
    }

    #[test]
    fn pinned_bastion_skips_lookup_but_controller_is_still_resolved() {
        let lookup = RecordingLookup::new();
        let opener = RecordingOpener {
            opened: RefCell::new(Vec::new()),
        };
        let mut ctx = context(Some(
            bastion_creds().pinned(Some("jump.example.com".to_string())),
        ));

        ctx.connect_controller("controller", &lookup, &opener).unwrap();

        assert_eq!(*lookup.calls.borrow(), vec!["controller".to_string()]);
        assert_eq!(opener.opened.borrow()[0].0, "jump.example.com");
    }

    #[test]
    fn tunnel_is_opened_once_per_run() {
        let lookup = RecordingLookup::new();
        let opener = RecordingOpener {
            opened: RefCell::new(Vec::new()),
        };
        let mut ctx = context(Some(bastion_creds()));

        ctx.connect_controller("controller", &lookup, &opener).unwrap();
        ctx.connect_controller("controller", &lookup, &opener).unwrap();

        assert_eq!(opener.opened.borrow().len(), 1);
        assert_eq!(lookup.calls.borrow().len(), 2);
    }

    #[test]
    fn controller_client_routes_through_tunnel() {
        let lookup = RecordingLookup::new();
        let opener = RecordingOpener {
            opened: RefCell::new(Vec::new()),
        };
        let mut ctx = context(Some(bastion_creds()));
        ctx.connect_controller("controller", &lookup, &opener).unwrap();

        let client = ctx.controller_client().unwrap();
        assert!(client.via_bastion());
        let args = client.build_ssh_args(None);
        assert!(args.iter().any(|a| a.starts_with("ProxyCommand=ssh -S /tmp/test.sock")));
    }

    #[test]
    fn context_from_config_pins_bastion_and_picks_host_key_policy() {
        let dir = tempfile::TempDir::new().unwrap();
        let tf = dir.path().join("main.tf");
        std::fs::write(&tf, "variable \"CUCUMBER_COMMAND\" {\n  default = \"rake\"\n}\n").unwrap();
        let key = dir.path().join("id_bastion");
        std::fs::write(&key, "key").unwrap();

        let mut env = BTreeMap::new();
        env.insert("BUILD_NUMBER".to_string(), "1".to_string());
        env.insert("TF_VAR_GIT_USER".to_string(), "bot".to_string());
        let input = crate::config::RunInput {
            runstep: "cucumber".to_string(),
            tf: Some(tf),
            bastion_key: Some(key.display().to_string()),
            bastion_hostname: Some("jump.example.com".to_string()),
            trust_new_host_keys: true,
            ..Default::default()
        };
        let config = RunConfiguration::build(input, &env).unwrap();

        let ctx = RemoteContext::from_config(&config, &dir.path().join("known_hosts"));
        assert_eq!(ctx.bastion.as_ref().unwrap().hostname(), Some("jump.example.com"));
        assert!(ctx.controller.hostname().is_none());
        assert_eq!(ctx.controller.user, "root");
        assert_eq!(ctx.git.user.as_deref(), Some("bot"));
        assert!(matches!(ctx.host_keys, HostKeyPolicy::TrustOnFirstUse { .. }));
    }

    #[test]
    fn unresolved_controller_has_no_target() {
        let ctx = context(None);
        assert!(ctx.controller_client().is_err());
    }
}

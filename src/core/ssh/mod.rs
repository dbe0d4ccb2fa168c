pub mod client;
pub mod tunnel;

pub use client::{CommandOutput, HostKeyPolicy, RemoteFiles, SshClient, Transfer};
pub use tunnel::{BastionTunnel, Endpoint, TunnelChannel, TunnelOpener};

use crate::credentials::Secret;

/// Fully resolved connection parameters for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub secret: Option<Secret>,
}

impl SshTarget {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

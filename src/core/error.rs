use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigMissingKey,
    ConfigInvalidValue,
    ConfigMissingFile,

    ValidationMissingArgument,
    ValidationInvalidArgument,

    SshIdentityFileNotFound,
    SshConnectFailed,
    SshTunnelFailed,

    RemoteCommandFailed,
    RemoteTransferFailed,

    ProvisionFailed,
    HostnameLookupFailed,

    GitCommandFailed,

    NotifyFailed,

    ArtifactsEmpty,

    InternalIoError,
    InternalJsonError,
    InternalUnexpected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigMissingKey => "config.missing_key",
            ErrorCode::ConfigInvalidValue => "config.invalid_value",
            ErrorCode::ConfigMissingFile => "config.missing_file",

            ErrorCode::ValidationMissingArgument => "validation.missing_argument",
            ErrorCode::ValidationInvalidArgument => "validation.invalid_argument",

            ErrorCode::SshIdentityFileNotFound => "ssh.identity_file_not_found",
            ErrorCode::SshConnectFailed => "ssh.connect_failed",
            ErrorCode::SshTunnelFailed => "ssh.tunnel_failed",

            ErrorCode::RemoteCommandFailed => "remote.command_failed",
            ErrorCode::RemoteTransferFailed => "remote.transfer_failed",

            ErrorCode::ProvisionFailed => "provision.failed",
            ErrorCode::HostnameLookupFailed => "provision.hostname_lookup_failed",

            ErrorCode::GitCommandFailed => "git.command_failed",

            ErrorCode::NotifyFailed => "notify.failed",

            ErrorCode::ArtifactsEmpty => "artifacts.empty",

            ErrorCode::InternalIoError => "internal.io_error",
            ErrorCode::InternalJsonError => "internal.json_error",
            ErrorCode::InternalUnexpected => "internal.unexpected",
        }
    }

    /// Configuration and credential problems abort the run before (or instead
    /// of) recording a step outcome.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorCode::ConfigMissingKey
                | ErrorCode::ConfigInvalidValue
                | ErrorCode::ConfigMissingFile
                | ErrorCode::ValidationMissingArgument
                | ErrorCode::ValidationInvalidArgument
                | ErrorCode::SshIdentityFileNotFound
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMissingKeyDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigInvalidValueDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub problem: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingArgumentDetails {
    pub args: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidArgumentDetails {
    pub field: String,
    pub problem: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tried: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalIoErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalJsonErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub via_bastion: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCommandFailedDetails {
    pub command: String,
    pub exit_code: i32,
    pub target: TargetDetails,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConnectFailedDetails {
    pub host: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SshIdentityFileNotFoundDetails {
    pub role: String,
    pub identity_file: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionFailedDetails {
    pub action: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
    pub hints: Vec<Hint>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

fn to_details<T: Serialize>(details: T) -> Value {
    serde_json::to_value(details).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            hints: Vec::new(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.code.is_fatal()
    }

    pub fn validation_missing_argument(args: Vec<String>) -> Self {
        let message = format!("Missing required argument: {}", args.join(", "));
        Self::new(
            ErrorCode::ValidationMissingArgument,
            message,
            to_details(MissingArgumentDetails { args }),
        )
    }

    pub fn validation_invalid_argument(
        field: impl Into<String>,
        problem: impl Into<String>,
        id: Option<String>,
        tried: Option<Vec<String>>,
    ) -> Self {
        let field = field.into();
        let problem = problem.into();
        let message = format!("Invalid argument '{}': {}", field, problem);
        Self::new(
            ErrorCode::ValidationInvalidArgument,
            message,
            to_details(InvalidArgumentDetails {
                field,
                problem,
                id,
                tried,
            }),
        )
    }

    pub fn config_missing_key(key: impl Into<String>, path: Option<String>) -> Self {
        let key = key.into();
        let message = format!("Missing required configuration key '{}'", key);
        Self::new(
            ErrorCode::ConfigMissingKey,
            message,
            to_details(ConfigMissingKeyDetails { key, path }),
        )
    }

    pub fn config_invalid_value(
        key: impl Into<String>,
        value: Option<String>,
        problem: impl Into<String>,
    ) -> Self {
        let key = key.into();
        let problem = problem.into();
        let message = format!("Invalid configuration value for '{}': {}", key, problem);
        Self::new(
            ErrorCode::ConfigInvalidValue,
            message,
            to_details(ConfigInvalidValueDetails {
                key,
                value,
                problem,
            }),
        )
    }

    pub fn config_missing_file(flag: impl Into<String>, path: impl Into<String>) -> Self {
        let flag = flag.into();
        let path = path.into();
        Self::new(
            ErrorCode::ConfigMissingFile,
            format!("File given to --{} does not exist: {}", flag, path),
            serde_json::json!({ "flag": flag, "path": path }),
        )
    }

    pub fn ssh_identity_file_not_found(
        role: impl Into<String>,
        identity_file: impl Into<String>,
    ) -> Self {
        let role = role.into();
        let identity_file = identity_file.into();
        let message = if identity_file.is_empty() {
            format!("No SSH key configured for the {}", role)
        } else {
            format!("SSH key for the {} not found: {}", role, identity_file)
        };
        Self::new(
            ErrorCode::SshIdentityFileNotFound,
            message,
            to_details(SshIdentityFileNotFoundDetails {
                role,
                identity_file,
            }),
        )
    }

    pub fn ssh_connect_failed(details: SshConnectFailedDetails) -> Self {
        let message = format!("SSH connection to {} failed", details.host);
        Self::new(ErrorCode::SshConnectFailed, message, to_details(details))
            .with_hint("Re-run this step on its own once the host is reachable")
    }

    pub fn ssh_tunnel_failed(bastion: impl Into<String>, stderr: impl Into<String>) -> Self {
        let bastion = bastion.into();
        Self::new(
            ErrorCode::SshTunnelFailed,
            format!("Could not open bastion session to {}", bastion),
            serde_json::json!({ "bastion": bastion, "stderr": stderr.into() }),
        )
    }

    pub fn remote_command_failed(details: RemoteCommandFailedDetails) -> Self {
        let message = format!("Remote command exited with status {}", details.exit_code);
        Self::new(ErrorCode::RemoteCommandFailed, message, to_details(details))
    }

    pub fn remote_transfer_failed(path: impl Into<String>, stderr: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(
            ErrorCode::RemoteTransferFailed,
            format!("Transfer of {} failed", path),
            serde_json::json!({ "path": path, "stderr": stderr.into() }),
        )
    }

    pub fn provision_failed(details: ProvisionFailedDetails) -> Self {
        let message = format!(
            "Provisioning action '{}' exited with status {}",
            details.action, details.exit_code
        );
        Self::new(ErrorCode::ProvisionFailed, message, to_details(details))
    }

    pub fn hostname_lookup_failed(resource: impl Into<String>, problem: impl Into<String>) -> Self {
        let resource = resource.into();
        let problem = problem.into();
        Self::new(
            ErrorCode::HostnameLookupFailed,
            format!("Could not resolve hostname of '{}': {}", resource, problem),
            serde_json::json!({ "resource": resource, "problem": problem }),
        )
    }

    pub fn git_command_failed(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::GitCommandFailed,
            message,
            Value::Object(serde_json::Map::new()),
        )
    }

    pub fn notify_failed(target: impl Into<String>, problem: impl Into<String>) -> Self {
        let target = target.into();
        let problem = problem.into();
        Self::new(
            ErrorCode::NotifyFailed,
            format!("Sending notification via {} failed: {}", target, problem),
            serde_json::json!({ "target": target, "problem": problem }),
        )
    }

    pub fn artifacts_empty(results_dir: impl Into<String>) -> Self {
        let results_dir = results_dir.into();
        Self::new(
            ErrorCode::ArtifactsEmpty,
            format!("No artifacts found below {}", results_dir),
            serde_json::json!({ "resultsDir": results_dir }),
        )
    }

    pub fn internal_io(error: impl Into<String>, context: Option<String>) -> Self {
        let error = error.into();
        let message = match &context {
            Some(ctx) => format!("IO error ({}): {}", ctx, error),
            None => format!("IO error: {}", error),
        };
        Self::new(
            ErrorCode::InternalIoError,
            message,
            to_details(InternalIoErrorDetails { error, context }),
        )
    }

    pub fn internal_json(error: impl Into<String>, context: Option<String>) -> Self {
        Self::new(
            ErrorCode::InternalJsonError,
            "JSON error",
            to_details(InternalJsonErrorDetails {
                error: error.into(),
                context,
            }),
        )
    }

    pub fn internal_unexpected(error: impl Into<String>) -> Self {
        let error = error.into();
        Self::new(
            ErrorCode::InternalUnexpected,
            format!("Unexpected error: {}", error),
            serde_json::json!({ "error": error }),
        )
    }

    pub fn with_hint(mut self, message: impl Into<String>) -> Self {
        self.hints.push(Hint {
            message: message.into(),
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_and_credential_errors_are_fatal() {
        assert!(Error::config_missing_key("CUCUMBER_COMMAND", None).is_fatal());
        assert!(Error::config_missing_file("tf", "/nope/main.tf").is_fatal());
        assert!(Error::ssh_identity_file_not_found("bastion", "").is_fatal());
    }

    #[test]
    fn step_errors_are_not_fatal() {
        let err = Error::remote_command_failed(RemoteCommandFailedDetails {
            command: "run-tests".to_string(),
            exit_code: 3,
            target: TargetDetails {
                host: Some("ctl.example.com".to_string()),
                user: Some("root".to_string()),
                via_bastion: true,
            },
        });
        assert!(!err.is_fatal());
        assert_eq!(err.details["exitCode"], 3);
        assert_eq!(err.details["target"]["viaBastion"], true);
        assert!(!Error::internal_io("boom", None).is_fatal());
    }

    #[test]
    fn missing_bastion_key_message_names_role() {
        let err = Error::ssh_identity_file_not_found("bastion", "");
        assert_eq!(err.code.as_str(), "ssh.identity_file_not_found");
        assert!(err.message.contains("bastion"));
    }
}

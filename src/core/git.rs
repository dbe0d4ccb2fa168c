use std::fs;
use std::io::Write;
use std::path::Path;

use crate::config::GitOptions;
use crate::credentials::GitCredentials;
use crate::error::{Error, Result};
use crate::utils::command;

/// Brings a local checkout to a given reference of a remote repository.
pub trait GitSync {
    fn sync(
        &self,
        options: &GitOptions,
        credentials: &GitCredentials,
        sink: &mut dyn Write,
    ) -> Result<()>;
}

/// [`GitSync`] over the `git` command line.
#[derive(Debug, Default)]
pub struct GitCli;

// Reads the credentials from the environment so they never appear in argv
const CREDENTIAL_HELPER: &str =
    "credential.helper=!f() { echo \"username=${GIT_USER}\"; echo \"password=${GIT_PASSWORD}\"; }; f";

/// `-c` arguments that make git answer authentication prompts from
/// `GIT_USER`/`GIT_PASSWORD`.
pub fn credential_args(credentials: &GitCredentials) -> Vec<String> {
    if !credentials.is_authenticated() {
        return Vec::new();
    }
    vec![
        "-c".to_string(),
        "credential.helper=".to_string(),
        "-c".to_string(),
        CREDENTIAL_HELPER.to_string(),
    ]
}

fn credential_env(credentials: &GitCredentials) -> Vec<(String, String)> {
    match &credentials.user {
        Some(user) => vec![
            ("GIT_USER".to_string(), user.clone()),
            (
                "GIT_PASSWORD".to_string(),
                credentials.password.clone().unwrap_or_default(),
            ),
            ("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()),
        ],
        None => vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())],
    }
}

fn git(dir: &Path, args: &[&str], envs: &[(String, String)], sink: &mut dyn Write) -> Result<()> {
    let context = format!("git {}", args.first().copied().unwrap_or_default());
    let exit_code = command::stream_in(dir, "git", args, envs, sink, &context)
        .map_err(|e| Error::git_command_failed(format!("Failed to run {}: {}", context, e)))?;
    if exit_code != 0 {
        return Err(Error::git_command_failed(format!(
            "{} failed with exit status {}",
            context, exit_code
        )));
    }
    Ok(())
}

impl GitSync for GitCli {
    fn sync(
        &self,
        options: &GitOptions,
        credentials: &GitCredentials,
        sink: &mut dyn Write,
    ) -> Result<()> {
        let dir = options.folder.as_path();
        fs::create_dir_all(dir).map_err(|e| {
            Error::internal_io(e.to_string(), Some(format!("create {}", dir.display())))
        })?;

        log_status!(
            "git",
            "Syncing {} ({}) into {}",
            options.repo,
            options.reference,
            dir.display()
        );

        if !dir.join(".git").exists() {
            git(dir, &["init", "--quiet"], &[], sink)?;
        }

        let has_origin = command::run_in(dir, "git", &["remote", "get-url", "origin"], &[], "git remote")
            .is_ok();
        let remote_action = if has_origin { "set-url" } else { "add" };
        git(dir, &["remote", remote_action, "origin", &options.repo], &[], sink)?;

        let mut fetch: Vec<String> = credential_args(credentials);
        fetch.extend([
            "fetch".to_string(),
            "--depth=1".to_string(),
            "origin".to_string(),
            options.reference.clone(),
        ]);
        let fetch: Vec<&str> = fetch.iter().map(String::as_str).collect();
        git(dir, &fetch, &credential_env(credentials), sink)?;

        git(dir, &["checkout", "--force", "FETCH_HEAD"], &[], sink)
    }
}

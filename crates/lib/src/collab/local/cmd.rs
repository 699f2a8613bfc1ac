//! Shell command execution on the local host.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::collab::{CollabError, CommandRunner, CommandSpec};

/// Runs commands through a POSIX shell.
///
/// Commands inherit the caller's environment with the spec's variables
/// layered on top. When the spec names a user, the command is run through
/// `sudo -n -u <user>`.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
  shell: Option<String>,
}

impl ShellRunner {
  pub fn new() -> Self {
    Self::default()
  }

  /// Use `shell` instead of `/bin/sh`.
  pub fn with_shell(shell: impl Into<String>) -> Self {
    Self {
      shell: Some(shell.into()),
    }
  }
}

#[async_trait]
impl CommandRunner for ShellRunner {
  async fn run(&self, spec: &CommandSpec) -> Result<String, CollabError> {
    info!(cmd = %spec.command, user = ?spec.user, "executing command");

    let (program, args) = shell_invocation(self.shell.as_deref(), spec.user.as_deref());

    let mut command = Command::new(&program);
    command.args(&args).arg(&spec.command);
    if let Some(cwd) = &spec.cwd {
      command.current_dir(cwd);
    }
    for (key, value) in &spec.env {
      command.env(key, value);
    }

    debug!(program = %program, cwd = ?spec.cwd, "spawning process");

    let output = command.output().await.map_err(|source| CollabError::Spawn {
      command: spec.command.clone(),
      source,
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

      if !stderr.is_empty() {
        debug!(stderr = %stderr, "command stderr");
      }
      if !stdout.is_empty() {
        debug!(stdout = %stdout, "command stdout");
      }

      return Err(CollabError::CommandFailed {
        command: spec.command.clone(),
        code: output.status.code(),
        stderr,
      });
    }

    if !stdout.is_empty() {
      debug!(stdout = %stdout, "command output");
    }

    Ok(stdout)
  }
}

/// The program and leading arguments used to run a command string.
fn shell_invocation(shell: Option<&str>, user: Option<&str>) -> (String, Vec<String>) {
  let shell = shell.unwrap_or("/bin/sh").to_string();
  match user {
    Some(user) => (
      "sudo".to_string(),
      vec![
        "-n".to_string(),
        "-u".to_string(),
        user.to_string(),
        "--".to_string(),
        shell,
        "-c".to_string(),
      ],
    ),
    None => (shell, vec!["-c".to_string()]),
  }
}

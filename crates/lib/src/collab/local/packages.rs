//! Debian packages through dpkg and apt.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::collab::{CollabError, CommandRunner, CommandSpec, PackageManager};

#[derive(Clone)]
pub struct AptPackages {
  runner: Arc<dyn CommandRunner>,
}

impl AptPackages {
  pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
    Self { runner }
  }

  fn apt(command: String) -> CommandSpec {
    CommandSpec::new(command).env("DEBIAN_FRONTEND", "noninteractive")
  }
}

#[async_trait]
impl PackageManager for AptPackages {
  async fn installed_version(&self, name: &str) -> Result<Option<String>, CollabError> {
    let query = CommandSpec::new(format!("dpkg-query -W -f='${{Status}} ${{Version}}' {name}"));
    match self.runner.run(&query).await {
      Ok(out) => Ok(parse_dpkg_status(&out)),
      Err(CollabError::CommandFailed { .. }) => Ok(None),
      Err(e) => Err(e),
    }
  }

  async fn install(&self, name: &str, version: Option<&str>) -> Result<(), CollabError> {
    let target = match version {
      Some(version) => format!("{name}={version}"),
      None => name.to_string(),
    };
    info!(package = %target, "installing package");
    self
      .runner
      .run(&Self::apt(format!("apt-get install -y -q {target}")))
      .await
      .map(|_| ())
      .map_err(|e| CollabError::Package {
        name: name.to_string(),
        message: e.to_string(),
      })
  }

  async fn upgrade_available(&self, name: &str) -> Result<bool, CollabError> {
    let out = self.runner.run(&CommandSpec::new(format!("apt-cache policy {name}"))).await?;
    Ok(match parse_policy(&out) {
      (Some(installed), Some(candidate)) => installed != candidate,
      _ => false,
    })
  }

  async fn remove(&self, name: &str) -> Result<(), CollabError> {
    info!(package = %name, "removing package");
    self
      .runner
      .run(&Self::apt(format!("apt-get remove -y -q {name}")))
      .await
      .map(|_| ())
      .map_err(|e| CollabError::Package {
        name: name.to_string(),
        message: e.to_string(),
      })
  }
}

/// Parse `dpkg-query` output of the form `install ok installed 1.18.0-0ubuntu1`.
fn parse_dpkg_status(out: &str) -> Option<String> {
  let rest = out.trim().strip_prefix("install ok installed")?;
  let version = rest.trim();
  (!version.is_empty()).then(|| version.to_string())
}

/// Extract `(installed, candidate)` from `apt-cache policy` output.
fn parse_policy(out: &str) -> (Option<String>, Option<String>) {
  let field = |label: &str| {
    out
      .lines()
      .find_map(|line| line.trim().strip_prefix(label))
      .map(str::trim)
      .filter(|v| *v != "(none)")
      .map(str::to_string)
  };
  (field("Installed:"), field("Candidate:"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::collab::memory::MemoryHost;

  #[test]
  fn dpkg_status_parsing() {
    assert_eq!(
      parse_dpkg_status("install ok installed 1.18.0-0ubuntu1").as_deref(),
      Some("1.18.0-0ubuntu1")
    );
    assert_eq!(parse_dpkg_status("deinstall ok config-files 1.0"), None);
  }

  #[test]
  fn policy_parsing() {
    let out = "nginx:\n  Installed: 1.18.0\n  Candidate: 1.20.1\n  Version table:\n";
    assert_eq!(
      parse_policy(out),
      (Some("1.18.0".to_string()), Some("1.20.1".to_string()))
    );
    let none = "nginx:\n  Installed: (none)\n  Candidate: 1.20.1\n";
    assert_eq!(parse_policy(none).0, None);
  }

  #[tokio::test]
  async fn missing_package_has_no_version() {
    let host = Arc::new(MemoryHost::new());
    host.on_command("dpkg-query", Err(1));
    let apt = AptPackages::new(host.clone());

    assert_eq!(apt.installed_version("nginx").await.unwrap(), None);
    apt.install("nginx", Some("1.18.0")).await.unwrap();
    assert_eq!(host.commands().last().map(String::as_str), Some("apt-get install -y -q nginx=1.18.0"));
  }
}

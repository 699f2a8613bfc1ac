//! Supervisor-managed programs.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::collab::{CollabError, CommandRunner, CommandSpec, FileMeta, FileStore, ServiceManager, ServiceSpec};

/// [`ServiceManager`] that writes supervisor program files.
///
/// Each program gets `<conf_dir>/<name>.conf` plus a `<name>.json` sidecar
/// holding the definition it was generated from, so that the current
/// definition can be compared without parsing INI.
#[derive(Clone)]
pub struct SupervisorServices {
  conf_dir: PathBuf,
  ctl: String,
  files: Arc<dyn FileStore>,
  runner: Arc<dyn CommandRunner>,
}

impl SupervisorServices {
  pub fn new(
    conf_dir: impl Into<PathBuf>,
    ctl: impl Into<String>,
    files: Arc<dyn FileStore>,
    runner: Arc<dyn CommandRunner>,
  ) -> Self {
    Self {
      conf_dir: conf_dir.into(),
      ctl: ctl.into(),
      files,
      runner,
    }
  }

  fn conf_path(&self, name: &str) -> PathBuf {
    self.conf_dir.join(format!("{name}.conf"))
  }

  fn sidecar_path(&self, name: &str) -> PathBuf {
    self.conf_dir.join(format!("{name}.json"))
  }

  async fn ctl(&self, args: &str) -> Result<(), CollabError> {
    self
      .runner
      .run(&CommandSpec::new(format!("{} {args}", self.ctl)))
      .await
      .map(|_| ())
  }
}

#[async_trait]
impl ServiceManager for SupervisorServices {
  async fn definition(&self, name: &str) -> Result<Option<ServiceSpec>, CollabError> {
    let path = self.sidecar_path(name);
    let Some(raw) = self.files.read(&path).await? else {
      return Ok(None);
    };
    serde_json::from_slice(&raw).map(Some).map_err(|e| CollabError::Service {
      name: name.to_string(),
      message: format!("corrupt definition at {}: {e}", path.display()),
    })
  }

  async fn enable(&self, spec: &ServiceSpec) -> Result<bool, CollabError> {
    if self.definition(&spec.name).await?.as_ref() == Some(spec) {
      debug!(service = %spec.name, "program definition unchanged");
      return Ok(false);
    }

    let sidecar = serde_json::to_vec_pretty(spec).map_err(|e| CollabError::Service {
      name: spec.name.clone(),
      message: e.to_string(),
    })?;
    let meta = FileMeta::new(Some(0o644), None, None);
    self
      .files
      .write(&self.conf_path(&spec.name), program_conf(spec).as_bytes(), &meta)
      .await?;
    self.files.write(&self.sidecar_path(&spec.name), &sidecar, &meta).await?;

    self.ctl("reread").await?;
    self.ctl("update").await?;
    info!(service = %spec.name, "enabled program");
    Ok(true)
  }

  async fn disable(&self, name: &str) -> Result<bool, CollabError> {
    let removed_conf = self.files.remove(&self.conf_path(name)).await?;
    let removed_sidecar = self.files.remove(&self.sidecar_path(name)).await?;
    if !(removed_conf || removed_sidecar) {
      return Ok(false);
    }
    self.ctl("reread").await?;
    self.ctl("update").await?;
    info!(service = %name, "disabled program");
    Ok(true)
  }

  async fn restart(&self, name: &str) -> Result<(), CollabError> {
    self.ctl(&format!("restart {name}")).await.map_err(|e| CollabError::Service {
      name: name.to_string(),
      message: e.to_string(),
    })?;
    info!(service = %name, "restarted program");
    Ok(())
  }
}

/// Render a supervisor `[program:x]` section.
pub fn program_conf(spec: &ServiceSpec) -> String {
  let mut out = String::new();
  let _ = writeln!(out, "[program:{}]", spec.name);
  let _ = writeln!(out, "command={}", spec.command);
  if let Some(directory) = &spec.directory {
    let _ = writeln!(out, "directory={directory}");
  }
  if !spec.environment.is_empty() {
    let env = spec
      .environment
      .iter()
      .map(|(k, v)| format!("{k}=\"{}\"", v.replace('"', "\\\"")))
      .collect::<Vec<_>>()
      .join(",");
    let _ = writeln!(out, "environment={env}");
  }
  if let Some(user) = &spec.user {
    let _ = writeln!(out, "user={user}");
  }
  let _ = writeln!(out, "autostart={}", spec.autostart);
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::collab::memory::MemoryHost;
  use std::collections::BTreeMap;

  fn spec() -> ServiceSpec {
    let mut environment = BTreeMap::new();
    environment.insert("PATH".to_string(), "/srv/app1/shared/env/bin".to_string());
    ServiceSpec {
      name: "app1".to_string(),
      command: "/srv/app1/shared/env/bin/gunicorn app1.wsgi:application".to_string(),
      directory: Some("/srv/app1/current".to_string()),
      environment,
      user: Some("nobody".to_string()),
      autostart: false,
    }
  }

  #[test]
  fn renders_program_section() {
    let conf = program_conf(&spec());
    assert_eq!(
      conf,
      "[program:app1]\n\
       command=/srv/app1/shared/env/bin/gunicorn app1.wsgi:application\n\
       directory=/srv/app1/current\n\
       environment=PATH=\"/srv/app1/shared/env/bin\"\n\
       user=nobody\n\
       autostart=false\n"
    );
  }

  #[tokio::test]
  async fn enable_writes_once_and_reloads() {
    let host = Arc::new(MemoryHost::new());
    let services = SupervisorServices::new("/etc/supervisor/conf.d", "supervisorctl", host.clone(), host.clone());

    assert!(services.enable(&spec()).await.unwrap());
    assert!(!services.enable(&spec()).await.unwrap());
    assert_eq!(services.definition("app1").await.unwrap(), Some(spec()));
    assert_eq!(host.commands(), vec!["supervisorctl reread", "supervisorctl update"]);

    services.restart("app1").await.unwrap();
    assert_eq!(host.commands().last().map(String::as_str), Some("supervisorctl restart app1"));

    assert!(services.disable("app1").await.unwrap());
    assert!(!services.disable("app1").await.unwrap());
  }
}

//! Collaborators for the local host.
//!
//! Files go through the filesystem directly. Packages, services and
//! checkouts are driven through shell commands (`apt-get`, `supervisorctl`,
//! `git`), all run by one [`ShellRunner`].

mod cmd;
mod files;
mod git;
mod inventory;
mod packages;
mod services;
pub(crate) mod templates;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

pub use cmd::ShellRunner;
pub use files::LocalFiles;
pub use git::GitSource;
pub use inventory::StaticInventory;
pub use packages::AptPackages;
pub use services::{SupervisorServices, program_conf};
pub use templates::DirTemplates;

use crate::config::ConfigProvider;

use super::Collaborators;

/// Settings for the local collaborators.
#[derive(Debug, Clone)]
pub struct LocalOptions {
  /// Directory templates are read from.
  pub template_dir: PathBuf,
  /// Directory supervisor program files are written to.
  pub supervisor_dir: PathBuf,
  /// Supervisor control command.
  pub supervisor_ctl: String,
  /// Role name to node address.
  pub inventory: BTreeMap<String, String>,
  /// Shell used for commands, `/bin/sh` when unset.
  pub shell: Option<String>,
}

impl Default for LocalOptions {
  fn default() -> Self {
    Self {
      template_dir: PathBuf::from("templates"),
      supervisor_dir: PathBuf::from("/etc/supervisor/conf.d"),
      supervisor_ctl: "supervisorctl".to_string(),
      inventory: BTreeMap::new(),
      shell: None,
    }
  }
}

impl Collaborators {
  /// Collaborators acting on this machine.
  pub fn local(options: LocalOptions, secrets: Arc<dyn ConfigProvider>) -> Self {
    let runner: Arc<ShellRunner> = Arc::new(match options.shell {
      Some(shell) => ShellRunner::with_shell(shell),
      None => ShellRunner::new(),
    });
    let files = Arc::new(LocalFiles::new());

    Self {
      packages: Arc::new(AptPackages::new(runner.clone())),
      services: Arc::new(SupervisorServices::new(
        options.supervisor_dir,
        options.supervisor_ctl,
        files.clone(),
        runner.clone(),
      )),
      source: Arc::new(GitSource::new(runner.clone(), files.clone())),
      roles: Arc::new(StaticInventory::new(options.inventory)),
      templates: Arc::new(DirTemplates::new(options.template_dir)),
      commands: runner,
      files,
      secrets,
    }
  }
}

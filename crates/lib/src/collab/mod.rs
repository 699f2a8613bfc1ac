//! External collaborators.
//!
//! Handlers never touch the host directly. Every side effect goes through one
//! of the traits here: packages, files, commands, the process manager, role
//! lookup, template rendering and source control. [`Collaborators`] bundles
//! one implementation of each for a run.
//!
//! Two families of implementations ship with the crate:
//!
//! - [`memory::MemoryHost`]: an in-memory host that records every side effect,
//!   used by tests.
//! - [`local`]: the real host, backed by the filesystem and shell commands.

pub mod local;
pub mod memory;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigProvider;
use crate::resource::AttrValue;
use crate::util::hash::{ContentHash, hash_bytes};

/// Errors raised by collaborators.
#[derive(Debug, Error)]
pub enum CollabError {
  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("command failed with exit code {code:?}: {command}")]
  CommandFailed {
    command: String,
    code: Option<i32>,
    stderr: String,
  },

  #[error("failed to spawn `{command}`: {source}")]
  Spawn {
    command: String,
    #[source]
    source: std::io::Error,
  },

  #[error("template `{0}` not found")]
  TemplateNotFound(String),

  #[error("failed to render template `{template}`: {message}")]
  Template { template: String, message: String },

  #[error("service `{name}`: {message}")]
  Service { name: String, message: String },

  #[error("package `{name}`: {message}")]
  Package { name: String, message: String },

  #[error("source checkout of {repository} failed: {message}")]
  Source { repository: String, message: String },

  #[error("no node carries role `{0}`")]
  RoleNotFound(String),
}

impl CollabError {
  pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
    CollabError::Io {
      path: path.into(),
      source,
    }
  }
}

/// Ownership and permissions applied to files and directories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
  pub mode: Option<u32>,
  pub owner: Option<String>,
  pub group: Option<String>,
}

impl FileMeta {
  pub fn new(mode: Option<u32>, owner: Option<&str>, group: Option<&str>) -> Self {
    Self {
      mode,
      owner: owner.map(str::to_string),
      group: group.map(str::to_string),
    }
  }

  /// Whether `actual` satisfies every field set on `self`.
  pub fn satisfied_by(&self, actual: &FileMeta) -> bool {
    (self.mode.is_none() || self.mode == actual.mode)
      && (self.owner.is_none() || self.owner == actual.owner)
      && (self.group.is_none() || self.group == actual.group)
  }
}

/// A shell command to run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
  pub command: String,
  pub cwd: Option<PathBuf>,
  pub env: BTreeMap<String, String>,
  pub user: Option<String>,
}

impl CommandSpec {
  pub fn new(command: impl Into<String>) -> Self {
    Self {
      command: command.into(),
      ..Default::default()
    }
  }

  pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
    self.cwd = Some(cwd.into());
    self
  }

  pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.env.insert(key.into(), value.into());
    self
  }

  pub fn envs(mut self, env: BTreeMap<String, String>) -> Self {
    self.env.extend(env);
    self
  }

  pub fn user(mut self, user: Option<&str>) -> Self {
    self.user = user.map(str::to_string);
    self
  }
}

/// A process-manager program definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
  pub name: String,
  pub command: String,
  pub directory: Option<String>,
  #[serde(default)]
  pub environment: BTreeMap<String, String>,
  pub user: Option<String>,
  #[serde(default)]
  pub autostart: bool,
}

/// Variables handed to a template renderer.
pub type TemplateVars = BTreeMap<String, AttrValue>;

#[async_trait]
pub trait PackageManager: Send + Sync {
  /// The installed version, `None` when absent.
  async fn installed_version(&self, name: &str) -> Result<Option<String>, CollabError>;

  /// Install `name`, pinned to `version` when given, latest otherwise.
  async fn install(&self, name: &str, version: Option<&str>) -> Result<(), CollabError>;

  /// Whether a newer version than the installed one is available.
  async fn upgrade_available(&self, name: &str) -> Result<bool, CollabError>;

  async fn remove(&self, name: &str) -> Result<(), CollabError>;
}

#[async_trait]
pub trait FileStore: Send + Sync {
  async fn read(&self, path: &Path) -> Result<Option<Vec<u8>>, CollabError>;

  /// Content digest, `None` when the file is missing.
  async fn digest(&self, path: &Path) -> Result<Option<ContentHash>, CollabError> {
    Ok(self.read(path).await?.map(|bytes| hash_bytes(&bytes)))
  }

  async fn exists(&self, path: &Path) -> Result<bool, CollabError>;

  async fn metadata(&self, path: &Path) -> Result<Option<FileMeta>, CollabError>;

  /// Write `contents` and apply `meta`, replacing any existing file.
  async fn write(&self, path: &Path, contents: &[u8], meta: &FileMeta) -> Result<(), CollabError>;

  /// Remove a file, directory or link. Returns whether anything was removed.
  async fn remove(&self, path: &Path) -> Result<bool, CollabError>;

  /// Create a directory and its parents. Returns whether it was created.
  async fn create_dir_all(&self, path: &Path, meta: &FileMeta) -> Result<bool, CollabError>;

  async fn read_link(&self, path: &Path) -> Result<Option<PathBuf>, CollabError>;

  /// Point `link` at `target`, replacing whatever `link` was.
  async fn symlink(&self, target: &Path, link: &Path) -> Result<(), CollabError>;

  /// Copy a directory tree. `to` must not exist.
  async fn copy_dir(&self, from: &Path, to: &Path) -> Result<(), CollabError>;
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
  /// Run a command, returning its trimmed stdout.
  async fn run(&self, spec: &CommandSpec) -> Result<String, CollabError>;
}

#[async_trait]
pub trait ServiceManager: Send + Sync {
  /// The current definition of a program, `None` when not installed.
  async fn definition(&self, name: &str) -> Result<Option<ServiceSpec>, CollabError>;

  /// Install or update a program. Returns whether anything changed.
  async fn enable(&self, spec: &ServiceSpec) -> Result<bool, CollabError>;

  /// Remove a program. Returns whether anything changed.
  async fn disable(&self, name: &str) -> Result<bool, CollabError>;

  async fn restart(&self, name: &str) -> Result<(), CollabError>;
}

#[async_trait]
pub trait RoleResolver: Send + Sync {
  /// The address of a node carrying `role`.
  ///
  /// # Errors
  ///
  /// [`CollabError::RoleNotFound`] when no node carries the role.
  async fn resolve_role(&self, role: &str) -> Result<String, CollabError>;
}

#[async_trait]
pub trait TemplateRenderer: Send + Sync {
  async fn render(&self, template: &str, vars: &TemplateVars) -> Result<String, CollabError>;
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
  /// Clone `repository` into `dest`, or update an existing checkout, and
  /// check out `revision`. Returns the resolved commit id.
  async fn clone_or_update(&self, repository: &str, revision: &str, dest: &Path) -> Result<String, CollabError>;

  /// The commit currently checked out at `dest`.
  async fn deployed_revision(&self, dest: &Path) -> Result<Option<String>, CollabError>;
}

/// One implementation of every collaborator, shared by a run.
#[derive(Clone)]
pub struct Collaborators {
  pub packages: Arc<dyn PackageManager>,
  pub files: Arc<dyn FileStore>,
  pub commands: Arc<dyn CommandRunner>,
  pub services: Arc<dyn ServiceManager>,
  pub roles: Arc<dyn RoleResolver>,
  pub templates: Arc<dyn TemplateRenderer>,
  pub source: Arc<dyn SourceFetcher>,
  pub secrets: Arc<dyn ConfigProvider>,
}

impl Collaborators {
  /// Every collaborator backed by the same in-memory host.
  pub fn memory(host: Arc<memory::MemoryHost>) -> Self {
    Self {
      packages: host.clone(),
      files: host.clone(),
      commands: host.clone(),
      services: host.clone(),
      roles: host.clone(),
      templates: host.clone(),
      source: host.clone(),
      secrets: host,
    }
  }
}

impl std::fmt::Debug for Collaborators {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Collaborators").finish_non_exhaustive()
  }
}

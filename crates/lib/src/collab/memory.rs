//! In-memory host.
//!
//! [`MemoryHost`] implements every collaborator trait against a simulated
//! machine and records each side effect in a journal. Queries (digests,
//! definitions, `pip show`) are not journaled, so an idempotent pass leaves
//! the journal untouched.
//!
//! A handful of commands are understood so that deployments behave like on
//! a real host: `virtualenv <dir>` creates the environment's interpreter and
//! `<venv>/bin/pip install|show` keeps a per-environment package registry.
//! Any other command succeeds with empty output unless scripted with
//! [`MemoryHost::on_command`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::config::{ConfigError, ConfigProvider};
use crate::util::hash::hash_bytes;

use super::local::templates::render_body;
use super::{
  CollabError, CommandRunner, CommandSpec, FileMeta, FileStore, PackageManager, RoleResolver, ServiceManager,
  ServiceSpec, SourceFetcher, TemplateRenderer, TemplateVars,
};

#[derive(Debug, Clone)]
enum Node {
  File { contents: Vec<u8>, meta: FileMeta },
  Dir { meta: FileMeta },
  Link(PathBuf),
}

#[derive(Debug, Default)]
struct HostState {
  packages: BTreeMap<String, String>,
  available: BTreeMap<String, String>,
  nodes: BTreeMap<PathBuf, Node>,
  services: BTreeMap<String, ServiceSpec>,
  roles: BTreeMap<String, String>,
  templates: BTreeMap<String, String>,
  secrets: BTreeMap<String, String>,
  revisions: BTreeMap<(String, String), String>,
  source_files: BTreeMap<String, BTreeMap<String, String>>,
  checkouts: BTreeMap<PathBuf, String>,
  pip: BTreeMap<PathBuf, BTreeMap<String, String>>,
  scripted: Vec<(String, Result<String, i32>)>,
  failures: Vec<String>,
  journal: Vec<String>,
}

impl HostState {
  /// Journal a side effect, or fail if it matches an injected failure.
  fn record(&mut self, entry: String) -> Result<(), String> {
    if self.failures.iter().any(|prefix| entry.starts_with(prefix.as_str())) {
      return Err(entry);
    }
    self.journal.push(entry);
    Ok(())
  }

  fn ensure_dirs(&mut self, path: &Path) {
    for ancestor in path.ancestors().skip(1) {
      if ancestor.as_os_str().is_empty() {
        continue;
      }
      self
        .nodes
        .entry(ancestor.to_path_buf())
        .or_insert_with(|| Node::Dir { meta: FileMeta::default() });
    }
  }

  fn put_file(&mut self, path: &Path, contents: &[u8]) {
    self.ensure_dirs(path);
    self.nodes.insert(
      path.to_path_buf(),
      Node::File {
        contents: contents.to_vec(),
        meta: FileMeta::default(),
      },
    );
  }

  fn revision_of(&self, repository: &str, revision: &str) -> String {
    self
      .revisions
      .get(&(repository.to_string(), revision.to_string()))
      .cloned()
      .unwrap_or_else(|| hash_bytes(format!("{repository}@{revision}").as_bytes()).short(40).to_string())
  }
}

/// A simulated host.
#[derive(Debug, Default)]
pub struct MemoryHost {
  state: Mutex<HostState>,
}

impl MemoryHost {
  pub fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> MutexGuard<'_, HostState> {
    self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn with_role(self, role: &str, address: &str) -> Self {
    self.state().roles.insert(role.to_string(), address.to_string());
    self
  }

  pub fn with_template(self, template: &str, body: &str) -> Self {
    self.state().templates.insert(template.to_string(), body.to_string());
    self
  }

  pub fn with_secret(self, key: &str, value: &str) -> Self {
    self.state().secrets.insert(key.to_string(), value.to_string());
    self
  }

  pub fn with_package(self, name: &str, version: &str) -> Self {
    self.state().packages.insert(name.to_string(), version.to_string());
    self
  }

  /// The version `install` picks when none is requested.
  pub fn with_available(self, name: &str, version: &str) -> Self {
    self.state().available.insert(name.to_string(), version.to_string());
    self
  }

  pub fn with_file(self, path: impl AsRef<Path>, contents: &str) -> Self {
    self.state().put_file(path.as_ref(), contents.as_bytes());
    self
  }

  /// A file present in every checkout of `repository`.
  pub fn with_source_file(self, repository: &str, relative: &str, contents: &str) -> Self {
    self
      .state()
      .source_files
      .entry(repository.to_string())
      .or_default()
      .insert(relative.to_string(), contents.to_string());
    self
  }

  /// Make `revision` of `repository` resolve to `sha`.
  pub fn set_revision(&self, repository: &str, revision: &str, sha: &str) {
    self
      .state()
      .revisions
      .insert((repository.to_string(), revision.to_string()), sha.to_string());
  }

  /// Script the result of commands starting with `prefix`.
  /// `Err(code)` makes them fail with that exit code.
  pub fn on_command(&self, prefix: &str, result: Result<&str, i32>) {
    self
      .state()
      .scripted
      .push((prefix.to_string(), result.map(str::to_string)));
  }

  /// Fail every side effect whose journal entry starts with `prefix`.
  pub fn fail_on(&self, prefix: &str) {
    self.state().failures.push(prefix.to_string());
  }

  pub fn journal(&self) -> Vec<String> {
    self.state().journal.clone()
  }

  pub fn clear_journal(&self) {
    self.state().journal.clear();
  }

  /// Names of services restarted, in order.
  pub fn restarts(&self) -> Vec<String> {
    self
      .state()
      .journal
      .iter()
      .filter_map(|entry| entry.strip_prefix("service restart "))
      .map(str::to_string)
      .collect()
  }

  /// Commands run, in order.
  pub fn commands(&self) -> Vec<String> {
    self
      .state()
      .journal
      .iter()
      .filter_map(|entry| entry.strip_prefix("run "))
      .map(str::to_string)
      .collect()
  }

  pub fn file_contents(&self, path: impl AsRef<Path>) -> Option<String> {
    match self.state().nodes.get(path.as_ref()) {
      Some(Node::File { contents, .. }) => Some(String::from_utf8_lossy(contents).into_owned()),
      _ => None,
    }
  }

  pub fn link_target(&self, path: impl AsRef<Path>) -> Option<PathBuf> {
    match self.state().nodes.get(path.as_ref()) {
      Some(Node::Link(target)) => Some(target.clone()),
      _ => None,
    }
  }

  pub fn service(&self, name: &str) -> Option<ServiceSpec> {
    self.state().services.get(name).cloned()
  }

  pub fn package_version(&self, name: &str) -> Option<String> {
    self.state().packages.get(name).cloned()
  }

  pub fn pip_packages(&self, virtualenv: impl AsRef<Path>) -> BTreeMap<String, String> {
    self.state().pip.get(virtualenv.as_ref()).cloned().unwrap_or_default()
  }

  fn simulate(state: &mut HostState, command: &str) -> Option<Result<String, CollabError>> {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    let program = *tokens.first()?;

    if program == "virtualenv" || program.ends_with("/virtualenv") {
      let venv = PathBuf::from(*tokens.last()?);
      state.put_file(&venv.join("bin").join("python"), b"");
      state.put_file(&venv.join("bin").join("pip"), b"");
      return Some(Ok(String::new()));
    }

    let venv = if program == "pip" {
      PathBuf::new()
    } else {
      PathBuf::from(program.strip_suffix("/bin/pip")?)
    };

    match tokens.get(1).copied() {
      Some("show") => {
        let name = tokens.get(2)?;
        let version = state.pip.get(&venv).and_then(|pkgs| pkgs.get(*name)).cloned();
        Some(match version {
          Some(version) => Ok(format!("Name: {name}\nVersion: {version}")),
          None => Err(CollabError::CommandFailed {
            command: command.to_string(),
            code: Some(1),
            stderr: format!("WARNING: Package(s) not found: {name}"),
          }),
        })
      }
      Some("install") => {
        let mut args = tokens[2..].iter();
        while let Some(arg) = args.next() {
          if *arg == "-r" || *arg == "--requirement" {
            args.next();
            continue;
          }
          if arg.starts_with('-') {
            continue;
          }
          let (name, version) = arg.split_once("==").unwrap_or((*arg, "latest"));
          state
            .pip
            .entry(venv.clone())
            .or_default()
            .insert(name.to_string(), version.to_string());
          if !venv.as_os_str().is_empty() {
            state.put_file(&venv.join("bin").join(name), b"");
          }
        }
        Some(Ok(String::new()))
      }
      _ => None,
    }
  }
}

fn failed(entry: String) -> CollabError {
  CollabError::CommandFailed {
    command: entry,
    code: Some(1),
    stderr: "injected failure".to_string(),
  }
}

#[async_trait]
impl PackageManager for MemoryHost {
  async fn installed_version(&self, name: &str) -> Result<Option<String>, CollabError> {
    Ok(self.state().packages.get(name).cloned())
  }

  async fn install(&self, name: &str, version: Option<&str>) -> Result<(), CollabError> {
    let mut state = self.state();
    let version = version
      .map(str::to_string)
      .or_else(|| state.available.get(name).cloned())
      .unwrap_or_else(|| "1.0".to_string());
    state
      .record(format!("package install {name}={version}"))
      .map_err(|_| CollabError::Package {
        name: name.to_string(),
        message: "injected failure".to_string(),
      })?;
    state.packages.insert(name.to_string(), version);
    Ok(())
  }

  async fn upgrade_available(&self, name: &str) -> Result<bool, CollabError> {
    let state = self.state();
    Ok(match (state.packages.get(name), state.available.get(name)) {
      (Some(installed), Some(candidate)) => installed != candidate,
      _ => false,
    })
  }

  async fn remove(&self, name: &str) -> Result<(), CollabError> {
    let mut state = self.state();
    state
      .record(format!("package remove {name}"))
      .map_err(|_| CollabError::Package {
        name: name.to_string(),
        message: "injected failure".to_string(),
      })?;
    state.packages.remove(name);
    Ok(())
  }
}

#[async_trait]
impl FileStore for MemoryHost {
  async fn read(&self, path: &Path) -> Result<Option<Vec<u8>>, CollabError> {
    Ok(match self.state().nodes.get(path) {
      Some(Node::File { contents, .. }) => Some(contents.clone()),
      _ => None,
    })
  }

  async fn exists(&self, path: &Path) -> Result<bool, CollabError> {
    Ok(self.state().nodes.contains_key(path))
  }

  async fn metadata(&self, path: &Path) -> Result<Option<FileMeta>, CollabError> {
    Ok(match self.state().nodes.get(path) {
      Some(Node::File { meta, .. } | Node::Dir { meta }) => Some(meta.clone()),
      Some(Node::Link(_)) => Some(FileMeta::default()),
      None => None,
    })
  }

  async fn write(&self, path: &Path, contents: &[u8], meta: &FileMeta) -> Result<(), CollabError> {
    let mut state = self.state();
    state.record(format!("file write {}", path.display())).map_err(failed)?;
    state.ensure_dirs(path);
    state.nodes.insert(
      path.to_path_buf(),
      Node::File {
        contents: contents.to_vec(),
        meta: meta.clone(),
      },
    );
    Ok(())
  }

  async fn remove(&self, path: &Path) -> Result<bool, CollabError> {
    let mut state = self.state();
    if !state.nodes.contains_key(path) {
      return Ok(false);
    }
    state.record(format!("remove {}", path.display())).map_err(failed)?;
    state.nodes.retain(|p, _| !p.starts_with(path));
    Ok(true)
  }

  async fn create_dir_all(&self, path: &Path, meta: &FileMeta) -> Result<bool, CollabError> {
    let mut state = self.state();
    if matches!(state.nodes.get(path), Some(Node::Dir { .. })) {
      return Ok(false);
    }
    state.record(format!("mkdir {}", path.display())).map_err(failed)?;
    state.ensure_dirs(path);
    state.nodes.insert(path.to_path_buf(), Node::Dir { meta: meta.clone() });
    Ok(true)
  }

  async fn read_link(&self, path: &Path) -> Result<Option<PathBuf>, CollabError> {
    Ok(match self.state().nodes.get(path) {
      Some(Node::Link(target)) => Some(target.clone()),
      _ => None,
    })
  }

  async fn symlink(&self, target: &Path, link: &Path) -> Result<(), CollabError> {
    let mut state = self.state();
    state
      .record(format!("symlink {} -> {}", link.display(), target.display()))
      .map_err(failed)?;
    state.nodes.retain(|p, _| !p.starts_with(link));
    state.ensure_dirs(link);
    state.nodes.insert(link.to_path_buf(), Node::Link(target.to_path_buf()));
    Ok(())
  }

  async fn copy_dir(&self, from: &Path, to: &Path) -> Result<(), CollabError> {
    let mut state = self.state();
    state
      .record(format!("copy {} -> {}", from.display(), to.display()))
      .map_err(failed)?;
    let copied: Vec<(PathBuf, Node)> = state
      .nodes
      .iter()
      .filter_map(|(path, node)| {
        let rel = path.strip_prefix(from).ok()?;
        Some((to.join(rel), node.clone()))
      })
      .collect();
    state.ensure_dirs(to);
    state.nodes.extend(copied);
    state
      .nodes
      .entry(to.to_path_buf())
      .or_insert_with(|| Node::Dir { meta: FileMeta::default() });
    Ok(())
  }
}

#[async_trait]
impl CommandRunner for MemoryHost {
  async fn run(&self, spec: &CommandSpec) -> Result<String, CollabError> {
    let mut state = self.state();
    let command = spec.command.as_str();

    let is_query = command.split_whitespace().nth(1) == Some("show");
    if !is_query {
      state.record(format!("run {command}")).map_err(|entry| CollabError::CommandFailed {
        command: entry.trim_start_matches("run ").to_string(),
        code: Some(1),
        stderr: "injected failure".to_string(),
      })?;
    }

    let scripted = state
      .scripted
      .iter()
      .find(|(prefix, _)| command.starts_with(prefix.as_str()))
      .map(|(_, result)| result.clone());
    if let Some(result) = scripted {
      return result.map_err(|code| CollabError::CommandFailed {
        command: command.to_string(),
        code: Some(code),
        stderr: String::new(),
      });
    }

    match Self::simulate(&mut state, command) {
      Some(result) => result,
      None => Ok(String::new()),
    }
  }
}

#[async_trait]
impl ServiceManager for MemoryHost {
  async fn definition(&self, name: &str) -> Result<Option<ServiceSpec>, CollabError> {
    Ok(self.state().services.get(name).cloned())
  }

  async fn enable(&self, spec: &ServiceSpec) -> Result<bool, CollabError> {
    let mut state = self.state();
    if state.services.get(&spec.name) == Some(spec) {
      return Ok(false);
    }
    state
      .record(format!("service enable {}", spec.name))
      .map_err(|_| CollabError::Service {
        name: spec.name.clone(),
        message: "injected failure".to_string(),
      })?;
    state.services.insert(spec.name.clone(), spec.clone());
    Ok(true)
  }

  async fn disable(&self, name: &str) -> Result<bool, CollabError> {
    let mut state = self.state();
    if !state.services.contains_key(name) {
      return Ok(false);
    }
    state
      .record(format!("service disable {name}"))
      .map_err(|_| CollabError::Service {
        name: name.to_string(),
        message: "injected failure".to_string(),
      })?;
    state.services.remove(name);
    Ok(true)
  }

  async fn restart(&self, name: &str) -> Result<(), CollabError> {
    self
      .state()
      .record(format!("service restart {name}"))
      .map_err(|_| CollabError::Service {
        name: name.to_string(),
        message: "injected failure".to_string(),
      })
  }
}

#[async_trait]
impl RoleResolver for MemoryHost {
  async fn resolve_role(&self, role: &str) -> Result<String, CollabError> {
    self
      .state()
      .roles
      .get(role)
      .cloned()
      .ok_or_else(|| CollabError::RoleNotFound(role.to_string()))
  }
}

#[async_trait]
impl TemplateRenderer for MemoryHost {
  /// Registered templates are rendered with `$${var:...}` substitution.
  /// Unregistered ones render as a sorted `key = value` listing.
  async fn render(&self, template: &str, vars: &TemplateVars) -> Result<String, CollabError> {
    let body = self.state().templates.get(template).cloned();
    match body {
      Some(body) => render_body(template, &body, vars),
      None => {
        let mut out = format!("# {template}\n");
        for (key, value) in vars {
          out.push_str(&format!("{key} = {value}\n"));
        }
        Ok(out)
      }
    }
  }
}

#[async_trait]
impl SourceFetcher for MemoryHost {
  async fn clone_or_update(&self, repository: &str, revision: &str, dest: &Path) -> Result<String, CollabError> {
    let mut state = self.state();
    let sha = state.revision_of(repository, revision);
    if state.checkouts.get(dest) == Some(&sha) {
      return Ok(sha);
    }

    state
      .record(format!("checkout {repository}@{revision} -> {}", dest.display()))
      .map_err(|_| CollabError::Source {
        repository: repository.to_string(),
        message: "injected failure".to_string(),
      })?;

    let files = state.source_files.get(repository).cloned().unwrap_or_default();
    state.ensure_dirs(dest);
    state
      .nodes
      .insert(dest.to_path_buf(), Node::Dir { meta: FileMeta::default() });
    state.put_file(&dest.join(".revision"), sha.as_bytes());
    for (relative, contents) in files {
      state.put_file(&dest.join(relative), contents.as_bytes());
    }
    state.checkouts.insert(dest.to_path_buf(), sha.clone());
    Ok(sha)
  }

  async fn deployed_revision(&self, dest: &Path) -> Result<Option<String>, CollabError> {
    Ok(self.state().checkouts.get(dest).cloned())
  }
}

impl ConfigProvider for MemoryHost {
  fn get(&self, key: &str) -> Result<String, ConfigError> {
    self
      .state()
      .secrets
      .get(key)
      .cloned()
      .ok_or_else(|| ConfigError::NotFound(key.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn virtualenv_and_pip_are_simulated() {
    let host = MemoryHost::new();
    host.run(&CommandSpec::new("virtualenv /srv/app1/shared/env")).await.unwrap();
    assert!(host.exists(Path::new("/srv/app1/shared/env/bin/python")).await.unwrap());

    let show = CommandSpec::new("/srv/app1/shared/env/bin/pip show gunicorn");
    assert!(host.run(&show).await.is_err());

    host
      .run(&CommandSpec::new("/srv/app1/shared/env/bin/pip install gunicorn==19.1"))
      .await
      .unwrap();
    assert_eq!(host.run(&show).await.unwrap(), "Name: gunicorn\nVersion: 19.1");
    assert!(host.exists(Path::new("/srv/app1/shared/env/bin/gunicorn")).await.unwrap());

    assert_eq!(host.commands().len(), 2);
  }

  #[tokio::test]
  async fn scripted_commands_and_injected_failures() {
    let host = MemoryHost::new();
    host.on_command("test -e", Err(1));
    let err = host.run(&CommandSpec::new("test -e /etc/motd")).await.unwrap_err();
    assert!(matches!(err, CollabError::CommandFailed { code: Some(1), .. }));

    host.fail_on("package install broken");
    assert!(host.install("broken", None).await.is_err());
    assert!(host.package_version("broken").is_none());
    assert!(host.journal().iter().all(|e| !e.contains("broken")));
  }

  #[tokio::test]
  async fn enable_is_idempotent() {
    let host = MemoryHost::new();
    let spec = ServiceSpec {
      name: "app1".to_string(),
      command: "gunicorn app".to_string(),
      ..Default::default()
    };
    assert!(host.enable(&spec).await.unwrap());
    assert!(!host.enable(&spec).await.unwrap());
    assert_eq!(host.journal(), vec!["service enable app1"]);
  }

  #[tokio::test]
  async fn checkout_tracks_revision() {
    let host = MemoryHost::new().with_source_file("git://app1", "requirements.txt", "django\n");
    let dest = Path::new("/srv/app1/shared/cached-copy");

    let first = host.clone_or_update("git://app1", "master", dest).await.unwrap();
    let again = host.clone_or_update("git://app1", "master", dest).await.unwrap();
    assert_eq!(first, again);
    assert_eq!(host.journal().len(), 1);
    assert!(host.exists(&dest.join("requirements.txt")).await.unwrap());

    host.set_revision("git://app1", "master", "abc123");
    assert_eq!(host.clone_or_update("git://app1", "master", dest).await.unwrap(), "abc123");
    assert_eq!(host.deployed_revision(dest).await.unwrap().as_deref(), Some("abc123"));
  }

  #[tokio::test]
  async fn copy_dir_and_symlink() {
    let host = MemoryHost::new().with_file("/src/a/b.txt", "b");
    host.copy_dir(Path::new("/src"), Path::new("/dst")).await.unwrap();
    assert_eq!(host.file_contents("/dst/a/b.txt").as_deref(), Some("b"));

    host.symlink(Path::new("/dst"), Path::new("/current")).await.unwrap();
    assert_eq!(host.link_target("/current"), Some(PathBuf::from("/dst")));
  }

  #[tokio::test]
  async fn unregistered_templates_list_variables() {
    let host = MemoryHost::new();
    let mut vars = TemplateVars::new();
    vars.insert("debug".to_string(), false.into());
    let out = host.render("settings.py.erb", &vars).await.unwrap();
    assert_eq!(out, "# settings.py.erb\ndebug = false\n");
  }
}

//! Default phase handlers of the built-in resource kinds.
//!
//! Single-step kinds converge in `before_deploy`. The composite
//! `application` and its sub-resources spread their work over the whole
//! phase sequence.

mod application;
mod celery;
mod django;
mod execute;
mod file;
mod gunicorn;
mod package;
mod service;

pub use application::ApplicationHandler;
pub use celery::CeleryHandler;
pub use django::DjangoHandler;
pub use execute::ExecuteHandler;
pub use file::{FileHandler, TemplateHandler};
pub use gunicorn::GunicornHandler;
pub use package::PackageHandler;
pub use service::ServiceHandler;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::collab::{CollabError, CommandSpec, FileMeta, ServiceSpec};
use crate::error::HandlerError;
use crate::resource::{Action, AttrValue, Resource, ResourceId, ResourceKind, owned_service_names};

use super::{HandlerRef, HookContext, HookRegistry, LifecyclePhase, PhaseHandler};

/// Register the default handler of every built-in kind.
pub(crate) fn register_defaults(registry: &mut HookRegistry) {
  use LifecyclePhase::*;

  registry.register_hook(ResourceKind::Package, BeforeDeploy, Arc::new(PackageHandler));
  registry.register_hook(ResourceKind::File, BeforeDeploy, Arc::new(FileHandler));
  registry.register_hook(ResourceKind::Template, BeforeDeploy, Arc::new(TemplateHandler));
  registry.register_hook(ResourceKind::Service, BeforeDeploy, Arc::new(ServiceHandler));
  registry.register_hook(ResourceKind::Execute, BeforeDeploy, Arc::new(ExecuteHandler));

  for phase in [BeforeCompile, BeforeMigrate, BeforeSymlink, BeforeRestart] {
    registry.register_hook(ResourceKind::Application, phase, Arc::new(ApplicationHandler(phase)));
  }
  for phase in [BeforeCompile, BeforeDeploy, BeforeMigrate, BeforeSymlink] {
    registry.register_hook(ResourceKind::Django, phase, Arc::new(DjangoHandler(phase)));
  }
  for phase in [BeforeCompile, BeforeDeploy, BeforeMigrate] {
    registry.register_hook(ResourceKind::Gunicorn, phase, Arc::new(GunicornHandler(phase)));
  }
  for phase in [BeforeCompile, BeforeDeploy] {
    registry.register_hook(ResourceKind::Celery, phase, Arc::new(CeleryHandler(phase)));
  }
}

/// Restarts the process-manager services a sub-resource owns.
struct RestartOwnedServices;

#[async_trait]
impl PhaseHandler for RestartOwnedServices {
  async fn run(&self, resource: &mut Resource, ctx: &HookContext<'_>) -> Result<bool, HandlerError> {
    let app = ctx.deployment()?.app();
    for service in owned_service_names(&app.name, resource) {
      ctx.notify(ResourceId::new(ResourceKind::Service, service), Action::Restart);
    }
    Ok(false)
  }
}

/// The restart handler used when a sub-resource has no override.
pub fn default_restart() -> HandlerRef {
  Arc::new(RestartOwnedServices)
}

/// Runs a shell command from `<path>/current` as the application owner.
struct RestartCommand(String);

#[async_trait]
impl PhaseHandler for RestartCommand {
  async fn run(&self, resource: &mut Resource, ctx: &HookContext<'_>) -> Result<bool, HandlerError> {
    let app = ctx.deployment()?.app();
    info!(resource = %resource.id, command = %self.0, "running restart command");
    let spec = CommandSpec::new(self.0.as_str())
      .cwd(app.current_path())
      .envs(app.environment.clone())
      .user(app.owner.as_deref());
    ctx.collab.commands.run(&spec).await?;
    Ok(true)
  }
}

/// A restart override running `command` instead of restarting services.
pub fn restart_command(command: impl Into<String>) -> HandlerRef {
  Arc::new(RestartCommand(command.into()))
}

/// Write `contents` to `path` unless it already matches, content and
/// ownership included.
pub(crate) async fn ensure_file(
  ctx: &HookContext<'_>,
  path: &Path,
  contents: &[u8],
  meta: &FileMeta,
) -> Result<bool, HandlerError> {
  let files = &ctx.collab.files;
  let wanted = crate::util::hash::hash_bytes(contents);
  if files.digest(path).await?.as_ref() == Some(&wanted)
    && let Some(actual) = files.metadata(path).await?
    && meta.satisfied_by(&actual)
  {
    debug!(path = %path.display(), "file up to date");
    return Ok(false);
  }

  info!(path = %path.display(), hash = %wanted.short(12), "writing file");
  files.write(path, contents, meta).await?;
  Ok(true)
}

/// Point `link` at `target` unless it already does.
pub(crate) async fn ensure_symlink(ctx: &HookContext<'_>, target: &Path, link: &Path) -> Result<bool, HandlerError> {
  let files = &ctx.collab.files;
  if files.read_link(link).await?.as_deref() == Some(target) {
    return Ok(false);
  }
  debug!(link = %link.display(), target = %target.display(), "linking");
  files.symlink(target, link).await?;
  Ok(true)
}

/// Install or update a process-manager program.
pub(crate) async fn ensure_service(ctx: &HookContext<'_>, spec: &ServiceSpec) -> Result<bool, HandlerError> {
  let changed = ctx.collab.services.enable(spec).await?;
  if changed {
    info!(service = %spec.name, command = %spec.command, "enabled service");
  }
  Ok(changed)
}

/// Create a virtualenv unless its interpreter already exists.
pub(crate) async fn ensure_virtualenv(
  ctx: &HookContext<'_>,
  virtualenv: &Path,
  owner: Option<&str>,
) -> Result<bool, HandlerError> {
  if ctx.collab.files.exists(&virtualenv.join("bin").join("python")).await? {
    return Ok(false);
  }
  info!(virtualenv = %virtualenv.display(), "creating virtualenv");
  let spec = CommandSpec::new(format!("virtualenv {}", virtualenv.display())).user(owner);
  ctx.collab.commands.run(&spec).await?;
  Ok(true)
}

/// `pip` of a virtualenv, or the one on `PATH`.
pub(crate) fn pip_command(virtualenv: Option<&Path>) -> String {
  match virtualenv {
    Some(venv) => venv.join("bin").join("pip").display().to_string(),
    None => "pip".to_string(),
  }
}

/// Install python packages (`name -> version`, empty version for latest)
/// that are missing or at another version.
pub(crate) async fn pip_install(
  ctx: &HookContext<'_>,
  virtualenv: Option<&Path>,
  packages: &BTreeMap<String, AttrValue>,
  owner: Option<&str>,
) -> Result<bool, HandlerError> {
  let pip = pip_command(virtualenv);
  let mut changed = false;

  for (name, version) in packages {
    let version = version.to_plain_string();
    let installed = installed_pip_version(ctx, &pip, name).await?;
    let satisfied = match &installed {
      Some(installed) => version.is_empty() || *installed == version,
      None => false,
    };
    if satisfied {
      continue;
    }

    let requirement = if version.is_empty() {
      name.clone()
    } else {
      format!("{name}=={version}")
    };
    info!(package = %name, version = %version, pip = %pip, "installing python package");
    let spec = CommandSpec::new(format!("{pip} install {requirement}")).user(owner);
    ctx.collab.commands.run(&spec).await?;
    changed = true;
  }
  Ok(changed)
}

async fn installed_pip_version(ctx: &HookContext<'_>, pip: &str, name: &str) -> Result<Option<String>, HandlerError> {
  match ctx.collab.commands.run(&CommandSpec::new(format!("{pip} show {name}"))).await {
    Ok(output) => Ok(
      output
        .lines()
        .find_map(|line| line.strip_prefix("Version:"))
        .map(|v| v.trim().to_string()),
    ),
    Err(CollabError::CommandFailed { .. }) => Ok(None),
    Err(e) => Err(e.into()),
  }
}

/// The requirements file to install for a release: the declared one, or
/// the first of `requirements/<environment>.txt` and `requirements.txt`
/// present in the release.
pub(crate) async fn find_requirements(
  ctx: &HookContext<'_>,
  declared: Option<&str>,
  release: &Path,
) -> Result<Option<PathBuf>, HandlerError> {
  if let Some(declared) = declared {
    return Ok(Some(release.join(declared)));
  }

  let mut candidates = Vec::new();
  if let Some(environment) = ctx.config.get_str("environment") {
    candidates.push(release.join("requirements").join(format!("{environment}.txt")));
  }
  candidates.push(release.join("requirements.txt"));

  for candidate in candidates {
    if ctx.collab.files.exists(&candidate).await? {
      return Ok(Some(candidate));
    }
  }
  debug!(release = %release.display(), "no requirements file found");
  Ok(None)
}

/// Install a requirements file into a virtualenv for a new release.
pub(crate) async fn install_requirements(
  ctx: &HookContext<'_>,
  resource: &Resource,
  virtualenv: Option<&Path>,
) -> Result<bool, HandlerError> {
  let deployment = ctx.deployment()?;
  if !deployment.new_release() {
    return Ok(false);
  }
  let Some(release) = deployment.release_path() else {
    return Ok(false);
  };
  let Some(requirements) = find_requirements(ctx, resource.attrs.str("requirements"), &release).await? else {
    return Ok(false);
  };

  let app = deployment.app();
  info!(resource = %resource.id, requirements = %requirements.display(), "installing requirements");
  let spec = CommandSpec::new(format!("{} install -r {}", pip_command(virtualenv), requirements.display()))
    .cwd(&release)
    .env("HOME", app.path.join("shared").display().to_string())
    .user(app.owner.as_deref());
  ctx.collab.commands.run(&spec).await?;
  Ok(true)
}

/// Last path component of `path`, split on either separator.
pub(crate) fn base_name(path: &str) -> &str {
  path.rsplit(['/', '\\']).next().unwrap_or(path)
}

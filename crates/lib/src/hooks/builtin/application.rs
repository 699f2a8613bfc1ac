use async_trait::async_trait;
use tracing::{debug, info};

use crate::collab::{CommandSpec, FileMeta};
use crate::error::HandlerError;
use crate::hooks::{HookContext, LifecyclePhase, PhaseHandler};
use crate::resource::{Action, Resource, ResourceKind};

use super::ensure_symlink;

/// The application's own step in each phase.
///
/// Lays out `<path>/{shared,releases}`, checks the repository out into a
/// release directory, runs migrations and finally points `<path>/current`
/// at the release. Restarting sub-resources is driven by the deployment
/// itself once `after_restart` is reached.
#[derive(Debug, Clone, Copy)]
pub struct ApplicationHandler(pub LifecyclePhase);

#[async_trait]
impl PhaseHandler for ApplicationHandler {
  async fn run(&self, resource: &mut Resource, ctx: &HookContext<'_>) -> Result<bool, HandlerError> {
    if resource.action != Action::Deploy {
      return Ok(false);
    }
    match self.0 {
      LifecyclePhase::BeforeCompile => prepare_layout(ctx).await,
      LifecyclePhase::BeforeMigrate => checkout(ctx).await,
      LifecyclePhase::BeforeSymlink => migrate(ctx).await,
      LifecyclePhase::BeforeRestart => link_release(ctx).await,
      _ => Ok(false),
    }
  }
}

async fn prepare_layout(ctx: &HookContext<'_>) -> Result<bool, HandlerError> {
  let app = ctx.deployment()?.app();
  let meta = FileMeta::new(Some(0o755), app.owner.as_deref(), app.group.as_deref());
  let mut changed = false;
  for dir in [app.path.clone(), app.path.join("shared"), app.path.join("releases")] {
    changed |= ctx.collab.files.create_dir_all(&dir, &meta).await?;
  }
  Ok(changed)
}

async fn checkout(ctx: &HookContext<'_>) -> Result<bool, HandlerError> {
  let deployment = ctx.deployment()?;
  let app = deployment.app();
  let files = &ctx.collab.files;
  let cached = app.shared_path("cached-copy");

  let sha = ctx
    .collab
    .source
    .clone_or_update(&app.repository, &app.revision, &cached)
    .await?;
  let release = app.path.join("releases").join(&sha);

  let mut changed = false;
  if !files.exists(&release).await? {
    info!(application = %app.id, revision = %sha, release = %release.display(), "creating release");
    files.copy_dir(&cached, &release).await?;
    changed = true;
  }

  let new_release = files.read_link(&app.current_path()).await?.as_deref() != Some(release.as_path());
  let links = deployment.with_state(|state| {
    state.release_path = Some(release.clone());
    state.revision = Some(sha.clone());
    state.new_release = new_release;
    state.symlink_before_migrate.clone()
  });
  debug!(application = %app.id, new_release, "release resolved");

  for (shared, relative) in links {
    changed |= ensure_symlink(ctx, &app.shared_path(&shared), &release.join(relative)).await?;
  }
  Ok(changed)
}

async fn migrate(ctx: &HookContext<'_>) -> Result<bool, HandlerError> {
  let deployment = ctx.deployment()?;
  let app = deployment.app();
  if !app.migrate || !deployment.new_release() {
    return Ok(false);
  }
  let Some(release) = deployment.release_path() else {
    return Ok(false);
  };
  let Some(command) = deployment
    .find_sibling(ResourceKind::Django)
    .and_then(|django| django.attrs.str("migration_command"))
  else {
    debug!(application = %app.id, "no migration command available");
    return Ok(false);
  };

  info!(application = %app.id, command, "running migrations");
  let spec = CommandSpec::new(command)
    .cwd(&release)
    .envs(app.environment.clone())
    .user(app.owner.as_deref());
  ctx.collab.commands.run(&spec).await?;
  Ok(true)
}

async fn link_release(ctx: &HookContext<'_>) -> Result<bool, HandlerError> {
  let deployment = ctx.deployment()?;
  let app = deployment.app();
  let Some(release) = deployment.release_path() else {
    return Ok(false);
  };

  let mut changed = false;
  for (shared, relative) in deployment.with_state(|state| state.symlinks.clone()) {
    changed |= ensure_symlink(ctx, &app.shared_path(&shared), &release.join(relative)).await?;
  }

  if ensure_symlink(ctx, &release, &app.current_path()).await? {
    info!(application = %app.id, release = %release.display(), "release is now current");
    changed = true;
  }
  Ok(changed)
}

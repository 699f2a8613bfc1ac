use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::collab::{CommandSpec, FileMeta, TemplateVars};
use crate::error::HandlerError;
use crate::hooks::{HookContext, LifecyclePhase, PhaseHandler};
use crate::resource::{AttrValue, Resource};

use super::{base_name, ensure_file, ensure_virtualenv, install_requirements, pip_install};

const DEFAULT_SETTINGS_TEMPLATE: &str = "settings.py";

/// Django deploy sub-resource.
#[derive(Debug, Clone, Copy)]
pub struct DjangoHandler(pub LifecyclePhase);

#[async_trait]
impl PhaseHandler for DjangoHandler {
  async fn run(&self, resource: &mut Resource, ctx: &HookContext<'_>) -> Result<bool, HandlerError> {
    match self.0 {
      LifecyclePhase::BeforeCompile => before_compile(resource, ctx),
      LifecyclePhase::BeforeDeploy => before_deploy(resource, ctx).await,
      LifecyclePhase::BeforeMigrate => {
        let venv = virtualenv(resource);
        install_requirements(ctx, resource, Some(&venv)).await
      }
      LifecyclePhase::BeforeSymlink => collectstatic(resource, ctx).await,
      _ => Ok(false),
    }
  }
}

fn virtualenv(resource: &Resource) -> PathBuf {
  PathBuf::from(resource.attrs.str("virtualenv").unwrap_or_default())
}

fn python(resource: &Resource) -> String {
  virtualenv(resource).join("bin").join("python").display().to_string()
}

fn before_compile(resource: &mut Resource, ctx: &HookContext<'_>) -> Result<bool, HandlerError> {
  if !resource.attrs.contains("migration_command") {
    let command = format!("{} manage.py migrate --noinput", python(resource));
    resource.attrs.set("migration_command", command);
  }

  let settings_file = resource
    .attrs
    .str("local_settings_file")
    .unwrap_or("local_settings.py")
    .to_string();
  let base = base_name(&settings_file).to_string();
  ctx
    .deployment()?
    .with_state(|state| state.symlink_before_migrate.insert(base, settings_file));
  Ok(false)
}

async fn before_deploy(resource: &mut Resource, ctx: &HookContext<'_>) -> Result<bool, HandlerError> {
  let app = ctx.deployment()?.app();
  let venv = virtualenv(resource);
  let owner = app.owner.as_deref();

  let mut changed = ensure_virtualenv(ctx, &venv, owner).await?;
  if let Some(packages) = resource.attrs.map("packages") {
    changed |= pip_install(ctx, Some(&venv), packages, owner).await?;
  }

  if !resource.attrs.contains("database_host")
    && let Some(role) = resource.attrs.str("database_master_role")
  {
    let host = ctx.resolve_role(role).await?;
    debug!(resource = %resource.id, role, %host, "resolved database host");
    resource.attrs.set("database_host", host);
  }

  let settings_file = resource.attrs.str("local_settings_file").unwrap_or("local_settings.py");
  let path = app.shared_path(base_name(settings_file));
  let template = resource
    .attrs
    .str("settings_template")
    .unwrap_or(DEFAULT_SETTINGS_TEMPLATE);
  let rendered = ctx.collab.templates.render(template, &settings_vars(resource)).await?;
  let meta = FileMeta::new(Some(0o644), app.owner.as_deref(), app.group.as_deref());
  changed |= ensure_file(ctx, &path, rendered.as_bytes(), &meta).await?;

  Ok(changed)
}

/// `settings` extended with `debug` and the `database` block.
fn settings_vars(resource: &Resource) -> TemplateVars {
  let attrs = &resource.attrs;
  let text = |key: &str| AttrValue::from(attrs.str(key).unwrap_or_default());

  let mut database_settings = BTreeMap::new();
  database_settings.insert("engine".to_string(), text("database_engine"));
  database_settings.insert("database".to_string(), text("database_name"));
  database_settings.insert("username".to_string(), text("database_username"));
  database_settings.insert("password".to_string(), text("database_password"));

  let mut database = BTreeMap::new();
  database.insert("host".to_string(), text("database_host"));
  database.insert("settings".to_string(), AttrValue::Map(database_settings));

  let mut vars: TemplateVars = attrs.map("settings").cloned().unwrap_or_default();
  vars.insert("debug".to_string(), AttrValue::Bool(attrs.flag("debug")));
  vars.insert("database".to_string(), AttrValue::Map(database));
  if let Some(hosts) = attrs.str("allowed_hosts") {
    vars.insert("allowed_hosts".to_string(), hosts.into());
  }
  vars
}

async fn collectstatic(resource: &mut Resource, ctx: &HookContext<'_>) -> Result<bool, HandlerError> {
  let command = match resource.attrs.get("collectstatic") {
    Some(AttrValue::Str(custom)) => custom.clone(),
    Some(AttrValue::Bool(true)) => "collectstatic --noinput".to_string(),
    _ => return Ok(false),
  };
  let deployment = ctx.deployment()?;
  if !deployment.new_release() {
    return Ok(false);
  }
  let Some(release) = deployment.release_path() else {
    return Ok(false);
  };

  let app = deployment.app();
  info!(resource = %resource.id, command = %command, "collecting static files");
  let spec = CommandSpec::new(format!("{} manage.py {command}", python(resource)))
    .cwd(&release)
    .user(app.owner.as_deref());
  ctx.collab.commands.run(&spec).await?;
  Ok(true)
}

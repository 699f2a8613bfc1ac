use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::collab::{FileMeta, ServiceSpec, TemplateVars};
use crate::error::HandlerError;
use crate::hooks::{HookContext, LifecyclePhase, PhaseHandler};
use crate::resource::{AttrValue, Resource, ResourceKind};

use super::{ensure_file, ensure_service, ensure_virtualenv, install_requirements, pip_install};

const DEFAULT_CONFIG_TEMPLATE: &str = "gunicorn_config.py";
const CONFIG_FILE: &str = "gunicorn_config.py";

/// Gunicorn sub-resource: installs gunicorn, renders its config and runs it
/// under the process manager as `<app>`.
#[derive(Debug, Clone, Copy)]
pub struct GunicornHandler(pub LifecyclePhase);

#[async_trait]
impl PhaseHandler for GunicornHandler {
  async fn run(&self, resource: &mut Resource, ctx: &HookContext<'_>) -> Result<bool, HandlerError> {
    match self.0 {
      LifecyclePhase::BeforeCompile => before_compile(resource, ctx).await,
      LifecyclePhase::BeforeDeploy => before_deploy(resource, ctx).await,
      LifecyclePhase::BeforeMigrate => {
        let venv = resource.attrs.str("virtualenv").map(PathBuf::from);
        install_requirements(ctx, resource, venv.as_deref()).await
      }
      _ => Ok(false),
    }
  }
}

async fn before_compile(resource: &mut Resource, ctx: &HookContext<'_>) -> Result<bool, HandlerError> {
  if resource.attrs.str("app_module").is_none_or(str::is_empty) {
    return Err(HandlerError::invalid("you must specify an application module to load"));
  }

  let deployment = ctx.deployment()?;
  let owner = deployment.app().owner.as_deref();
  if let Some(venv) = deployment
    .find_sibling(ResourceKind::Django)
    .and_then(|django| django.attrs.str("virtualenv"))
  {
    debug!(resource = %resource.id, virtualenv = venv, "using the django virtualenv");
    resource.attrs.set("virtualenv", venv);
  }

  let venv = resource.attrs.str("virtualenv").map(PathBuf::from);
  let mut changed = false;
  if let Some(venv) = &venv {
    changed |= ensure_virtualenv(ctx, venv, owner).await?;
  }

  let mut packages = resource.attrs.map("packages").cloned().unwrap_or_default();
  packages
    .entry("gunicorn".to_string())
    .or_insert_with(|| AttrValue::from(""));
  changed |= pip_install(ctx, venv.as_deref(), &packages, owner).await?;
  Ok(changed)
}

async fn before_deploy(resource: &mut Resource, ctx: &HookContext<'_>) -> Result<bool, HandlerError> {
  let deployment = ctx.deployment()?;
  let app = deployment.app();
  let attrs = &resource.attrs;
  let config_path = app.shared_path(CONFIG_FILE);

  let template = attrs.str("settings_template").unwrap_or(DEFAULT_CONFIG_TEMPLATE);
  let rendered = ctx.collab.templates.render(template, &config_vars(resource)).await?;
  let meta = FileMeta::new(Some(0o644), app.owner.as_deref(), app.group.as_deref());
  let mut changed = ensure_file(ctx, &config_path, rendered.as_bytes(), &meta).await?;

  let app_module = attrs.str("app_module").unwrap_or_default();
  let base_command = if app_module == "django" {
    let django = deployment.require_sibling(ResourceKind::Django)?;
    let venv = PathBuf::from(django.attrs.str("virtualenv").unwrap_or_default());
    format!(
      "{} {}.wsgi:application",
      venv.join("bin").join("gunicorn").display(),
      app.name
    )
  } else {
    let gunicorn = match attrs.str("virtualenv") {
      Some(venv) => PathBuf::from(venv).join("bin").join("gunicorn").display().to_string(),
      None => "gunicorn".to_string(),
    };
    format!("{gunicorn} {app_module}")
  };

  let bin = attrs
    .str("virtualenv")
    .map(PathBuf::from)
    .unwrap_or_else(|| app.shared_path("env"))
    .join("bin");
  let mut environment: BTreeMap<String, String> = attrs.string_map("environment");
  environment.insert("PATH".to_string(), bin.display().to_string());

  let spec = ServiceSpec {
    name: app.name.clone(),
    command: format!("{base_command} -c {}", config_path.display()),
    directory: Some(
      attrs
        .str("directory")
        .map(str::to_string)
        .unwrap_or_else(|| app.current_path().display().to_string()),
    ),
    environment,
    user: app.owner.clone(),
    autostart: false,
  };
  changed |= ensure_service(ctx, &spec).await?;
  Ok(changed)
}

/// Variables of the gunicorn config template.
fn config_vars(resource: &Resource) -> TemplateVars {
  let attrs = &resource.attrs;
  let listen = match attrs.str("bind") {
    Some(bind) => bind.to_string(),
    None => format!(
      "{}:{}",
      attrs.str("host").unwrap_or("0.0.0.0"),
      attrs.int("port").unwrap_or(8080)
    ),
  };

  let mut vars = TemplateVars::new();
  vars.insert("listen".to_string(), listen.into());
  for key in ["backlog", "workers", "max_requests", "timeout", "keepalive"] {
    if let Some(value) = attrs.get(key) {
      vars.insert(key.to_string(), value.clone());
    }
  }
  vars.insert(
    "worker_class".to_string(),
    attrs.str("worker_class").unwrap_or("sync").into(),
  );
  vars.insert("preload_app".to_string(), attrs.flag("preload_app").into());
  vars.insert(
    "pidfile".to_string(),
    attrs.str("pidfile").unwrap_or_default().into(),
  );
  vars
}

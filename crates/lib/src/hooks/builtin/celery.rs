use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::collab::{FileMeta, ServiceSpec, TemplateVars};
use crate::error::HandlerError;
use crate::hooks::{HookContext, LifecyclePhase, PhaseHandler};
use crate::resource::{AttrValue, Resource, ResourceKind};

use super::{base_name, ensure_file, ensure_service};

const DEFAULT_CONFIG_TEMPLATE: &str = "celeryconfig.py";
const DEFAULT_TRANSPORT: &str = "amqplib";

/// Celery sub-resource: renders the worker configuration and runs
/// `celeryd`, `celerybeat` and `celerycam` under the process manager.
#[derive(Debug, Clone, Copy)]
pub struct CeleryHandler(pub LifecyclePhase);

#[async_trait]
impl PhaseHandler for CeleryHandler {
  async fn run(&self, resource: &mut Resource, ctx: &HookContext<'_>) -> Result<bool, HandlerError> {
    match self.0 {
      LifecyclePhase::BeforeCompile => before_compile(resource, ctx).await,
      LifecyclePhase::BeforeDeploy => before_deploy(resource, ctx).await,
      _ => Ok(false),
    }
  }
}

fn config(resource: &Resource) -> Result<String, HandlerError> {
  resource
    .attrs
    .str("config")
    .filter(|c| !c.is_empty())
    .map(str::to_string)
    .ok_or_else(|| HandlerError::invalid("you must specify a celery config module"))
}

async fn before_compile(resource: &mut Resource, ctx: &HookContext<'_>) -> Result<bool, HandlerError> {
  let config = config(resource)?;
  let deployment = ctx.deployment()?;
  let app_name = deployment.app().name.clone();

  let base = base_name(&config).to_string();
  deployment.with_state(|state| state.symlink_before_migrate.insert(base, config));

  let (role, host) = {
    let broker = resource.attrs.map_mut("broker");
    broker
      .entry("transport".to_string())
      .or_insert_with(|| DEFAULT_TRANSPORT.into());
    let role = broker
      .entry("host_role".to_string())
      .or_insert_with(|| format!("{app_name}_task_broker").into())
      .to_plain_string();
    (role, broker.get("host").map(AttrValue::to_plain_string))
  };

  if host.is_none() {
    let address = ctx.resolve_role(&role).await?;
    debug!(resource = %resource.id, role = %role, host = %address, "resolved task broker");
    resource.attrs.map_mut("broker").insert("host".to_string(), address.into());
  }
  Ok(false)
}

async fn before_deploy(resource: &mut Resource, ctx: &HookContext<'_>) -> Result<bool, HandlerError> {
  let config = config(resource)?;
  let deployment = ctx.deployment()?;
  let app = deployment.app();

  let template = resource.attrs.str("template").unwrap_or(DEFAULT_CONFIG_TEMPLATE);
  let rendered = ctx.collab.templates.render(template, &config_vars(resource)).await?;
  let meta = FileMeta::new(Some(0o644), app.owner.as_deref(), app.group.as_deref());
  let mut changed = ensure_file(ctx, &app.shared_path(base_name(&config)), rendered.as_bytes(), &meta).await?;

  if resource.attrs.flag("celerycam") {
    resource.attrs.set("enable_events", true);
  }

  let django = resource.attrs.flag("django");
  let python = if django {
    let sibling = deployment.require_sibling(ResourceKind::Django)?;
    let venv = PathBuf::from(sibling.attrs.str("virtualenv").unwrap_or_default());
    Some(venv.join("bin").join("python").display().to_string())
  } else {
    None
  };

  for (program, command) in commands(resource)? {
    let mut environment = resource.attrs.string_map("environment");
    let command = match &python {
      Some(python) => format!("{python} manage.py {command}"),
      None => {
        environment.insert("CELERY_CONFIG_MODULE".to_string(), config.clone());
        command
      }
    };
    let spec = ServiceSpec {
      name: format!("{}-{program}", app.name),
      command,
      directory: Some(app.current_path().display().to_string()),
      environment,
      user: app.owner.clone(),
      autostart: false,
    };
    changed |= ensure_service(ctx, &spec).await?;
  }
  Ok(changed)
}

/// `(program, command)` for each enabled celery program.
fn commands(resource: &Resource) -> Result<Vec<(&'static str, String)>, HandlerError> {
  let attrs = &resource.attrs;
  let mut commands = Vec::new();

  if attrs.flag("celeryd") {
    let mut command = "celeryd".to_string();
    if let Some(queues) = attrs.list("queues") {
      let names: Vec<&str> = queues.iter().filter_map(AttrValue::as_str).collect();
      command.push_str(&format!(" -Q {}", names.join(",")));
    }
    if attrs.flag("enable_events") {
      command.push_str(" -E");
    }
    commands.push(("celeryd", command));
  }
  if attrs.flag("celerybeat") {
    commands.push(("celerybeat", "celerybeat".to_string()));
  }
  if attrs.flag("celerycam") {
    let command = if attrs.flag("django") {
      "celerycam".to_string()
    } else {
      let camera = attrs
        .str("camera_class")
        .ok_or_else(|| HandlerError::invalid(format!("{} runs celerycam without a camera class", resource.id)))?;
      format!("celeryev --camera=\"{camera}\"")
    };
    commands.push(("celerycam", command));
  }
  Ok(commands)
}

fn config_vars(resource: &Resource) -> TemplateVars {
  let results = resource.attrs.map("results").cloned().unwrap_or_default();
  let backend = results
    .get("backend")
    .map(AttrValue::to_plain_string)
    .unwrap_or_default();

  let mut vars = TemplateVars::new();
  vars.insert(
    "broker".to_string(),
    AttrValue::Map(resource.attrs.map("broker").cloned().unwrap_or_default()),
  );
  vars.insert("results".to_string(), AttrValue::Map(results));
  vars.insert("results_backend".to_string(), backend.into());
  vars
}

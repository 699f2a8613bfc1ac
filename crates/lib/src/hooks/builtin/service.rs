use async_trait::async_trait;
use tracing::info;

use crate::collab::ServiceSpec;
use crate::error::HandlerError;
use crate::hooks::{HookContext, PhaseHandler};
use crate::resource::{Action, Resource};

use super::ensure_service;

/// Enables, disables or restarts a process-manager program.
///
/// A service without a `command` only manages an existing program; enabling
/// one that has no definition yet is an error.
#[derive(Debug, Clone, Copy)]
pub struct ServiceHandler;

#[async_trait]
impl PhaseHandler for ServiceHandler {
  async fn run(&self, resource: &mut Resource, ctx: &HookContext<'_>) -> Result<bool, HandlerError> {
    let name = resource.attrs.str("service_name").unwrap_or(resource.name()).to_string();
    let services = &ctx.collab.services;

    match resource.action {
      Action::Enable => match resource.attrs.str("command") {
        Some(command) => {
          let spec = ServiceSpec {
            name,
            command: command.to_string(),
            directory: resource.attrs.str("directory").map(str::to_string),
            environment: resource.attrs.string_map("environment"),
            user: resource.attrs.str("user").map(str::to_string),
            autostart: resource.attrs.flag("autostart"),
          };
          ensure_service(ctx, &spec).await
        }
        None => {
          if services.definition(&name).await?.is_none() {
            return Err(HandlerError::invalid(format!(
              "{} has no command and no existing program definition",
              resource.id
            )));
          }
          Ok(false)
        }
      },
      Action::Disable => {
        let changed = services.disable(&name).await?;
        if changed {
          info!(service = %name, "disabled service");
        }
        Ok(changed)
      }
      Action::Restart => {
        info!(service = %name, "restarting service");
        services.restart(&name).await?;
        Ok(true)
      }
      _ => Ok(false),
    }
  }
}

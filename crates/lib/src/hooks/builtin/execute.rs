use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::collab::{CollabError, CommandSpec};
use crate::error::HandlerError;
use crate::hooks::{HookContext, PhaseHandler};
use crate::resource::{Action, Resource};

/// Runs a command guarded by `creates` and/or `unless`.
#[derive(Debug, Clone, Copy)]
pub struct ExecuteHandler;

#[async_trait]
impl PhaseHandler for ExecuteHandler {
  async fn run(&self, resource: &mut Resource, ctx: &HookContext<'_>) -> Result<bool, HandlerError> {
    if resource.action != Action::Run {
      return Ok(false);
    }
    let attrs = &resource.attrs;
    let user = attrs.str("user");

    if let Some(creates) = attrs.str("creates")
      && ctx.collab.files.exists(Path::new(creates)).await?
    {
      debug!(resource = %resource.id, creates, "guard file exists, not running");
      return Ok(false);
    }

    if let Some(unless) = attrs.str("unless") {
      match ctx.collab.commands.run(&CommandSpec::new(unless).user(user)).await {
        Ok(_) => {
          debug!(resource = %resource.id, unless, "guard command succeeded, not running");
          return Ok(false);
        }
        Err(CollabError::CommandFailed { .. }) => {}
        Err(e) => return Err(e.into()),
      }
    }

    let command = attrs
      .str("command")
      .ok_or_else(|| HandlerError::invalid(format!("{} has no command", resource.id)))?;
    let mut spec = CommandSpec::new(command)
      .envs(attrs.string_map("environment"))
      .user(user);
    if let Some(cwd) = attrs.str("cwd") {
      spec = spec.cwd(cwd);
    }

    info!(resource = %resource.id, command, "running command");
    ctx.collab.commands.run(&spec).await?;
    Ok(true)
  }
}

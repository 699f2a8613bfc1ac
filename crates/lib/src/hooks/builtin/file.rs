use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use crate::collab::{FileMeta, TemplateVars};
use crate::error::HandlerError;
use crate::hooks::{HookContext, PhaseHandler};
use crate::resource::{Action, Resource, parse_mode};

use super::ensure_file;

fn target_path(resource: &Resource) -> PathBuf {
  PathBuf::from(resource.attrs.str("path").unwrap_or(resource.name()))
}

fn file_meta(resource: &Resource) -> FileMeta {
  FileMeta::new(
    resource.attrs.str("mode").and_then(parse_mode),
    resource.owner(),
    resource.group(),
  )
}

async fn delete(resource: &Resource, ctx: &HookContext<'_>) -> Result<bool, HandlerError> {
  let path = target_path(resource);
  let removed = ctx.collab.files.remove(&path).await?;
  if removed {
    info!(resource = %resource.id, path = %path.display(), "removed file");
  }
  Ok(removed)
}

/// Writes a file with literal content.
#[derive(Debug, Clone, Copy)]
pub struct FileHandler;

#[async_trait]
impl PhaseHandler for FileHandler {
  async fn run(&self, resource: &mut Resource, ctx: &HookContext<'_>) -> Result<bool, HandlerError> {
    match resource.action {
      Action::Create => {
        let content = resource.attrs.str("content").unwrap_or_default();
        ensure_file(ctx, &target_path(resource), content.as_bytes(), &file_meta(resource)).await
      }
      Action::Delete => delete(resource, ctx).await,
      _ => Ok(false),
    }
  }
}

/// Renders a template through the template collaborator and writes it.
#[derive(Debug, Clone, Copy)]
pub struct TemplateHandler;

#[async_trait]
impl PhaseHandler for TemplateHandler {
  async fn run(&self, resource: &mut Resource, ctx: &HookContext<'_>) -> Result<bool, HandlerError> {
    match resource.action {
      Action::Create => {
        let source = resource
          .attrs
          .str("source")
          .ok_or_else(|| HandlerError::invalid(format!("{} has no template source", resource.id)))?;
        let vars: TemplateVars = resource.attrs.map("variables").cloned().unwrap_or_default();
        let rendered = ctx.collab.templates.render(source, &vars).await?;
        ensure_file(ctx, &target_path(resource), rendered.as_bytes(), &file_meta(resource)).await
      }
      Action::Delete => delete(resource, ctx).await,
      _ => Ok(false),
    }
  }
}

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::HandlerError;
use crate::hooks::{HookContext, PhaseHandler};
use crate::resource::{Action, Resource};

/// Installs, upgrades or removes a system package.
#[derive(Debug, Clone, Copy)]
pub struct PackageHandler;

#[async_trait]
impl PhaseHandler for PackageHandler {
  async fn run(&self, resource: &mut Resource, ctx: &HookContext<'_>) -> Result<bool, HandlerError> {
    let name = resource.attrs.str("package_name").unwrap_or(resource.name()).to_string();
    let wanted = resource.attrs.str("version");
    let packages = &ctx.collab.packages;
    let installed = packages.installed_version(&name).await?;

    match resource.action {
      Action::Install => {
        let satisfied = match (&installed, wanted) {
          (Some(installed), Some(wanted)) => installed == wanted,
          (Some(_), None) => true,
          (None, _) => false,
        };
        if satisfied {
          debug!(package = %name, "already installed");
          return Ok(false);
        }
        info!(package = %name, version = ?wanted, "installing package");
        packages.install(&name, wanted).await?;
        Ok(true)
      }
      Action::Upgrade => {
        if let (Some(installed), Some(wanted)) = (&installed, wanted) {
          if installed == wanted {
            return Ok(false);
          }
        } else if installed.is_some() && !packages.upgrade_available(&name).await? {
          debug!(package = %name, "already at the latest version");
          return Ok(false);
        }
        info!(package = %name, from = ?installed, "upgrading package");
        packages.install(&name, wanted).await?;
        Ok(true)
      }
      Action::Remove => {
        if installed.is_none() {
          return Ok(false);
        }
        info!(package = %name, "removing package");
        packages.remove(&name).await?;
        Ok(true)
      }
      _ => Ok(false),
    }
  }
}

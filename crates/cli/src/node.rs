//! Loading a node description from the command line.
//!
//! Every subcommand goes through the same steps: read the manifest, layer
//! the node configuration, open the secrets bag, declare the resources and
//! wire up the local collaborators.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use convoy_lib::collab::Collaborators;
use convoy_lib::collab::local::LocalOptions;
use convoy_lib::config::{Config, ConfigProvider, StaticConfig};
use convoy_lib::manifest::Manifest;
use convoy_lib::resource::ResourceTable;

use crate::NodeArgs;

/// A manifest declared into a fresh resource table.
pub struct LoadedNode {
  pub path: PathBuf,
  pub config: Config,
  pub table: ResourceTable,
  pub collab: Collaborators,
}

pub fn load(args: &NodeArgs) -> Result<LoadedNode> {
  let path = dunce::canonicalize(&args.manifest)
    .with_context(|| format!("Manifest not found: {}", args.manifest.display()))?;
  let manifest = Manifest::load(&path).context("Failed to load manifest")?;
  let config = manifest.config();

  let secrets: Arc<dyn ConfigProvider> = match &args.secrets {
    Some(file) => Arc::new(
      StaticConfig::from_json_file(file).with_context(|| format!("Failed to load secrets: {}", file.display()))?,
    ),
    None => Arc::new(StaticConfig::new()),
  };

  let table = manifest
    .declare(&config, secrets.as_ref())
    .with_context(|| format!("Invalid manifest: {}", path.display()))?;

  let options = local_options(args, &path, &manifest);
  debug!(
    node = %config.node_name(),
    templates = %options.template_dir.display(),
    resources = table.len(),
    "declared node"
  );
  let collab = Collaborators::local(options, secrets);

  Ok(LoadedNode {
    path,
    config,
    table,
    collab,
  })
}

fn local_options(args: &NodeArgs, manifest_path: &Path, manifest: &Manifest) -> LocalOptions {
  let defaults = LocalOptions::default();
  let template_dir = match &args.templates {
    Some(dir) => dir.clone(),
    None => manifest_path
      .parent()
      .map(|dir| dir.join("templates"))
      .unwrap_or(defaults.template_dir),
  };

  LocalOptions {
    template_dir,
    supervisor_dir: args.supervisor_dir.clone().unwrap_or(defaults.supervisor_dir),
    supervisor_ctl: args.supervisor_ctl.clone().unwrap_or(defaults.supervisor_ctl),
    inventory: manifest.inventory().clone(),
    shell: args.shell.clone(),
  }
}

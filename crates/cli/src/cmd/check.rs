//! Implementation of the `convoy check` command.
//!
//! Validates a manifest without converging anything: parsing, placeholder
//! references, attribute schemas, duplicate declarations, dependency and
//! notification targets, and cycles.

use anyhow::{Context, Result};

use convoy_lib::execute::Engine;

use crate::NodeArgs;
use crate::node;
use crate::output::print_success;

pub fn cmd_check(args: &NodeArgs) -> Result<()> {
  let mut loaded = node::load(args)?;
  let engine = Engine::new(loaded.config, loaded.collab);
  let waves = engine
    .plan(&mut loaded.table)
    .with_context(|| format!("Invalid manifest: {}", loaded.path.display()))?;

  let subs: usize = loaded.table.iter().map(|r| r.subs.len()).sum();
  print_success(&format!(
    "{} is valid: {} resources, {} sub-resources, {} waves",
    loaded.path.display(),
    loaded.table.len(),
    subs,
    waves.len()
  ));
  Ok(())
}

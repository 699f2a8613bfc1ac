//! Implementation of the `convoy plan` command.
//!
//! Prints the waves a run would converge in. Nothing on the host is read or
//! changed.

use anyhow::{Context, Result};
use serde::Serialize;

use convoy_lib::execute::Engine;
use convoy_lib::resource::ResourceId;

use crate::NodeArgs;
use crate::node;
use crate::output::{print_info, print_json, print_stat};

#[derive(Debug, Serialize)]
struct PlanOutput<'a> {
  node: &'a str,
  roles: &'a [String],
  waves: &'a [Vec<ResourceId>],
}

pub fn cmd_plan(args: &NodeArgs, json: bool) -> Result<()> {
  let mut loaded = node::load(args)?;
  let engine = Engine::new(loaded.config, loaded.collab);
  let waves = engine
    .plan(&mut loaded.table)
    .with_context(|| format!("Failed to plan: {}", loaded.path.display()))?;
  let config = engine.config();

  if json {
    return print_json(&PlanOutput {
      node: config.node_name(),
      roles: config.roles(),
      waves: &waves,
    });
  }

  print_info(&format!("Plan for {}", config.node_name()));
  print_stat("Roles", &config.roles().join(", "));
  print_stat("Resources", &loaded.table.len().to_string());
  print_stat("Waves", &waves.len().to_string());

  for (i, wave) in waves.iter().enumerate() {
    println!();
    println!("Wave {}:", i + 1);
    for id in wave {
      let resource = loaded.table.find(id);
      let action = resource.map(|r| r.action.to_string()).unwrap_or_default();
      let subs = resource.map(|r| r.subs.len()).unwrap_or(0);
      if subs > 0 {
        println!("  {id} ({action}, {subs} sub-resources)");
      } else {
        println!("  {id} ({action})");
      }
    }
  }

  Ok(())
}

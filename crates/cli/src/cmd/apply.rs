//! Implementation of the `convoy apply` command.
//!
//! This command declares the manifest's resources and converges the local
//! host to them, printing one line per resource and a summary.

use anyhow::{Context, Result};
use owo_colors::{OwoColorize, Stream};
use tracing::warn;

use convoy_lib::execute::{Engine, ExecuteConfig, ResourceReport, RunReport, RunStatus};
use convoy_lib::resource::ResourceState;

use crate::NodeArgs;
use crate::node;
use crate::output::{format_duration, print_error, print_json, print_stat, print_success, print_warning, state_symbol, symbols};

/// Execute the apply command.
///
/// Returns the process exit code of the run: `0` on success, `1` when a
/// resource failed, `2` when a fatal error aborted the run and `130` when it
/// was interrupted.
pub fn cmd_apply(args: &NodeArgs, parallelism: Option<usize>, json: bool) -> Result<u8> {
  let loaded = node::load(args)?;

  let mut options = ExecuteConfig::default();
  if let Some(parallelism) = parallelism {
    options.parallelism = parallelism.max(1);
  }
  let engine = Engine::new(loaded.config, loaded.collab).with_options(options);
  let cancel = engine.cancellation().clone();

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt
    .block_on(async {
      let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() && cancel.cancel() {
          warn!("interrupted, waiting for running resources to finish");
        }
      });
      let report = engine.converge(loaded.table).await;
      interrupt.abort();
      report
    })
    .with_context(|| format!("Apply failed: {}", loaded.path.display()))?;

  if json {
    print_json(&report)?;
  } else {
    print_report(&report);
  }

  Ok(u8::try_from(report.exit_code()).unwrap_or(1))
}

fn print_report(report: &RunReport) {
  for resource in &report.resources {
    print_resource(resource, 1);
  }

  if !report.notifications.is_empty() {
    println!();
    println!("Notifications:");
    for n in &report.notifications {
      println!(
        "  {} {} {} {} {}",
        state_symbol(n.state),
        n.source,
        symbols::ARROW,
        n.target,
        format!("({})", n.action).if_supports_color(Stream::Stdout, |s| s.dimmed())
      );
    }
  }

  println!();
  let summary = format!("Run {} in {}", report.status, format_duration(report.duration));
  match report.status {
    RunStatus::Success => print_success(&summary),
    RunStatus::Cancelled => print_warning(&summary),
    RunStatus::Failed | RunStatus::Aborted => print_error(&summary),
  }
  print_stat("Applied", &report.applied_count().to_string());
  print_stat("Up to date", &report.count(ResourceState::UpToDate).to_string());
  print_stat("Skipped", &report.count(ResourceState::Skipped).to_string());
  print_stat("Failed", &report.count(ResourceState::Failed).to_string());

  for error in &report.errors {
    let subject = error.resource.as_ref().map(|id| format!("{id}: ")).unwrap_or_default();
    print_error(&format!("{subject}{}", error.message));
  }
}

fn print_resource(resource: &ResourceReport, depth: usize) {
  let indent = "  ".repeat(depth);
  let mut line = format!("{indent}{} {}", state_symbol(resource.state), resource.id);
  if let Some(revision) = &resource.revision {
    let short: String = revision.chars().take(12).collect();
    line.push_str(&format!(" @ {short}"));
  }
  match &resource.reason {
    Some(reason) => println!(
      "{line} {}",
      format!("({reason})").if_supports_color(Stream::Stdout, |s| s.dimmed())
    ),
    None => println!("{line}"),
  }
  for sub in &resource.sub_resources {
    print_resource(sub, depth + 1);
  }
}

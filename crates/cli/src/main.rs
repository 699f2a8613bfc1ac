mod cmd;
mod node;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cmd::{cmd_apply, cmd_check, cmd_plan};
use crate::output::print_error;

/// convoy - declarative convergence for web application nodes
#[derive(Parser)]
#[command(name = "convoy")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output (repeat for trace logging)
  #[arg(short, long, global = true, action = clap::ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Converge this node to the state declared in a manifest
  Apply {
    #[command(flatten)]
    node: NodeArgs,

    /// Maximum number of resources converged concurrently
    #[arg(short = 'j', long)]
    parallelism: Option<usize>,

    /// Print the run report as JSON
    #[arg(long)]
    json: bool,
  },

  /// Show the order resources would converge in, without touching the host
  Plan {
    #[command(flatten)]
    node: NodeArgs,

    /// Print the waves as JSON
    #[arg(long)]
    json: bool,
  },

  /// Validate a manifest: parsing, references, schemas and the dependency graph
  Check {
    #[command(flatten)]
    node: NodeArgs,
  },
}

/// Where the node description comes from and how the host is reached.
#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
  /// Path to the manifest (default: convoy.json)
  #[arg(default_value = "convoy.json")]
  pub manifest: PathBuf,

  /// JSON file holding secrets, flattened to dotted keys
  #[arg(short, long)]
  pub secrets: Option<PathBuf>,

  /// Template directory (default: `templates` next to the manifest)
  #[arg(long)]
  pub templates: Option<PathBuf>,

  /// Directory supervisor program files are written to
  #[arg(long)]
  pub supervisor_dir: Option<PathBuf>,

  /// Supervisor control command
  #[arg(long)]
  pub supervisor_ctl: Option<String>,

  /// Shell commands run through (default: /bin/sh)
  #[arg(long)]
  pub shell: Option<String>,
}

fn main() -> ExitCode {
  let cli = Cli::parse();

  let default_level = match cli.verbose {
    0 => "info",
    1 => "debug",
    _ => "trace",
  };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let result = match cli.command {
    Commands::Apply {
      node,
      parallelism,
      json,
    } => cmd_apply(&node, parallelism, json),
    Commands::Plan { node, json } => cmd_plan(&node, json).map(|()| 0),
    Commands::Check { node } => cmd_check(&node).map(|()| 0),
  };

  match result {
    Ok(code) => ExitCode::from(code),
    Err(err) => {
      print_error(&format!("{err:#}"));
      ExitCode::FAILURE
    }
  }
}

//! CLI output formatting utilities.
//!
//! Provides consistent formatting for terminal output including colored status
//! messages, resource states and human-readable durations.

use std::time::Duration;

use anyhow::Context;
use owo_colors::{OwoColorize, Stream};

use convoy_lib::resource::ResourceState;

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
  pub const ARROW: &str = "→";
  pub const SKIP: &str = "-";
  pub const APPLY: &str = "+";
}

/// Round to whole milliseconds before formatting, so `1.234567s` reads
/// `1s 234ms`.
pub fn format_duration(duration: Duration) -> String {
  let millis = Duration::from_millis(duration.as_millis() as u64);
  if millis.is_zero() {
    return "0ms".to_string();
  }
  humantime::format_duration(millis).to_string()
}

/// Colored marker for the final state of a resource.
pub fn state_symbol(state: ResourceState) -> String {
  let stream = Stream::Stdout;
  match state {
    ResourceState::Applied => symbols::APPLY.if_supports_color(stream, |s| s.green()).to_string(),
    ResourceState::UpToDate => symbols::SUCCESS.if_supports_color(stream, |s| s.dimmed()).to_string(),
    ResourceState::Failed => symbols::ERROR.if_supports_color(stream, |s| s.red()).to_string(),
    ResourceState::Skipped => symbols::SKIP.if_supports_color(stream, |s| s.yellow()).to_string(),
    _ => symbols::INFO.to_string(),
  }
}

pub fn print_success(message: &str) {
  println!(
    "{} {}",
    symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
    message
  );
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_warning(message: &str) {
  eprintln!(
    "{} {}",
    symbols::WARNING.if_supports_color(Stream::Stderr, |s| s.yellow()),
    message.if_supports_color(Stream::Stderr, |s| s.yellow())
  );
}

pub fn print_info(message: &str) {
  println!(
    "{} {}",
    symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()),
    message
  );
}

pub fn print_stat(label: &str, value: &str) {
  println!(
    "  {}: {}",
    label.if_supports_color(Stream::Stdout, |s| s.dimmed()),
    value
  );
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}

//! Run-level cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A cloneable cancellation flag.
///
/// The engine checks it before starting each resource and before flushing
/// notifications. A handler already running finishes its current phase.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
  cancelled: Arc<AtomicBool>,
}

impl Cancellation {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::Acquire)
  }

  /// Mark the run as cancelled. Returns `true` on the first call.
  pub fn cancel(&self) -> bool {
    !self.cancelled.swap(true, Ordering::AcqRel)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn clones_share_the_flag() {
    let token = Cancellation::new();
    let other = token.clone();
    assert!(!other.is_cancelled());

    assert!(token.cancel());
    assert!(other.is_cancelled());
    assert!(!other.cancel());
  }
}

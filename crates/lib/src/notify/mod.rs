//! Run-wide notification queue.
//!
//! Handlers and declared `notifies` push `(source, target, action)` entries
//! while resources converge, possibly from concurrent tasks. Each entry
//! carries the topological position of the resource that queued it so the
//! drained order matches a sequential run regardless of task scheduling.

use std::collections::HashSet;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::resource::{Action, ResourceId};

/// One queued notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
  pub source: ResourceId,
  pub target: ResourceId,
  pub action: Action,
}

#[derive(Debug)]
struct Queued {
  order: usize,
  seq: usize,
  notification: Notification,
}

#[derive(Debug, Default)]
struct QueueState {
  entries: Vec<Queued>,
  next_seq: usize,
}

/// Append-only queue, drained once per flush round.
#[derive(Debug, Default)]
pub struct NotificationQueue {
  state: Mutex<QueueState>,
}

impl NotificationQueue {
  pub fn new() -> Self {
    Self::default()
  }

  /// Queue a notification raised by the resource at topological position `order`.
  pub fn push(&self, order: usize, notification: Notification) {
    let mut state = self.lock();
    let seq = state.next_seq;
    state.next_seq += 1;
    state.entries.push(Queued {
      order,
      seq,
      notification,
    });
  }

  /// Shorthand for [`push`](Self::push).
  pub fn notify(&self, order: usize, source: ResourceId, target: ResourceId, action: Action) {
    self.push(order, Notification { source, target, action });
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().entries.is_empty()
  }

  /// Drain the queue, keeping the first notification of every
  /// `(target, action)` pair in queue order.
  pub fn resolve_notifications(&self) -> Vec<Notification> {
    let mut entries = std::mem::take(&mut self.lock().entries);
    entries.sort_by_key(|q| (q.order, q.seq));

    let mut seen = HashSet::new();
    entries
      .into_iter()
      .map(|q| q.notification)
      .filter(|n| seen.insert((n.target.clone(), n.action)))
      .collect()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
    self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

//! Convergence engine.
//!
//! One pass over a [`ResourceTable`]:
//!
//! 1. finalize the table and build the dependency [`ResourceDag`]; any
//!    declaration or graph error is returned before a single handler runs
//! 2. converge resources wave by wave, running independent resources of a
//!    wave concurrently up to [`ExecuteConfig::parallelism`]; a sequential
//!    engine walks the topological order one resource at a time
//! 3. flush queued notifications, executing each `(target, action)` once
//! 4. report the final state of every resource in a [`RunReport`]
//!
//! A failed resource only affects its dependents, which are skipped. Fatal
//! errors stop the run: no resource starts and no notification is flushed
//! after one.

mod cancel;
mod dag;
mod types;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub use cancel::Cancellation;
pub use dag::ResourceDag;
pub(crate) use types::PhaseFailure;
pub use types::{ExecuteConfig, ExecutedNotification, ReportedError, ResourceReport, RunReport, RunStatus};

use crate::collab::Collaborators;
use crate::config::Config;
use crate::deploy;
use crate::error::ConvergeError;
use crate::hooks::{HandlerRef, HookRegistry, LifecyclePhase, RunScope};
use crate::notify::{Notification, NotificationQueue};
use crate::resource::{Action, Resource, ResourceId, ResourceKind, ResourceState, ResourceTable};

/// Converges resource tables against one node.
///
/// Cheap to share: the configuration, collaborators and registry are held
/// behind `Arc`s and handed to every task of a run.
#[derive(Debug, Clone)]
pub struct Engine {
  config: Arc<Config>,
  collab: Arc<Collaborators>,
  registry: Arc<HookRegistry>,
  options: ExecuteConfig,
  cancel: Cancellation,
}

impl Engine {
  /// An engine with the default handlers of every built-in kind.
  pub fn new(config: Config, collab: Collaborators) -> Self {
    Self {
      config: Arc::new(config),
      collab: Arc::new(collab),
      registry: Arc::new(HookRegistry::with_defaults()),
      options: ExecuteConfig::default(),
      cancel: Cancellation::new(),
    }
  }

  pub fn with_registry(mut self, registry: HookRegistry) -> Self {
    self.registry = Arc::new(registry);
    self
  }

  pub fn with_options(mut self, options: ExecuteConfig) -> Self {
    self.options = options;
    self
  }

  pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
    self.cancel = cancel;
    self
  }

  /// Override the handler of one `(kind, phase)` pair.
  pub fn register_hook(&mut self, kind: ResourceKind, phase: LifecyclePhase, handler: HandlerRef) -> &mut Self {
    Arc::make_mut(&mut self.registry).register_hook(kind, phase, handler);
    self
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn collaborators(&self) -> &Collaborators {
    &self.collab
  }

  pub fn registry(&self) -> &HookRegistry {
    &self.registry
  }

  /// The token that cancels runs of this engine.
  pub fn cancellation(&self) -> &Cancellation {
    &self.cancel
  }

  /// Finalize `table` and compute its execution waves without running
  /// anything.
  pub fn plan(&self, table: &mut ResourceTable) -> Result<Vec<Vec<ResourceId>>, ConvergeError> {
    table.finalize()?;
    let resources: Vec<Resource> = table.iter().cloned().collect();
    let dag = ResourceDag::from_resources(&resources)?;
    Ok(
      dag
        .waves()
        .into_iter()
        .map(|wave| wave.into_iter().map(|idx| dag.id(idx).clone()).collect())
        .collect(),
    )
  }

  /// Converge every resource of `table`.
  ///
  /// # Errors
  ///
  /// Declaration and graph errors ([`ConvergeError::SchemaViolation`],
  /// [`ConvergeError::UnknownDependency`], [`ConvergeError::CyclicDependency`],
  /// [`ConvergeError::NotificationTargetMissing`] for declared targets) are
  /// returned before any side effect. Everything that happens once the run
  /// started is recorded in the returned [`RunReport`].
  pub async fn converge(&self, mut table: ResourceTable) -> Result<RunReport, ConvergeError> {
    let started = Instant::now();
    table.finalize()?;
    let resources = table.into_resources();
    let dag = ResourceDag::from_resources(&resources)?;

    let order = dag.order();
    let batches = schedule(&dag, &order, self.options.parallelism);
    info!(
      resources = resources.len(),
      batches = batches.len(),
      parallelism = self.options.parallelism,
      "starting convergence"
    );

    let mut run = Run::new(resources, &order);
    let queue = Arc::new(NotificationQueue::new());
    let semaphore = Arc::new(Semaphore::new(self.options.parallelism.max(1)));
    let abort = Cancellation::new();

    for (wave_idx, wave) in batches.iter().enumerate() {
      if run.stopped() {
        break;
      }
      debug!(wave = wave_idx, size = wave.len(), "converging wave");
      self.converge_wave(wave, &dag, &mut run, &queue, &semaphore, &abort).await;
    }

    if !run.stopped() {
      if self.cancel.is_cancelled() {
        run.cancelled = true;
      } else {
        self.flush(&dag, &mut run, &queue).await;
      }
    }

    let report = run.into_report(&order, started);
    info!(
      status = %report.status,
      applied = report.applied_count(),
      failed = report.count(ResourceState::Failed),
      skipped = report.count(ResourceState::Skipped),
      notifications = report.notifications.len(),
      duration_ms = report.duration.as_millis() as u64,
      "convergence finished"
    );
    Ok(report)
  }

  /// Converge one wave. Resources are started in declaration order and
  /// their results merged in topological order.
  ///
  /// A task that gets its permit after a fatal error or a cancellation hands
  /// its resource back without running it.
  async fn converge_wave(
    &self,
    wave: &[usize],
    dag: &ResourceDag,
    run: &mut Run,
    queue: &Arc<NotificationQueue>,
    semaphore: &Arc<Semaphore>,
    abort: &Cancellation,
  ) {
    let mut join_set = JoinSet::new();
    let mut spawned = Vec::new();

    for &idx in wave {
      if self.cancel.is_cancelled() {
        warn!("run cancelled, not starting further resources");
        run.cancelled = true;
        break;
      }

      if let Some(dep) = dag.dependencies(idx).into_iter().find(|d| run.blocked.contains(d)) {
        let reason = format!("dependency {} did not converge", dag.id(dep));
        warn!(resource = %dag.id(idx), reason = %reason, "skipping resource");
        run.skip(idx, reason);
        run.blocked.insert(idx);
        continue;
      }

      let Some(mut resource) = run.slots[idx].take() else {
        continue;
      };
      let order = run.position[idx];
      let config = Arc::clone(&self.config);
      let collab = Arc::clone(&self.collab);
      let registry = Arc::clone(&self.registry);
      let queue = Arc::clone(queue);
      let semaphore = Arc::clone(semaphore);
      let abort = abort.clone();
      let cancel = self.cancel.clone();

      spawned.push(idx);
      join_set.spawn(async move {
        let _permit = semaphore.acquire_owned().await.ok();
        if abort.is_cancelled() {
          return (idx, resource, Outcome::NotStarted { cancelled: false });
        }
        if cancel.is_cancelled() {
          return (idx, resource, Outcome::NotStarted { cancelled: true });
        }
        let scope = RunScope {
          config: config.as_ref(),
          collab: collab.as_ref(),
          registry: registry.as_ref(),
          queue: queue.as_ref(),
          order,
        };
        let outcome = converge_resource(&mut resource, &scope).await;
        if let Err(failure) = &outcome
          && failure.error.is_fatal()
        {
          abort.cancel();
        }
        (idx, resource, Outcome::Finished(outcome))
      });
    }

    let mut results = collect_join_results(join_set).await;
    results.sort_by_key(|(idx, _, _)| run.position[*idx]);

    for (idx, resource, outcome) in results {
      match outcome {
        Outcome::Finished(outcome) => run.record(idx, resource, outcome, queue),
        Outcome::NotStarted { cancelled } => {
          debug!(resource = %resource.id, cancelled, "resource not started");
          if cancelled {
            run.cancelled = true;
          }
          run.slots[idx] = Some(resource);
        }
      }
    }

    for idx in spawned {
      if run.slots[idx].is_none() && !run.lost.contains(&idx) {
        error!(resource = %dag.id(idx), "resource task did not return");
        run.lost.insert(idx);
        run.blocked.insert(idx);
        run.reasons.insert(idx, "handler panicked".to_string());
      }
    }
  }

  /// Execute queued notifications until none are left.
  ///
  /// Each `(target, action)` pair runs at most once per pass. Targets that
  /// failed or were skipped are not acted on.
  async fn flush(&self, dag: &ResourceDag, run: &mut Run, queue: &Arc<NotificationQueue>) {
    let mut executed: HashSet<(ResourceId, Action)> = HashSet::new();

    loop {
      let pending: Vec<Notification> = queue
        .resolve_notifications()
        .into_iter()
        .filter(|n| !executed.contains(&(n.target.clone(), n.action)))
        .collect();
      if pending.is_empty() {
        break;
      }
      info!(count = pending.len(), "flushing notifications");

      if let Some(missing) = pending.iter().find(|n| dag.index_of(&n.target).is_none()) {
        let err = ConvergeError::NotificationTargetMissing {
          source_id: missing.source.clone(),
          target: missing.target.clone(),
        };
        error!(error = %err, "aborting run");
        run.errors.push(ReportedError::new(&err, true));
        run.aborted = true;
        return;
      }

      for notification in pending {
        if self.cancel.is_cancelled() {
          warn!("run cancelled, not flushing further notifications");
          run.cancelled = true;
          return;
        }
        executed.insert((notification.target.clone(), notification.action));

        let Some(idx) = dag.index_of(&notification.target) else {
          continue;
        };
        let Some(mut target) = run.slots[idx].take() else {
          continue;
        };

        if matches!(target.state, ResourceState::Failed | ResourceState::Skipped) {
          debug!(target = %target.id, action = %notification.action, state = %target.state, "target did not converge, notification skipped");
          run.notified(&notification, ResourceState::Skipped);
          run.slots[idx] = Some(target);
          continue;
        }

        info!(
          source = %notification.source,
          target = %notification.target,
          action = %notification.action,
          "executing notification"
        );
        let scope = RunScope {
          config: self.config.as_ref(),
          collab: self.collab.as_ref(),
          registry: self.registry.as_ref(),
          queue: queue.as_ref(),
          order: run.position[idx],
        };
        match apply_action(&mut target, notification.action, &scope).await {
          Ok(changed) => {
            let state = if changed {
              ResourceState::Applied
            } else {
              ResourceState::UpToDate
            };
            if changed {
              target.state = ResourceState::Applied;
              queue_declared(&target, run.position[idx], queue);
            }
            run.notified(&notification, state);
            run.slots[idx] = Some(target);
          }
          Err(failure) => {
            target.state = ResourceState::Failed;
            run.notified(&notification, ResourceState::Failed);
            let fatal = run.fail(idx, &target.id, failure);
            run.slots[idx] = Some(target);
            if fatal {
              return;
            }
          }
        }
      }
    }
  }
}

/// Mutable bookkeeping of one pass.
struct Run {
  slots: Vec<Option<Resource>>,
  ids: Vec<ResourceId>,
  actions: Vec<Action>,
  /// Topological position of each declaration index.
  position: Vec<usize>,
  /// Resources whose dependents must be skipped.
  blocked: HashSet<usize>,
  /// Resources whose task never returned.
  lost: HashSet<usize>,
  reasons: HashMap<usize, String>,
  errors: Vec<ReportedError>,
  notifications: Vec<ExecutedNotification>,
  aborted: bool,
  cancelled: bool,
}

impl Run {
  fn new(resources: Vec<Resource>, order: &[usize]) -> Self {
    let mut position = vec![0; resources.len()];
    for (pos, &idx) in order.iter().enumerate() {
      position[idx] = pos;
    }
    Self {
      ids: resources.iter().map(|r| r.id.clone()).collect(),
      actions: resources.iter().map(|r| r.action).collect(),
      slots: resources.into_iter().map(Some).collect(),
      position,
      blocked: HashSet::new(),
      lost: HashSet::new(),
      reasons: HashMap::new(),
      errors: Vec::new(),
      notifications: Vec::new(),
      aborted: false,
      cancelled: false,
    }
  }

  fn stopped(&self) -> bool {
    self.aborted || self.cancelled
  }

  fn skip(&mut self, idx: usize, reason: String) {
    if let Some(resource) = self.slots[idx].as_mut() {
      resource.state = ResourceState::Skipped;
      for sub in &mut resource.subs {
        sub.state = ResourceState::Skipped;
      }
    }
    self.reasons.insert(idx, reason);
  }

  /// Record the outcome of a resource's phase sequence.
  fn record(&mut self, idx: usize, resource: Resource, outcome: Result<(), PhaseFailure>, queue: &NotificationQueue) {
    match outcome {
      Ok(()) => {
        match resource.state {
          ResourceState::Skipped => {
            self.reasons.insert(idx, "only_if guard is false".to_string());
          }
          ResourceState::Applied => {
            queue_declared(&resource, self.position[idx], queue);
          }
          _ => {}
        }
        info!(resource = %resource.id, state = %resource.state, "resource converged");
      }
      Err(failure) => {
        self.fail(idx, &resource.id, failure);
      }
    }
    self.slots[idx] = Some(resource);
  }

  /// Record a handler failure. Returns whether it aborted the run.
  fn fail(&mut self, idx: usize, id: &ResourceId, failure: PhaseFailure) -> bool {
    let fatal = failure.error.is_fatal();
    let err = ConvergeError::from_handler(id, failure.phase, failure.error);
    error!(resource = %id, error = %err, fatal, "resource failed");

    self.reasons.insert(idx, err.to_string());
    self.errors.push(ReportedError::new(&err, fatal).attributed_to(id));
    self.blocked.insert(idx);
    if fatal {
      self.aborted = true;
    }
    fatal
  }

  fn notified(&mut self, notification: &Notification, state: ResourceState) {
    self.notifications.push(ExecutedNotification {
      source: notification.source.clone(),
      target: notification.target.clone(),
      action: notification.action,
      state,
    });
  }

  fn into_report(mut self, order: &[usize], started: Instant) -> RunReport {
    let leftover = if self.aborted {
      Some("run aborted")
    } else if self.cancelled {
      Some("run cancelled")
    } else {
      None
    };
    if let Some(reason) = leftover {
      for idx in 0..self.slots.len() {
        let pending = self.slots[idx].as_ref().is_some_and(|r| !r.state.is_terminal());
        if pending {
          self.skip(idx, reason.to_string());
        }
      }
    }

    let resources: Vec<ResourceReport> = order
      .iter()
      .map(|&idx| {
        let reason = self.reasons.get(&idx).cloned();
        match &self.slots[idx] {
          Some(resource) => ResourceReport::from_resource(resource, reason),
          None => ResourceReport {
            id: self.ids[idx].clone(),
            action: self.actions[idx],
            state: ResourceState::Failed,
            reason,
            revision: None,
            release_path: None,
            sub_resources: Vec::new(),
          },
        }
      })
      .collect();

    let any_failed = !self.lost.is_empty() || resources.iter().any(|r| r.state == ResourceState::Failed);
    let status = if self.aborted {
      RunStatus::Aborted
    } else if self.cancelled {
      RunStatus::Cancelled
    } else if any_failed || !self.errors.is_empty() {
      RunStatus::Failed
    } else {
      RunStatus::Success
    };

    RunReport {
      status,
      resources,
      errors: self.errors,
      notifications: self.notifications,
      duration: started.elapsed(),
    }
  }
}

/// Queue the declared `notifies` of an applied resource and of its applied
/// sub-resources.
fn queue_declared(resource: &Resource, order: usize, queue: &NotificationQueue) {
  let sources = std::iter::once(resource).chain(resource.subs.iter());
  for source in sources.filter(|r| r.state == ResourceState::Applied) {
    for decl in &source.notifies {
      queue.notify(order, source.id.clone(), decl.target.clone(), decl.action);
    }
  }
}

/// Evaluate a resource's guard and run its phase sequence, leaving it in a
/// terminal state.
pub(crate) async fn converge_resource(resource: &mut Resource, scope: &RunScope<'_>) -> Result<(), PhaseFailure> {
  if let Some(guard) = &resource.only_if
    && !guard.eval(scope.config)
  {
    debug!(resource = %resource.id, "only_if guard is false, skipping");
    resource.state = ResourceState::Skipped;
    for sub in &mut resource.subs {
      sub.state = ResourceState::Skipped;
    }
    return Ok(());
  }

  resource.state = ResourceState::Evaluating;
  let result = if resource.kind().is_composite() && resource.action == Action::Nothing {
    for sub in &mut resource.subs {
      sub.state = ResourceState::UpToDate;
    }
    Ok(false)
  } else {
    run_resource(resource, scope).await
  };

  match result {
    Ok(changed) => {
      resource.state = if changed {
        ResourceState::Applied
      } else {
        ResourceState::UpToDate
      };
      Ok(())
    }
    Err(failure) => {
      resource.state = ResourceState::Failed;
      Err(failure)
    }
  }
}

/// Run `action` on a resource regardless of its declared action, as done for
/// notifications.
async fn apply_action(resource: &mut Resource, action: Action, scope: &RunScope<'_>) -> Result<bool, PhaseFailure> {
  let declared = std::mem::replace(&mut resource.action, action);
  let result = run_resource(resource, scope).await;
  resource.action = declared;
  result
}

/// Run every phase of one resource. Composites are handed to the
/// deployment orchestrator.
async fn run_resource(resource: &mut Resource, scope: &RunScope<'_>) -> Result<bool, PhaseFailure> {
  if resource.kind().is_composite() {
    return deploy::drive(resource, scope).await;
  }

  let mut changed = false;
  for phase in LifecyclePhase::ALL {
    let Some(handler) = scope.registry.handler(resource.kind(), phase).cloned() else {
      continue;
    };
    debug!(resource = %resource.id, %phase, "running phase");
    let ctx = scope.context(phase, &resource.id, None);
    match handler.run(resource, &ctx).await {
      Ok(true) => {
        resource.state = ResourceState::Applying;
        changed = true;
      }
      Ok(false) => {}
      Err(error) => {
        return Err(PhaseFailure {
          phase: Some(phase),
          error,
        });
      }
    }
  }
  Ok(changed)
}

/// What became of a spawned resource task.
enum Outcome {
  Finished(Result<(), PhaseFailure>),
  /// The run was aborted or cancelled before the task got to run.
  NotStarted { cancelled: bool },
}

type TaskOutput = (usize, Resource, Outcome);

/// The batches resources are started in.
///
/// A sequential engine walks the topological order one resource at a time,
/// so execution, report and notification order all agree. Otherwise
/// resources run in Kahn waves and results are merged back by topological
/// position.
fn schedule(dag: &ResourceDag, order: &[usize], parallelism: usize) -> Vec<Vec<usize>> {
  if parallelism <= 1 {
    order.iter().map(|&idx| vec![idx]).collect()
  } else {
    dag.waves()
  }
}

/// Collect results from a JoinSet of resource tasks.
async fn collect_join_results(mut join_set: JoinSet<TaskOutput>) -> Vec<TaskOutput> {
  let mut results = Vec::new();
  while let Some(joined) = join_set.join_next().await {
    match joined {
      Ok(output) => results.push(output),
      Err(e) => {
        error!(error = %e, "resource task panicked");
      }
    }
  }
  results
}

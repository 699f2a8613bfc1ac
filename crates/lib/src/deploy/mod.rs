//! Composite deployment orchestrator.
//!
//! An `application` resource owns an ordered list of sub-resources
//! (`django`, `gunicorn`, `celery`). Its phases run phase-major: in each
//! [`LifecyclePhase`] the application's own step runs first, then every
//! active sub-resource in [`CompositePlan`] order, before the next phase
//! begins.
//!
//! The plan is computed once when the resource table is finalized. It fixes
//! the sub-resource order (declaration order, or a stable topological order
//! when a sub-resource depends on a later sibling), the sibling index used by
//! [`DeploymentScope::find_sibling`], and the siblings each sub-resource
//! requires.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ConvergeError, HandlerError};
use crate::execute::{Engine, PhaseFailure, RunReport};
use crate::hooks::{HandlerRef, LifecyclePhase, RunScope, builtin};
use crate::resource::{Attributes, Guard, Resource, ResourceId, ResourceKind, ResourceState, ResourceTable};

/// Sub-resource ordering and sibling lookups of one application.
#[derive(Debug, Clone, Default)]
pub struct CompositePlan {
  /// Sub-resource indices in execution order.
  pub order: Vec<usize>,
  /// First sub-resource of each kind.
  pub siblings: BTreeMap<ResourceKind, usize>,
  /// `(sub-resource index, kind)` pairs that must resolve to a sibling.
  pub required: Vec<(usize, ResourceKind)>,
  /// Dependencies of sub-resources on top-level resources, hoisted to the
  /// application.
  pub external_deps: Vec<ResourceId>,
}

impl CompositePlan {
  /// Build the plan of `app`.
  ///
  /// # Errors
  ///
  /// [`ConvergeError::CyclicDependency`] when sub-resources depend on each
  /// other in a cycle.
  pub fn build(app: &Resource) -> Result<Self, ConvergeError> {
    let subs = &app.subs;
    let positions: BTreeMap<&ResourceId, usize> = subs.iter().enumerate().map(|(i, s)| (&s.id, i)).collect();

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); subs.len()];
    let mut in_degree = vec![0usize; subs.len()];
    let mut external_deps = Vec::new();

    for (i, sub) in subs.iter().enumerate() {
      for dep in &sub.depends_on {
        match positions.get(dep) {
          Some(&j) if j != i => {
            dependents[j].push(i);
            in_degree[i] += 1;
          }
          Some(_) => {}
          None => {
            if !external_deps.contains(dep) {
              external_deps.push(dep.clone());
            }
          }
        }
      }
    }

    let mut ready: BTreeSet<usize> = (0..subs.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(subs.len());
    while let Some(next) = ready.pop_first() {
      order.push(next);
      for &dependent in &dependents[next] {
        in_degree[dependent] -= 1;
        if in_degree[dependent] == 0 {
          ready.insert(dependent);
        }
      }
    }

    if order.len() < subs.len() {
      let members = (0..subs.len())
        .filter(|i| in_degree[*i] > 0)
        .map(|i| subs[i].id.clone())
        .collect();
      return Err(ConvergeError::CyclicDependency(members));
    }

    let mut siblings = BTreeMap::new();
    for (i, sub) in subs.iter().enumerate() {
      siblings.entry(sub.kind()).or_insert(i);
    }

    let required = subs
      .iter()
      .enumerate()
      .filter_map(|(i, sub)| required_sibling(sub).map(|kind| (i, kind)))
      .collect();

    Ok(Self {
      order,
      siblings,
      required,
      external_deps,
    })
  }

  pub fn sibling_index(&self, kind: ResourceKind) -> Option<usize> {
    self.siblings.get(&kind).copied()
  }
}

/// The sibling a sub-resource cannot run without.
fn required_sibling(sub: &Resource) -> Option<ResourceKind> {
  match sub.kind() {
    ResourceKind::Gunicorn if sub.attrs.str("app_module") == Some("django") => Some(ResourceKind::Django),
    ResourceKind::Celery if sub.attrs.flag("django") => Some(ResourceKind::Django),
    _ => None,
  }
}

/// Mutable state shared by the steps of one deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentState {
  /// `<path>/releases/<sha>` once the source was fetched.
  pub release_path: Option<PathBuf>,
  pub revision: Option<String>,
  /// Whether `current` moved to a different release in this pass.
  pub new_release: bool,
  /// Whether any step changed the host.
  pub changed: bool,
  /// Shared files linked into the release before migrating: shared name to
  /// release-relative path.
  pub symlink_before_migrate: BTreeMap<String, String>,
  /// Shared paths linked into the release before restarting.
  pub symlinks: BTreeMap<String, String>,
}

impl DeploymentState {
  fn from_attrs(attrs: &Attributes) -> Self {
    Self {
      symlink_before_migrate: attrs.string_map("symlink_before_migrate"),
      symlinks: attrs.string_map("symlinks"),
      ..Default::default()
    }
  }
}

/// Application attributes every step reads.
#[derive(Debug, Clone)]
pub struct AppInfo {
  pub id: ResourceId,
  pub name: String,
  pub path: PathBuf,
  pub owner: Option<String>,
  pub group: Option<String>,
  pub repository: String,
  pub revision: String,
  pub migrate: bool,
  pub environment: BTreeMap<String, String>,
}

impl AppInfo {
  fn from_resource(app: &Resource) -> Self {
    Self {
      id: app.id.clone(),
      name: app.name().to_string(),
      path: PathBuf::from(app.attrs.str("path").unwrap_or_default()),
      owner: app.owner().map(str::to_string),
      group: app.group().map(str::to_string),
      repository: app.attrs.str("repository").unwrap_or_default().to_string(),
      revision: app.attrs.str("revision").unwrap_or("master").to_string(),
      migrate: app.attrs.flag("migrate"),
      environment: app.attrs.string_map("environment"),
    }
  }

  /// `<path>/shared/<relative>`.
  pub fn shared_path(&self, relative: impl AsRef<Path>) -> PathBuf {
    self.path.join("shared").join(relative)
  }

  pub fn current_path(&self) -> PathBuf {
    self.path.join("current")
  }
}

/// A handler's view of the deployment it runs in.
pub struct DeploymentScope<'a> {
  app: &'a AppInfo,
  state: &'a Mutex<DeploymentState>,
  plan: &'a CompositePlan,
  before: &'a [Resource],
  after: &'a [Resource],
  current: Option<usize>,
}

impl<'a> DeploymentScope<'a> {
  pub fn app(&self) -> &'a AppInfo {
    self.app
  }

  /// Read or update the shared deployment state.
  ///
  /// The lock is released before the closure returns, so callers never hold
  /// it across an `.await`.
  pub fn with_state<R>(&self, f: impl FnOnce(&mut DeploymentState) -> R) -> R {
    f(&mut lock(self.state))
  }

  pub fn release_path(&self) -> Option<PathBuf> {
    self.with_state(|state| state.release_path.clone())
  }

  pub fn new_release(&self) -> bool {
    self.with_state(|state| state.new_release)
  }

  /// The first sub-resource of `kind`, `None` when absent or when it is the
  /// resource currently running.
  pub fn find_sibling(&self, kind: ResourceKind) -> Option<&'a Resource> {
    let idx = self.plan.sibling_index(kind)?;
    match self.current {
      None => self.before.get(idx),
      Some(current) if idx < current => self.before.get(idx),
      Some(current) if idx > current => self.after.get(idx - current - 1),
      Some(_) => None,
    }
  }

  /// Like [`find_sibling`](Self::find_sibling), failing with
  /// [`HandlerError::MissingCollaborator`].
  pub fn require_sibling(&self, kind: ResourceKind) -> Result<&'a Resource, HandlerError> {
    self.find_sibling(kind).ok_or_else(|| HandlerError::MissingCollaborator {
      application: self.app.name.clone(),
      kind,
    })
  }

  /// Every sub-resource other than the running one, in declaration order.
  pub fn siblings(&self) -> impl Iterator<Item = &'a Resource> + 'a {
    self.before.iter().chain(self.after.iter())
  }
}

fn lock(state: &Mutex<DeploymentState>) -> MutexGuard<'_, DeploymentState> {
  state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Run every phase of a composite application.
///
/// Returns whether anything changed. On failure the application's remaining
/// phases are aborted and the error names the failing sub-resource.
pub(crate) async fn drive(app: &mut Resource, scope: &RunScope<'_>) -> Result<bool, PhaseFailure> {
  let plan = match app.composite.take() {
    Some(plan) => plan,
    None => CompositePlan::build(app).map_err(|e| PhaseFailure {
      phase: None,
      error: HandlerError::invalid(e.to_string()),
    })?,
  };
  let info = AppInfo::from_resource(app);
  let state = Mutex::new(DeploymentState::from_attrs(&app.attrs));
  let mut subs = std::mem::take(&mut app.subs);

  let result = run_phases(app, &mut subs, &plan, &info, &state, scope).await;

  app.subs = subs;
  app.composite = Some(plan);
  app.deployment = Some(state.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner()));
  result
}

async fn run_phases(
  app: &mut Resource,
  subs: &mut [Resource],
  plan: &CompositePlan,
  info: &AppInfo,
  state: &Mutex<DeploymentState>,
  scope: &RunScope<'_>,
) -> Result<bool, PhaseFailure> {
  let active: Vec<bool> = subs
    .iter()
    .map(|sub| sub.only_if.as_ref().is_none_or(|guard| guard.eval(scope.config)))
    .collect();
  for (sub, &is_active) in subs.iter_mut().zip(&active) {
    if is_active {
      sub.state = ResourceState::Evaluating;
    } else {
      debug!(resource = %sub.id, "only_if guard is false, skipping");
      sub.state = ResourceState::Skipped;
    }
  }

  for &(i, kind) in &plan.required {
    if active[i] && plan.sibling_index(kind).is_none() {
      settle(subs, &active, &[], false, None);
      return Err(PhaseFailure {
        phase: None,
        error: HandlerError::MissingCollaborator {
          application: info.name.clone(),
          kind,
        },
      });
    }
  }

  let mut app_changed = false;
  let mut sub_changed = vec![false; subs.len()];

  for phase in LifecyclePhase::ALL {
    if let Some(handler) = scope.registry.handler(app.kind(), phase).cloned() {
      debug!(resource = %app.id, %phase, "running phase");
      let deployment = DeploymentScope {
        app: info,
        state,
        plan,
        before: &*subs,
        after: &[],
        current: None,
      };
      let ctx = scope.context(phase, &app.id, Some(deployment));
      match handler.run(app, &ctx).await {
        Ok(changed) => app_changed |= changed,
        Err(error) => {
          settle(subs, &active, &sub_changed, false, None);
          return Err(PhaseFailure {
            phase: Some(phase),
            error,
          });
        }
      }
    }

    if phase == LifecyclePhase::AfterRestart {
      let changed = app_changed || sub_changed.iter().any(|c| *c);
      lock(state).changed = changed;
      if changed {
        for &i in &plan.order {
          if !active[i] {
            continue;
          }
          let handler: HandlerRef = subs[i].restart.clone().unwrap_or_else(builtin::default_restart);
          if let Err(error) = run_sub(handler, subs, i, phase, plan, info, state, scope).await {
            settle(subs, &active, &sub_changed, false, Some(i));
            return Err(sub_failure(&subs[i].id, phase, error));
          }
        }
      } else {
        debug!(resource = %app.id, "nothing changed, restarts not triggered");
      }
    }

    for &i in &plan.order {
      if !active[i] {
        continue;
      }
      let Some(handler) = scope.registry.handler(subs[i].kind(), phase).cloned() else {
        continue;
      };
      debug!(resource = %subs[i].id, %phase, "running phase");
      match run_sub(handler, subs, i, phase, plan, info, state, scope).await {
        Ok(changed) => sub_changed[i] |= changed,
        Err(error) => {
          settle(subs, &active, &sub_changed, false, Some(i));
          return Err(sub_failure(&subs[i].id, phase, error));
        }
      }
    }
  }

  settle(subs, &active, &sub_changed, true, None);
  for sub in subs.iter() {
    debug!(resource = %sub.id, state = %sub.state, "sub-resource converged");
  }
  Ok(app_changed || sub_changed.iter().any(|c| *c))
}

#[allow(clippy::too_many_arguments)]
async fn run_sub(
  handler: HandlerRef,
  subs: &mut [Resource],
  index: usize,
  phase: LifecyclePhase,
  plan: &CompositePlan,
  info: &AppInfo,
  state: &Mutex<DeploymentState>,
  scope: &RunScope<'_>,
) -> Result<bool, HandlerError> {
  let (before, rest) = subs.split_at_mut(index);
  let Some((current, after)) = rest.split_first_mut() else {
    return Ok(false);
  };
  current.state = ResourceState::Applying;
  let deployment = DeploymentScope {
    app: info,
    state,
    plan,
    before,
    after,
    current: Some(index),
  };
  let ctx = scope.context(phase, &current.id, Some(deployment));
  handler.run(current, &ctx).await
}

fn sub_failure(sub: &ResourceId, phase: LifecyclePhase, error: HandlerError) -> PhaseFailure {
  PhaseFailure {
    phase: Some(phase),
    error: HandlerError::SubResource {
      resource: sub.clone(),
      source: Box::new(error),
    },
  }
}

/// Assign final states to sub-resources. When the deployment did not
/// complete, active sub-resources are `Skipped` unless they already changed
/// something.
fn settle(subs: &mut [Resource], active: &[bool], changed: &[bool], completed: bool, failed: Option<usize>) {
  for (i, sub) in subs.iter_mut().enumerate() {
    if !active[i] {
      continue;
    }
    sub.state = if failed == Some(i) {
      ResourceState::Failed
    } else if changed.get(i).copied().unwrap_or(false) {
      ResourceState::Applied
    } else if completed {
      ResourceState::UpToDate
    } else {
      ResourceState::Skipped
    };
  }
}

/// A git repository and revision to deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRef {
  pub url: String,
  #[serde(default = "default_revision")]
  pub revision: String,
}

fn default_revision() -> String {
  "master".to_string()
}

impl RepositoryRef {
  pub fn new(url: impl Into<String>, revision: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      revision: revision.into(),
    }
  }
}

/// A sub-resource handed to [`deploy`].
#[derive(Debug, Clone)]
pub struct SubResourceDecl {
  pub kind: ResourceKind,
  pub attrs: Attributes,
  pub only_if: Option<Guard>,
  pub restart: Option<HandlerRef>,
}

impl SubResourceDecl {
  pub fn new(kind: ResourceKind, attrs: Attributes) -> Self {
    Self {
      kind,
      attrs,
      only_if: None,
      restart: None,
    }
  }

  pub fn only_if(mut self, guard: Guard) -> Self {
    self.only_if = Some(guard);
    self
  }

  pub fn with_restart(mut self, handler: HandlerRef) -> Self {
    self.restart = Some(handler);
    self
  }
}

/// Outcome of [`deploy`].
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentResult {
  pub application: ResourceId,
  pub state: ResourceState,
  /// The commit checked out, when the source was fetched.
  pub revision: Option<String>,
  pub release_path: Option<PathBuf>,
  pub sub_resources: Vec<(ResourceId, ResourceState)>,
  /// Report of the whole pass, including flushed notifications.
  pub report: RunReport,
}

impl DeploymentResult {
  pub fn is_success(&self) -> bool {
    self.report.is_success()
  }
}

/// Deploy `repository` as application `app_name` with default application
/// attributes.
pub async fn deploy(
  engine: &Engine,
  app_name: &str,
  repository: RepositoryRef,
  sub_resources: Vec<SubResourceDecl>,
) -> Result<DeploymentResult, ConvergeError> {
  let attrs = Attributes::new()
    .with("repository", repository.url)
    .with("revision", repository.revision);
  deploy_with(engine, app_name, attrs, sub_resources).await
}

/// Deploy an application with explicit attributes.
///
/// Builds a one-application run, converges it, and flushes the
/// notifications its sub-resources queued.
pub async fn deploy_with(
  engine: &Engine,
  app_name: &str,
  attrs: Attributes,
  sub_resources: Vec<SubResourceDecl>,
) -> Result<DeploymentResult, ConvergeError> {
  let mut table = ResourceTable::new();
  let app = table.declare(ResourceKind::Application, app_name, attrs)?;
  for decl in sub_resources {
    let handle = table.declare_sub(app, decl.kind, decl.attrs)?;
    let sub = table.sub_mut(handle);
    sub.only_if = decl.only_if;
    sub.restart = decl.restart;
  }
  let id = table.get(app).id.clone();

  info!(application = %id, "deploying");
  let report = engine.converge(table).await?;

  let Some(entry) = report.resource(&id) else {
    warn!(application = %id, "application missing from run report");
    return Ok(DeploymentResult {
      application: id,
      state: ResourceState::Pending,
      revision: None,
      release_path: None,
      sub_resources: Vec::new(),
      report,
    });
  };

  Ok(DeploymentResult {
    application: id.clone(),
    state: entry.state,
    revision: entry.revision.clone(),
    release_path: entry.release_path.clone(),
    sub_resources: entry.sub_resources.iter().map(|s| (s.id.clone(), s.state)).collect(),
    report,
  })
}

//! Lifecycle hook registry.
//!
//! Every resource passes through the same six [`LifecyclePhase`]s. For each
//! `(kind, phase)` pair the [`HookRegistry`] holds at most one
//! [`PhaseHandler`]; an unregistered pair is a no-op. Default handlers for all
//! built-in kinds live in [`builtin`], and callers can replace any single
//! phase with [`HookRegistry::register_hook`] without touching the others.

pub mod builtin;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::collab::{CollabError, Collaborators};
use crate::config::Config;
use crate::deploy::DeploymentScope;
use crate::error::HandlerError;
use crate::notify::{Notification, NotificationQueue};
use crate::resource::{Action, Resource, ResourceId, ResourceKind};

/// The ordered lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
  BeforeCompile,
  BeforeDeploy,
  BeforeMigrate,
  BeforeSymlink,
  BeforeRestart,
  AfterRestart,
}

impl LifecyclePhase {
  /// All phases in execution order.
  pub const ALL: [LifecyclePhase; 6] = [
    LifecyclePhase::BeforeCompile,
    LifecyclePhase::BeforeDeploy,
    LifecyclePhase::BeforeMigrate,
    LifecyclePhase::BeforeSymlink,
    LifecyclePhase::BeforeRestart,
    LifecyclePhase::AfterRestart,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      LifecyclePhase::BeforeCompile => "before_compile",
      LifecyclePhase::BeforeDeploy => "before_deploy",
      LifecyclePhase::BeforeMigrate => "before_migrate",
      LifecyclePhase::BeforeSymlink => "before_symlink",
      LifecyclePhase::BeforeRestart => "before_restart",
      LifecyclePhase::AfterRestart => "after_restart",
    }
  }
}

impl fmt::Display for LifecyclePhase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for LifecyclePhase {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    LifecyclePhase::ALL
      .into_iter()
      .find(|phase| phase.as_str() == s)
      .ok_or_else(|| format!("unknown lifecycle phase `{s}`"))
  }
}

/// Converges one phase of one resource.
///
/// Returns whether the handler changed anything on the host.
#[async_trait]
pub trait PhaseHandler: Send + Sync {
  async fn run(&self, resource: &mut Resource, ctx: &HookContext<'_>) -> Result<bool, HandlerError>;
}

/// Shared handle to a handler.
pub type HandlerRef = Arc<dyn PhaseHandler>;

impl fmt::Debug for dyn PhaseHandler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("PhaseHandler(..)")
  }
}

/// Future returned by closure handlers.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<bool, HandlerError>> + Send + 'a>>;

struct FnHandler<F>(F);

#[async_trait]
impl<F> PhaseHandler for FnHandler<F>
where
  F: for<'a> Fn(&'a mut Resource, &'a HookContext<'a>) -> HandlerFuture<'a> + Send + Sync,
{
  async fn run(&self, resource: &mut Resource, ctx: &HookContext<'_>) -> Result<bool, HandlerError> {
    (self.0)(resource, ctx).await
  }
}

/// Wrap a closure as a handler.
///
/// ```
/// use convoy_lib::hooks::handler_fn;
///
/// let noop = handler_fn(|_resource, _ctx| Box::pin(async { Ok(false) }));
/// # let _ = noop;
/// ```
pub fn handler_fn<F>(f: F) -> HandlerRef
where
  F: for<'a> Fn(&'a mut Resource, &'a HookContext<'a>) -> HandlerFuture<'a> + Send + Sync + 'static,
{
  Arc::new(FnHandler(f))
}

/// Handlers keyed by `(kind, phase)`.
#[derive(Clone, Default)]
pub struct HookRegistry {
  handlers: HashMap<(ResourceKind, LifecyclePhase), HandlerRef>,
}

impl HookRegistry {
  /// A registry with no handlers at all.
  pub fn empty() -> Self {
    Self::default()
  }

  /// A registry with the default handler of every built-in kind.
  pub fn with_defaults() -> Self {
    let mut registry = Self::empty();
    builtin::register_defaults(&mut registry);
    registry
  }

  /// Register `handler` for `(kind, phase)`, replacing any previous one.
  pub fn register_hook(&mut self, kind: ResourceKind, phase: LifecyclePhase, handler: HandlerRef) -> &mut Self {
    trace!(%kind, %phase, "registered hook");
    self.handlers.insert((kind, phase), handler);
    self
  }

  pub fn handler(&self, kind: ResourceKind, phase: LifecyclePhase) -> Option<&HandlerRef> {
    self.handlers.get(&(kind, phase))
  }

  pub fn len(&self) -> usize {
    self.handlers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.handlers.is_empty()
  }
}

impl fmt::Debug for HookRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut keys: Vec<_> = self.handlers.keys().map(|(k, p)| format!("{k}:{p}")).collect();
    keys.sort();
    f.debug_struct("HookRegistry").field("handlers", &keys).finish()
  }
}

/// Run-wide state shared by every handler of one resource.
pub(crate) struct RunScope<'a> {
  pub config: &'a Config,
  pub collab: &'a Collaborators,
  pub registry: &'a HookRegistry,
  pub queue: &'a NotificationQueue,
  /// Topological position of the resource being converged.
  pub order: usize,
}

impl<'a> RunScope<'a> {
  pub fn context<'b>(
    &'b self,
    phase: LifecyclePhase,
    source: &ResourceId,
    deployment: Option<DeploymentScope<'b>>,
  ) -> HookContext<'b>
  where
    'a: 'b,
  {
    HookContext {
      config: self.config,
      collab: self.collab,
      phase,
      queue: self.queue,
      source: source.clone(),
      order: self.order,
      deployment,
    }
  }
}

/// What a handler sees while it runs.
pub struct HookContext<'a> {
  pub config: &'a Config,
  pub collab: &'a Collaborators,
  pub phase: LifecyclePhase,
  queue: &'a NotificationQueue,
  source: ResourceId,
  order: usize,
  deployment: Option<DeploymentScope<'a>>,
}

impl<'a> HookContext<'a> {
  /// The resource notifications are attributed to.
  pub fn source(&self) -> &ResourceId {
    &self.source
  }

  /// Queue `action` on `target`, flushed once every resource has converged.
  pub fn notify(&self, target: ResourceId, action: Action) {
    trace!(source = %self.source, %target, %action, "queued notification");
    self.queue.push(
      self.order,
      Notification {
        source: self.source.clone(),
        target,
        action,
      },
    );
  }

  /// The enclosing deployment, for composite and sub-resource handlers.
  pub fn deployment(&self) -> Result<&DeploymentScope<'a>, HandlerError> {
    self
      .deployment
      .as_ref()
      .ok_or_else(|| HandlerError::invalid(format!("{} must run inside an application", self.source)))
  }

  /// Resolve a role to an address. A role nobody carries is
  /// [`HandlerError::UnresolvedRole`].
  pub async fn resolve_role(&self, role: &str) -> Result<String, HandlerError> {
    match self.collab.roles.resolve_role(role).await {
      Ok(address) => Ok(address),
      Err(CollabError::RoleNotFound(role)) => Err(HandlerError::UnresolvedRole(role)),
      Err(e) => Err(e.into()),
    }
  }

  /// A value from the secrets bag.
  pub fn secret(&self, key: &str) -> Option<String> {
    self.collab.secrets.get(key).ok()
  }
}

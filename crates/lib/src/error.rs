//! Error types shared by the declaration model, the hook handlers and the
//! convergence engine.
//!
//! Errors fall into two groups:
//!
//! - [`ConvergeError`]: run-level errors. Declaration and graph errors are
//!   raised before any side effect; the rest are fatal mid-run conditions.
//! - [`HandlerError`]: errors returned by a single phase handler. Most are
//!   isolated to the owning resource; [`HandlerError::is_fatal`] marks the
//!   ones that abort the whole run.

use thiserror::Error;

use crate::collab::CollabError;
use crate::hooks::LifecyclePhase;
use crate::placeholder::PlaceholderError;
use crate::resource::{ResourceId, ResourceKind};

/// Run-level errors.
#[derive(Debug, Error)]
pub enum ConvergeError {
  /// An attribute failed validation against its kind's schema.
  #[error("{resource}: invalid value {value} for `{field}`: {reason}")]
  SchemaViolation {
    resource: ResourceId,
    field: String,
    value: String,
    reason: String,
  },

  /// The same `(kind, name)` pair was declared twice.
  #[error("resource {0} declared more than once")]
  DuplicateResource(ResourceId),

  /// A `depends_on` edge references an undeclared resource.
  #[error("{resource} depends on undeclared resource {dependency}")]
  UnknownDependency {
    resource: ResourceId,
    dependency: ResourceId,
  },

  /// The dependency graph contains a cycle. Lists the resources on it.
  #[error("dependency cycle detected between: {}", join_ids(.0))]
  CyclicDependency(Vec<ResourceId>),

  /// A composite deployment requires a sibling sub-resource that is absent.
  #[error("application `{application}` has no {kind} sub-resource")]
  MissingCollaborator { application: String, kind: ResourceKind },

  /// A role lookup did not resolve to an address.
  #[error("{resource}: role `{role}` did not resolve to an address")]
  UnresolvedRole { resource: ResourceId, role: String },

  /// A handler failed while converging a resource.
  #[error("{resource} failed{}: {source}", phase_suffix(.phase))]
  HandlerExecution {
    resource: ResourceId,
    phase: Option<LifecyclePhase>,
    #[source]
    source: HandlerError,
  },

  /// A queued notification references a resource that is not in the run.
  #[error("{source_id} notified undeclared resource {target}")]
  NotificationTargetMissing { source_id: ResourceId, target: ResourceId },
}

impl ConvergeError {
  /// Short machine-readable tag used in run reports.
  pub fn kind(&self) -> &'static str {
    match self {
      ConvergeError::SchemaViolation { .. } => "schema_violation",
      ConvergeError::DuplicateResource(_) => "duplicate_resource",
      ConvergeError::UnknownDependency { .. } => "unknown_dependency",
      ConvergeError::CyclicDependency(_) => "cyclic_dependency",
      ConvergeError::MissingCollaborator { .. } => "missing_collaborator",
      ConvergeError::UnresolvedRole { .. } => "unresolved_role",
      ConvergeError::HandlerExecution { .. } => "handler_execution",
      ConvergeError::NotificationTargetMissing { .. } => "notification_target_missing",
    }
  }

  /// Wrap a handler error raised while converging `resource`.
  ///
  /// Errors that already carry run-level meaning are lifted to their own
  /// variant instead of being nested.
  pub fn from_handler(resource: &ResourceId, phase: Option<LifecyclePhase>, err: HandlerError) -> Self {
    match err {
      HandlerError::UnresolvedRole(role) => ConvergeError::UnresolvedRole {
        resource: resource.clone(),
        role,
      },
      HandlerError::MissingCollaborator { application, kind } => {
        ConvergeError::MissingCollaborator { application, kind }
      }
      HandlerError::SubResource { resource: sub, source } => match *source {
        HandlerError::UnresolvedRole(role) => ConvergeError::UnresolvedRole { resource: sub, role },
        HandlerError::MissingCollaborator { application, kind } => {
          ConvergeError::MissingCollaborator { application, kind }
        }
        other => ConvergeError::HandlerExecution {
          resource: resource.clone(),
          phase,
          source: HandlerError::SubResource {
            resource: sub,
            source: Box::new(other),
          },
        },
      },
      other => ConvergeError::HandlerExecution {
        resource: resource.clone(),
        phase,
        source: other,
      },
    }
  }
}

/// Errors returned by phase handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
  /// An external collaborator failed (package install, command, template...).
  #[error(transparent)]
  Collab(#[from] CollabError),

  /// A role lookup returned nothing.
  #[error("role `{0}` did not resolve to an address")]
  UnresolvedRole(String),

  /// A required sibling sub-resource is absent.
  #[error("no {kind} sub-resource found in application `{application}`")]
  MissingCollaborator { application: String, kind: ResourceKind },

  /// The resource's attributes do not allow the requested work.
  #[error("{0}")]
  Invalid(String),

  /// Placeholder substitution failed.
  #[error("placeholder error: {0}")]
  Placeholder(#[from] PlaceholderError),

  /// A sub-resource of a composite deployment failed.
  #[error("{resource}: {source}")]
  SubResource {
    resource: ResourceId,
    #[source]
    source: Box<HandlerError>,
  },
}

impl HandlerError {
  /// Whether this error aborts the entire run rather than only its resource.
  pub fn is_fatal(&self) -> bool {
    match self {
      HandlerError::UnresolvedRole(_) => true,
      HandlerError::SubResource { source, .. } => source.is_fatal(),
      _ => false,
    }
  }

  pub(crate) fn invalid(message: impl Into<String>) -> Self {
    HandlerError::Invalid(message.into())
  }
}

fn join_ids(ids: &[ResourceId]) -> String {
  ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

fn phase_suffix(phase: &Option<LifecyclePhase>) -> String {
  match phase {
    Some(phase) => format!(" in {phase}"),
    None => String::new(),
  }
}

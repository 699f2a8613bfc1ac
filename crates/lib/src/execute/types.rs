//! Types for converging a resource table.
//!
//! This module defines the engine configuration, the run report and the
//! per-resource results it carries.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConvergeError, HandlerError};
use crate::hooks::LifecyclePhase;
use crate::resource::{Action, Resource, ResourceId, ResourceState};

/// Configuration for a convergence run.
#[derive(Debug, Clone)]
pub struct ExecuteConfig {
  /// Maximum number of resources converged concurrently within a wave.
  pub parallelism: usize,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self {
      parallelism: num_cpus(),
    }
  }
}

impl ExecuteConfig {
  /// Converge one resource at a time.
  pub fn sequential() -> Self {
    Self { parallelism: 1 }
  }
}

/// Get the number of CPUs available.
fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

/// A handler failure together with the phase it happened in.
///
/// `phase` is `None` when the failure happened before any phase ran.
#[derive(Debug)]
pub(crate) struct PhaseFailure {
  pub phase: Option<LifecyclePhase>,
  pub error: HandlerError,
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
  /// Every resource reached `UpToDate`, `Applied` or `Skipped`.
  Success,
  /// At least one resource failed.
  Failed,
  /// A fatal error stopped the run.
  Aborted,
  /// The run was cancelled before it finished.
  Cancelled,
}

impl RunStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      RunStatus::Success => "success",
      RunStatus::Failed => "failed",
      RunStatus::Aborted => "aborted",
      RunStatus::Cancelled => "cancelled",
    }
  }
}

impl std::fmt::Display for RunStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// An error recorded against a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedError {
  /// The resource the error is attributed to, if any.
  pub resource: Option<ResourceId>,
  /// Machine-readable tag, see [`ConvergeError::kind`].
  pub kind: String,
  pub message: String,
  /// Whether the error aborted the run.
  pub fatal: bool,
}

impl ReportedError {
  pub fn new(err: &ConvergeError, fatal: bool) -> Self {
    let resource = match err {
      ConvergeError::SchemaViolation { resource, .. }
      | ConvergeError::UnknownDependency { resource, .. }
      | ConvergeError::UnresolvedRole { resource, .. }
      | ConvergeError::HandlerExecution { resource, .. } => Some(resource.clone()),
      ConvergeError::DuplicateResource(id) => Some(id.clone()),
      ConvergeError::NotificationTargetMissing { source_id, .. } => Some(source_id.clone()),
      ConvergeError::CyclicDependency(_) | ConvergeError::MissingCollaborator { .. } => None,
    };
    Self {
      resource,
      kind: err.kind().to_string(),
      message: err.to_string(),
      fatal,
    }
  }

  /// Attribute the error to `resource` when it names none itself.
  pub fn attributed_to(mut self, resource: &ResourceId) -> Self {
    self.resource.get_or_insert_with(|| resource.clone());
    self
  }
}

/// Final state of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceReport {
  pub id: ResourceId,
  pub action: Action,
  pub state: ResourceState,
  /// Why the resource was skipped or failed.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub reason: Option<String>,
  /// Deployed commit, for applications that fetched their source.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub revision: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub release_path: Option<PathBuf>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub sub_resources: Vec<ResourceReport>,
}

impl ResourceReport {
  pub(crate) fn from_resource(resource: &Resource, reason: Option<String>) -> Self {
    let deployment = resource.deployment.as_ref();
    Self {
      id: resource.id.clone(),
      action: resource.action,
      state: resource.state,
      reason,
      revision: deployment.and_then(|d| d.revision.clone()),
      release_path: deployment.and_then(|d| d.release_path.clone()),
      sub_resources: resource
        .subs
        .iter()
        .map(|sub| ResourceReport::from_resource(sub, None))
        .collect(),
    }
  }
}

/// A notification executed during the flush.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutedNotification {
  pub source: ResourceId,
  pub target: ResourceId,
  pub action: Action,
  /// `Applied`/`UpToDate` when the action ran, `Failed` when it errored,
  /// `Skipped` when the target had failed or was skipped.
  pub state: ResourceState,
}

/// Result of one convergence pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
  pub status: RunStatus,
  /// Every resource, in topological order.
  pub resources: Vec<ResourceReport>,
  pub errors: Vec<ReportedError>,
  pub notifications: Vec<ExecutedNotification>,
  #[serde(with = "duration_ms")]
  pub duration: Duration,
}

impl RunReport {
  pub fn is_success(&self) -> bool {
    self.status == RunStatus::Success
  }

  pub fn resource(&self, id: &ResourceId) -> Option<&ResourceReport> {
    self.resources.iter().find(|r| &r.id == id)
  }

  /// Final state of a top-level resource or a sub-resource.
  pub fn state_of(&self, id: &ResourceId) -> Option<ResourceState> {
    self.resources.iter().find_map(|r| {
      if &r.id == id {
        Some(r.state)
      } else {
        r.sub_resources.iter().find(|s| &s.id == id).map(|s| s.state)
      }
    })
  }

  /// Number of top-level resources in `state`.
  pub fn count(&self, state: ResourceState) -> usize {
    self.resources.iter().filter(|r| r.state == state).count()
  }

  /// Resources and sub-resources that changed the host.
  pub fn applied_count(&self) -> usize {
    self
      .resources
      .iter()
      .flat_map(|r| std::iter::once(r).chain(r.sub_resources.iter()))
      .filter(|r| r.state == ResourceState::Applied)
      .count()
  }

  pub fn failed(&self) -> impl Iterator<Item = &ResourceReport> {
    self.resources.iter().filter(|r| r.state == ResourceState::Failed)
  }

  /// Process exit code for the run.
  pub fn exit_code(&self) -> i32 {
    match self.status {
      RunStatus::Success => 0,
      RunStatus::Failed => 1,
      RunStatus::Aborted => 2,
      RunStatus::Cancelled => 130,
    }
  }
}

mod duration_ms {
  use std::time::Duration;

  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis().try_into().unwrap_or(u64::MAX))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::resource::ResourceKind;

  fn report(id: ResourceId, state: ResourceState) -> ResourceReport {
    ResourceReport {
      id,
      action: Action::Deploy,
      state,
      reason: None,
      revision: None,
      release_path: None,
      sub_resources: Vec::new(),
    }
  }

  #[test]
  fn execute_config_default_uses_cpus() {
    let config = ExecuteConfig::default();
    assert!(config.parallelism >= 1);
    assert_eq!(ExecuteConfig::sequential().parallelism, 1);
  }

  #[test]
  fn reported_error_names_the_resource() {
    let id = ResourceId::new(ResourceKind::Celery, "app1-celery");
    let err = ConvergeError::UnresolvedRole {
      resource: id.clone(),
      role: "app1_task_broker".to_string(),
    };
    let reported = ReportedError::new(&err, true);
    assert_eq!(reported.resource, Some(id));
    assert_eq!(reported.kind, "unresolved_role");
    assert!(reported.fatal);
  }

  #[test]
  fn report_counts_sub_resources() {
    let app = ResourceId::new(ResourceKind::Application, "app1");
    let django = ResourceId::new(ResourceKind::Django, "app1-django");
    let mut entry = report(app.clone(), ResourceState::Applied);
    entry.sub_resources.push(report(django.clone(), ResourceState::Applied));

    let run = RunReport {
      status: RunStatus::Success,
      resources: vec![entry],
      errors: Vec::new(),
      notifications: Vec::new(),
      duration: Duration::from_millis(1200),
    };

    assert_eq!(run.applied_count(), 2);
    assert_eq!(run.state_of(&django), Some(ResourceState::Applied));
    assert_eq!(run.exit_code(), 0);

    let json = serde_json::to_value(&run).unwrap();
    assert_eq!(json["duration"], 1200);
    assert_eq!(json["status"], "success");
    assert_eq!(json["resources"][0]["id"], "application[app1]");
  }
}

//! Manifest document types.
//!
//! A manifest is a JSON document describing one node: its attribute layers,
//! the roles it carries, the role inventory used for address lookups, and
//! the resources and applications to converge.
//!
//! # Example
//!
//! ```json
//! {
//!   "node": {
//!     "name": "web1",
//!     "roles": ["application_server"],
//!     "attributes": { "app_name": "app1" }
//!   },
//!   "roles": {
//!     "application_server": { "default_attributes": { "workers": 4 } }
//!   },
//!   "inventory": { "app1_task_broker": "10.0.0.5" },
//!   "resources": [
//!     { "kind": "package", "name": "libpq-dev" }
//!   ],
//!   "applications": [
//!     {
//!       "name": "$${node:app_name}",
//!       "attributes": { "repository": "https://example.com/app1.git" },
//!       "sub_resources": [
//!         { "kind": "django", "attributes": { "requirements": "requirements.txt" } },
//!         { "kind": "gunicorn", "attributes": { "app_module": "django" } }
//!       ]
//!     }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::resource::{Action, Attributes, Guard, NotifyDecl, ResourceId, ResourceKind};

/// A complete node manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
  #[serde(default)]
  pub node: NodeDef,
  /// Role definitions keyed by role name.
  #[serde(default)]
  pub roles: BTreeMap<String, RoleDef>,
  /// Role name to the address of the node carrying it.
  #[serde(default)]
  pub inventory: BTreeMap<String, String>,
  #[serde(default)]
  pub resources: Vec<ResourceDef>,
  #[serde(default)]
  pub applications: Vec<ApplicationDef>,
}

/// The node being converged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeDef {
  #[serde(default)]
  pub name: String,
  /// Roles in the order their default attributes are layered.
  #[serde(default)]
  pub roles: Vec<String>,
  /// Base attribute layer.
  #[serde(default)]
  pub attributes: Value,
  /// Layer applied on top of every role.
  #[serde(default)]
  pub overrides: Value,
}

/// A role's contribution to the node configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleDef {
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub default_attributes: Value,
}

/// A top-level resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceDef {
  pub kind: ResourceKind,
  pub name: String,
  /// Defaults to the kind's default action.
  #[serde(default)]
  pub action: Option<Action>,
  #[serde(default)]
  pub attributes: Attributes,
  #[serde(default)]
  pub depends_on: Vec<ResourceId>,
  #[serde(default)]
  pub notifies: Vec<NotifyDecl>,
  #[serde(default)]
  pub only_if: Option<GuardDef>,
}

/// A composite application and its sub-resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplicationDef {
  pub name: String,
  #[serde(default)]
  pub action: Option<Action>,
  #[serde(default)]
  pub attributes: Attributes,
  #[serde(default)]
  pub sub_resources: Vec<SubResourceDef>,
  #[serde(default)]
  pub depends_on: Vec<ResourceId>,
  #[serde(default)]
  pub notifies: Vec<NotifyDecl>,
  #[serde(default)]
  pub only_if: Option<GuardDef>,
}

/// A sub-resource of an application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubResourceDef {
  pub kind: ResourceKind,
  #[serde(default)]
  pub attributes: Attributes,
  #[serde(default)]
  pub depends_on: Vec<ResourceId>,
  #[serde(default)]
  pub notifies: Vec<NotifyDecl>,
  #[serde(default)]
  pub only_if: Option<GuardDef>,
  /// Command run instead of restarting the sub-resource's services.
  #[serde(default)]
  pub restart_command: Option<String>,
}

/// A declarative `only_if` guard. Every condition given must hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuardDef {
  /// The node carries this role.
  #[serde(default)]
  pub role: Option<String>,
  /// The node does not carry this role.
  #[serde(default)]
  pub not_role: Option<String>,
  /// Dotted path of a node attribute that must be set and truthy, or equal
  /// to `equals` when given.
  #[serde(default)]
  pub attribute: Option<String>,
  #[serde(default)]
  pub equals: Option<Value>,
}

impl GuardDef {
  pub fn eval(&self, config: &Config) -> bool {
    if let Some(role) = &self.role
      && !config.has_role(role)
    {
      return false;
    }
    if let Some(role) = &self.not_role
      && config.has_role(role)
    {
      return false;
    }
    if let Some(path) = &self.attribute {
      let value = config.get(path);
      let holds = match &self.equals {
        Some(expected) => value == Some(expected),
        None => value.is_some_and(truthy),
      };
      if !holds {
        return false;
      }
    }
    true
  }

  pub fn to_guard(&self) -> Guard {
    let def = self.clone();
    Guard::new(move |config| def.eval(config))
  }
}

fn truthy(value: &Value) -> bool {
  match value {
    Value::Null => false,
    Value::Bool(b) => *b,
    Value::String(s) => !s.is_empty(),
    Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
    Value::Array(items) => !items.is_empty(),
    Value::Object(map) => !map.is_empty(),
  }
}

//! Core types of the resource declaration model.
//!
//! A [`Resource`] is one declared unit of desired state, identified by its
//! [`ResourceId`] (a `(kind, name)` pair) and carrying typed [`Attributes`].
//! Resources are created through [`ResourceTable::declare`](super::ResourceTable::declare),
//! which validates attributes against the kind's schema.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::deploy::{CompositePlan, DeploymentState};
use crate::hooks::HandlerRef;

/// The closed set of resource kinds the engine knows how to converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
  /// A system package.
  Package,
  /// A file with literal content.
  File,
  /// A file rendered from a template.
  Template,
  /// A process-manager program.
  Service,
  /// A guarded shell command.
  Execute,
  /// A composite application deployment.
  Application,
  /// Web-framework deploy sub-resource.
  Django,
  /// Process-manager sub-resource serving the application.
  Gunicorn,
  /// Task-queue sub-resource.
  Celery,
}

impl ResourceKind {
  pub const ALL: [ResourceKind; 9] = [
    ResourceKind::Package,
    ResourceKind::File,
    ResourceKind::Template,
    ResourceKind::Service,
    ResourceKind::Execute,
    ResourceKind::Application,
    ResourceKind::Django,
    ResourceKind::Gunicorn,
    ResourceKind::Celery,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      ResourceKind::Package => "package",
      ResourceKind::File => "file",
      ResourceKind::Template => "template",
      ResourceKind::Service => "service",
      ResourceKind::Execute => "execute",
      ResourceKind::Application => "application",
      ResourceKind::Django => "django",
      ResourceKind::Gunicorn => "gunicorn",
      ResourceKind::Celery => "celery",
    }
  }

  /// Kinds that only exist inside an application.
  pub fn is_sub_resource(&self) -> bool {
    matches!(self, ResourceKind::Django | ResourceKind::Gunicorn | ResourceKind::Celery)
  }

  pub fn is_composite(&self) -> bool {
    matches!(self, ResourceKind::Application)
  }
}

impl fmt::Display for ResourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ResourceKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    ResourceKind::ALL
      .into_iter()
      .find(|kind| kind.as_str() == s)
      .ok_or_else(|| format!("unknown resource kind `{s}`"))
  }
}

/// Identity of a resource within a run: `kind[name]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId {
  pub kind: ResourceKind,
  pub name: String,
}

impl ResourceId {
  pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
    Self {
      kind,
      name: name.into(),
    }
  }
}

impl fmt::Display for ResourceId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}[{}]", self.kind, self.name)
  }
}

impl FromStr for ResourceId {
  type Err = String;

  /// Parses the `kind[name]` notation used in manifests.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (kind, rest) = s
      .split_once('[')
      .ok_or_else(|| format!("malformed resource reference `{s}`, expected kind[name]"))?;
    let name = rest
      .strip_suffix(']')
      .ok_or_else(|| format!("malformed resource reference `{s}`, missing `]`"))?;
    if name.is_empty() {
      return Err(format!("malformed resource reference `{s}`, empty name"));
    }
    Ok(ResourceId::new(kind.parse()?, name))
  }
}

impl Serialize for ResourceId {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for ResourceId {
  fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
  }
}

/// The action a resource is asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
  Nothing,
  Install,
  Upgrade,
  Remove,
  Create,
  Delete,
  Enable,
  Disable,
  Restart,
  Run,
  Deploy,
}

impl Action {
  pub const ALL: [Action; 11] = [
    Action::Nothing,
    Action::Install,
    Action::Upgrade,
    Action::Remove,
    Action::Create,
    Action::Delete,
    Action::Enable,
    Action::Disable,
    Action::Restart,
    Action::Run,
    Action::Deploy,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Action::Nothing => "nothing",
      Action::Install => "install",
      Action::Upgrade => "upgrade",
      Action::Remove => "remove",
      Action::Create => "create",
      Action::Delete => "delete",
      Action::Enable => "enable",
      Action::Disable => "disable",
      Action::Restart => "restart",
      Action::Run => "run",
      Action::Deploy => "deploy",
    }
  }
}

impl fmt::Display for Action {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Action {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Action::ALL
      .into_iter()
      .find(|action| action.as_str() == s)
      .ok_or_else(|| format!("unknown action `{s}`"))
  }
}

/// A typed attribute value.
///
/// Deserializes from plain JSON scalars, arrays and objects. Floating point
/// numbers and nulls are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
  Bool(bool),
  Int(i64),
  Str(String),
  List(Vec<AttrValue>),
  Map(BTreeMap<String, AttrValue>),
}

impl AttrValue {
  pub fn type_name(&self) -> &'static str {
    match self {
      AttrValue::Bool(_) => "boolean",
      AttrValue::Int(_) => "integer",
      AttrValue::Str(_) => "string",
      AttrValue::List(_) => "list",
      AttrValue::Map(_) => "map",
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      AttrValue::Str(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      AttrValue::Bool(b) => Some(*b),
      _ => None,
    }
  }

  pub fn as_int(&self) -> Option<i64> {
    match self {
      AttrValue::Int(n) => Some(*n),
      _ => None,
    }
  }

  pub fn as_list(&self) -> Option<&[AttrValue]> {
    match self {
      AttrValue::List(items) => Some(items),
      _ => None,
    }
  }

  pub fn as_map(&self) -> Option<&BTreeMap<String, AttrValue>> {
    match self {
      AttrValue::Map(map) => Some(map),
      _ => None,
    }
  }

  /// Render scalars as plain text, used for environment maps and
  /// template variables.
  pub fn to_plain_string(&self) -> String {
    match self {
      AttrValue::Bool(b) => b.to_string(),
      AttrValue::Int(n) => n.to_string(),
      AttrValue::Str(s) => s.clone(),
      other => serde_json::to_string(other).unwrap_or_default(),
    }
  }
}

impl fmt::Display for AttrValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match serde_json::to_string(self) {
      Ok(s) => f.write_str(&s),
      Err(_) => f.write_str("<unprintable>"),
    }
  }
}

impl From<bool> for AttrValue {
  fn from(value: bool) -> Self {
    AttrValue::Bool(value)
  }
}

impl From<i64> for AttrValue {
  fn from(value: i64) -> Self {
    AttrValue::Int(value)
  }
}

impl From<&str> for AttrValue {
  fn from(value: &str) -> Self {
    AttrValue::Str(value.to_string())
  }
}

impl From<String> for AttrValue {
  fn from(value: String) -> Self {
    AttrValue::Str(value)
  }
}

impl From<Vec<AttrValue>> for AttrValue {
  fn from(value: Vec<AttrValue>) -> Self {
    AttrValue::List(value)
  }
}

impl From<BTreeMap<String, AttrValue>> for AttrValue {
  fn from(value: BTreeMap<String, AttrValue>) -> Self {
    AttrValue::Map(value)
  }
}

/// The attribute bag of a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, AttrValue>);

impl Attributes {
  pub fn new() -> Self {
    Self::default()
  }

  /// Builder-style insert.
  pub fn with(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
    self.0.insert(key.into(), value.into());
    self
  }

  pub fn get(&self, key: &str) -> Option<&AttrValue> {
    self.0.get(key)
  }

  pub fn contains(&self, key: &str) -> bool {
    self.0.contains_key(key)
  }

  pub fn set(&mut self, key: impl Into<String>, value: impl Into<AttrValue>) {
    self.0.insert(key.into(), value.into());
  }

  pub fn remove(&mut self, key: &str) -> Option<AttrValue> {
    self.0.remove(key)
  }

  pub fn str(&self, key: &str) -> Option<&str> {
    self.get(key).and_then(AttrValue::as_str)
  }

  /// Boolean attribute, `false` when unset.
  pub fn flag(&self, key: &str) -> bool {
    self.get(key).and_then(AttrValue::as_bool).unwrap_or(false)
  }

  pub fn int(&self, key: &str) -> Option<i64> {
    self.get(key).and_then(AttrValue::as_int)
  }

  pub fn map(&self, key: &str) -> Option<&BTreeMap<String, AttrValue>> {
    self.get(key).and_then(AttrValue::as_map)
  }

  pub fn list(&self, key: &str) -> Option<&[AttrValue]> {
    self.get(key).and_then(AttrValue::as_list)
  }

  /// A map attribute flattened to strings, empty when unset.
  pub fn string_map(&self, key: &str) -> BTreeMap<String, String> {
    self
      .map(key)
      .map(|map| map.iter().map(|(k, v)| (k.clone(), v.to_plain_string())).collect())
      .unwrap_or_default()
  }

  /// Mutable access to a map attribute, created empty when missing or not a map.
  pub fn map_mut(&mut self, key: &str) -> &mut BTreeMap<String, AttrValue> {
    let entry = self
      .0
      .entry(key.to_string())
      .or_insert_with(|| AttrValue::Map(BTreeMap::new()));
    if !matches!(entry, AttrValue::Map(_)) {
      *entry = AttrValue::Map(BTreeMap::new());
    }
    match entry {
      AttrValue::Map(map) => map,
      _ => unreachable!("entry was just replaced with a map"),
    }
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &AttrValue)> {
    self.0.iter()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn into_inner(self) -> BTreeMap<String, AttrValue> {
    self.0
  }
}

impl From<BTreeMap<String, AttrValue>> for Attributes {
  fn from(value: BTreeMap<String, AttrValue>) -> Self {
    Self(value)
  }
}

/// Convergence state of a resource within one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
  Pending,
  Evaluating,
  Applying,
  UpToDate,
  Applied,
  Failed,
  Skipped,
}

impl ResourceState {
  pub fn as_str(&self) -> &'static str {
    match self {
      ResourceState::Pending => "pending",
      ResourceState::Evaluating => "evaluating",
      ResourceState::Applying => "applying",
      ResourceState::UpToDate => "up_to_date",
      ResourceState::Applied => "applied",
      ResourceState::Failed => "failed",
      ResourceState::Skipped => "skipped",
    }
  }

  /// Whether the resource reached a final state.
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      ResourceState::UpToDate | ResourceState::Applied | ResourceState::Failed | ResourceState::Skipped
    )
  }
}

impl fmt::Display for ResourceState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A guard deciding whether a resource takes part in the run.
///
/// Evaluated once against the run's [`Config`] before the resource's first
/// phase. A false guard skips every phase and suppresses notifications.
#[derive(Clone)]
pub struct Guard(Arc<dyn Fn(&Config) -> bool + Send + Sync>);

impl Guard {
  pub fn new(predicate: impl Fn(&Config) -> bool + Send + Sync + 'static) -> Self {
    Self(Arc::new(predicate))
  }

  /// True when the node carries `role`.
  pub fn role(role: impl Into<String>) -> Self {
    let role = role.into();
    Self::new(move |config| config.has_role(&role))
  }

  pub fn constant(value: bool) -> Self {
    Self::new(move |_| value)
  }

  pub fn eval(&self, config: &Config) -> bool {
    (self.0)(config)
  }
}

impl fmt::Debug for Guard {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("Guard(..)")
  }
}

/// A notification declared on a resource, fired when it is `Applied`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyDecl {
  pub target: ResourceId,
  pub action: Action,
}

/// One declared unit of desired state.
#[derive(Debug, Clone)]
pub struct Resource {
  pub id: ResourceId,
  pub action: Action,
  pub attrs: Attributes,
  pub state: ResourceState,
  pub depends_on: Vec<ResourceId>,
  pub notifies: Vec<NotifyDecl>,
  pub only_if: Option<Guard>,
  /// Replacement for the default restart behaviour of a sub-resource.
  pub restart: Option<HandlerRef>,
  /// Ordered sub-resources of a composite deployment.
  pub subs: Vec<Resource>,
  pub(crate) composite: Option<CompositePlan>,
  pub(crate) deployment: Option<DeploymentState>,
}

impl Resource {
  pub(crate) fn new(id: ResourceId, action: Action, attrs: Attributes) -> Self {
    Self {
      id,
      action,
      attrs,
      state: ResourceState::Pending,
      depends_on: Vec::new(),
      notifies: Vec::new(),
      only_if: None,
      restart: None,
      subs: Vec::new(),
      composite: None,
      deployment: None,
    }
  }

  pub fn kind(&self) -> ResourceKind {
    self.id.kind
  }

  pub fn name(&self) -> &str {
    &self.id.name
  }

  pub fn owner(&self) -> Option<&str> {
    self.attrs.str("owner")
  }

  pub fn group(&self) -> Option<&str> {
    self.attrs.str("group")
  }

  /// Add an explicit dependency edge.
  pub fn depend_on(&mut self, id: ResourceId) -> &mut Self {
    if !self.depends_on.contains(&id) {
      self.depends_on.push(id);
    }
    self
  }

  /// Declare a notification fired when this resource is applied.
  pub fn notify(&mut self, target: ResourceId, action: Action) -> &mut Self {
    self.notifies.push(NotifyDecl { target, action });
    self
  }

  pub fn only_if(&mut self, guard: Guard) -> &mut Self {
    self.only_if = Some(guard);
    self
  }

  /// Override the restart behaviour of a sub-resource.
  pub fn with_restart(&mut self, handler: HandlerRef) -> &mut Self {
    self.restart = Some(handler);
    self
  }

  /// The first sub-resource of `kind`, as resolved when the composite was prepared.
  pub fn find_sibling(&self, kind: ResourceKind) -> Option<&Resource> {
    match &self.composite {
      Some(plan) => plan.sibling_index(kind).and_then(|idx| self.subs.get(idx)),
      None => self.subs.iter().find(|sub| sub.kind() == kind),
    }
  }

  pub fn sub(&self, kind: ResourceKind) -> Option<&Resource> {
    self.subs.iter().find(|sub| sub.kind() == kind)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn resource_id_round_trips_through_notation() {
    let id: ResourceId = "service[nginx]".parse().unwrap();
    assert_eq!(id, ResourceId::new(ResourceKind::Service, "nginx"));
    assert_eq!(id.to_string(), "service[nginx]");
  }

  #[test]
  fn resource_id_rejects_malformed_notation() {
    assert!("service".parse::<ResourceId>().is_err());
    assert!("service[nginx".parse::<ResourceId>().is_err());
    assert!("service[]".parse::<ResourceId>().is_err());
    assert!("daemon[nginx]".parse::<ResourceId>().is_err());
  }

  #[test]
  fn attr_value_deserializes_from_plain_json() {
    let value: AttrValue = serde_json::from_str(r#"{"debug": false, "port": 8080, "hosts": ["a", "b"]}"#).unwrap();
    let map = value.as_map().unwrap();
    assert_eq!(map["debug"], AttrValue::Bool(false));
    assert_eq!(map["port"], AttrValue::Int(8080));
    assert_eq!(map["hosts"].as_list().unwrap().len(), 2);
  }

  #[test]
  fn attr_value_rejects_floats() {
    assert!(serde_json::from_str::<AttrValue>("1.5").is_err());
  }

  #[test]
  fn attributes_accessors() {
    let mut attrs = Attributes::new()
      .with("bind", "unix:/tmp/app.sock")
      .with("debug", true)
      .with("workers", 4i64);

    assert_eq!(attrs.str("bind"), Some("unix:/tmp/app.sock"));
    assert!(attrs.flag("debug"));
    assert!(!attrs.flag("missing"));
    assert_eq!(attrs.int("workers"), Some(4));

    attrs.map_mut("environment").insert("PATH".into(), "/usr/bin".into());
    assert_eq!(attrs.string_map("environment")["PATH"], "/usr/bin");
  }

  #[test]
  fn guard_role_checks_config() {
    let config = Config::builder().roles(["application_server"]).build();
    assert!(Guard::role("application_server").eval(&config));
    assert!(!Guard::role("database_master").eval(&config));
    assert!(!Guard::constant(false).eval(&config));
  }
}

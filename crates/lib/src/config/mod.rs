//! Node configuration.
//!
//! A run sees one immutable [`Config`]: the node's attributes merged from
//! layers in a fixed order (base, then each role's defaults in role order,
//! then overrides), plus the node's role list. Guards and handlers read it;
//! nothing writes to it once the run starts.
//!
//! Secrets live in a separate opaque bag behind [`ConfigProvider`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

/// Errors raised by configuration sources.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("configuration key `{0}` not found")]
  NotFound(String),

  #[error("failed to read {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
}

/// The merged attributes and roles of the node being converged.
#[derive(Debug, Clone, Default)]
pub struct Config {
  node_name: String,
  roles: Vec<String>,
  attributes: Value,
}

impl Config {
  pub fn builder() -> ConfigBuilder {
    ConfigBuilder::default()
  }

  pub fn node_name(&self) -> &str {
    &self.node_name
  }

  pub fn roles(&self) -> &[String] {
    &self.roles
  }

  pub fn has_role(&self, role: &str) -> bool {
    self.roles.iter().any(|r| r == role)
  }

  /// The full merged attribute tree.
  pub fn attributes(&self) -> &Value {
    &self.attributes
  }

  /// Look up an attribute by dotted path (`postgresql.password.postgres`).
  pub fn get(&self, path: &str) -> Option<&Value> {
    lookup(&self.attributes, path)
  }

  pub fn get_str(&self, path: &str) -> Option<&str> {
    self.get(path).and_then(Value::as_str)
  }

  /// Scalar attribute rendered as text (numbers and booleans included).
  pub fn get_string(&self, path: &str) -> Option<String> {
    match self.get(path)? {
      Value::String(s) => Some(s.clone()),
      Value::Number(n) => Some(n.to_string()),
      Value::Bool(b) => Some(b.to_string()),
      _ => None,
    }
  }
}

/// Builds a [`Config`] from its layers.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
  node_name: String,
  roles: Vec<String>,
  base: Option<Value>,
  role_layers: Vec<Value>,
  overrides: Option<Value>,
}

impl ConfigBuilder {
  pub fn node_name(mut self, name: impl Into<String>) -> Self {
    self.node_name = name.into();
    self
  }

  pub fn roles<I, S>(mut self, roles: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.roles = roles.into_iter().map(Into::into).collect();
    self
  }

  pub fn base(mut self, attributes: Value) -> Self {
    self.base = Some(attributes);
    self
  }

  /// Add one role's default attributes. Layers merge in the order added.
  pub fn role_layer(mut self, attributes: Value) -> Self {
    self.role_layers.push(attributes);
    self
  }

  pub fn overrides(mut self, attributes: Value) -> Self {
    self.overrides = Some(attributes);
    self
  }

  pub fn build(self) -> Config {
    let mut attributes = Value::Object(Map::new());

    let layers = self
      .base
      .into_iter()
      .chain(self.role_layers)
      .chain(self.overrides)
      .filter(|layer| !layer.is_null());
    for layer in layers {
      deep_merge(&mut attributes, layer);
    }

    debug!(node = %self.node_name, roles = ?self.roles, "built node configuration");

    Config {
      node_name: self.node_name,
      roles: self.roles,
      attributes,
    }
  }
}

/// Merge `src` into `dst`. Objects merge key by key; anything else replaces.
fn deep_merge(dst: &mut Value, src: Value) {
  match (dst, src) {
    (Value::Object(dst), Value::Object(src)) => {
      for (key, value) in src {
        match dst.get_mut(&key) {
          Some(existing) => deep_merge(existing, value),
          None => {
            dst.insert(key, value);
          }
        }
      }
    }
    (dst, src) => *dst = src,
  }
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
  path
    .split('.')
    .try_fold(root, |value, segment| value.as_object()?.get(segment))
}

/// An opaque bag of configuration values, typically secrets.
pub trait ConfigProvider: Send + Sync {
  /// Fetch a value by key.
  ///
  /// # Errors
  ///
  /// Returns [`ConfigError::NotFound`] when the key is absent.
  fn get(&self, key: &str) -> Result<String, ConfigError>;
}

/// In-memory [`ConfigProvider`], optionally loaded from a JSON file.
///
/// Nested objects are flattened to dotted keys.
#[derive(Debug, Clone, Default)]
pub struct StaticConfig {
  values: BTreeMap<String, String>,
}

impl StaticConfig {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.values.insert(key.into(), value.into());
    self
  }

  pub fn from_value(value: &Value) -> Self {
    let mut values = BTreeMap::new();
    flatten(value, String::new(), &mut values);
    Self { values }
  }

  pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    let value: Value = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    debug!(path = %path.display(), "loaded secrets file");
    Ok(Self::from_value(&value))
  }

  pub fn keys(&self) -> impl Iterator<Item = &str> {
    self.values.keys().map(String::as_str)
  }
}

impl ConfigProvider for StaticConfig {
  fn get(&self, key: &str) -> Result<String, ConfigError> {
    self
      .values
      .get(key)
      .cloned()
      .ok_or_else(|| ConfigError::NotFound(key.to_string()))
  }
}

fn flatten(value: &Value, prefix: String, out: &mut BTreeMap<String, String>) {
  match value {
    Value::Object(map) => {
      for (key, child) in map {
        let path = if prefix.is_empty() {
          key.clone()
        } else {
          format!("{prefix}.{key}")
        };
        flatten(child, path, out);
      }
    }
    Value::String(s) => {
      out.insert(prefix, s.clone());
    }
    Value::Null => {}
    other => {
      out.insert(prefix, other.to_string());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn layers_merge_base_role_override() {
    let config = Config::builder()
      .node_name("web1")
      .roles(["base", "application_server"])
      .base(json!({"app_name": "app1", "postgresql": {"database_name": "app", "port": 5432}}))
      .role_layer(json!({"postgresql": {"database_name": "app_prod"}}))
      .role_layer(json!({"site_domain": "example.com"}))
      .overrides(json!({"postgresql": {"port": 6432}}))
      .build();

    assert_eq!(config.get_str("app_name"), Some("app1"));
    assert_eq!(config.get_str("postgresql.database_name"), Some("app_prod"));
    assert_eq!(config.get_string("postgresql.port").as_deref(), Some("6432"));
    assert_eq!(config.get_str("site_domain"), Some("example.com"));
    assert!(config.has_role("application_server"));
    assert!(!config.has_role("database_master"));
  }

  #[test]
  fn later_role_layer_wins() {
    let config = Config::builder()
      .role_layer(json!({"workers": 2}))
      .role_layer(json!({"workers": 4}))
      .build();
    assert_eq!(config.get("workers"), Some(&json!(4)));
  }

  #[test]
  fn null_layers_are_ignored() {
    let config = Config::builder()
      .base(json!({"app_name": "app1"}))
      .role_layer(Value::Null)
      .overrides(Value::Null)
      .build();
    assert_eq!(config.get_str("app_name"), Some("app1"));
  }

  #[test]
  fn missing_path_is_none() {
    let config = Config::builder().base(json!({"a": {"b": 1}})).build();
    assert!(config.get("a.c").is_none());
    assert!(config.get("a.b.c").is_none());
  }

  #[test]
  fn static_config_flattens_nested_values() {
    let provider = StaticConfig::from_value(&json!({
      "postgres": {"password": "hunter2"},
      "SECRET_KEY": "abc",
      "DEBUG": false
    }));

    assert_eq!(provider.get("postgres.password").unwrap(), "hunter2");
    assert_eq!(provider.get("DEBUG").unwrap(), "false");
    assert!(matches!(provider.get("missing"), Err(ConfigError::NotFound(_))));
  }

  #[test]
  fn static_config_from_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("secrets.json");
    std::fs::write(&path, r#"{"AWS_KEY": "k"}"#).unwrap();

    let provider = StaticConfig::from_json_file(&path).unwrap();
    assert_eq!(provider.get("AWS_KEY").unwrap(), "k");

    std::fs::write(&path, "not json").unwrap();
    assert!(matches!(
      StaticConfig::from_json_file(&path),
      Err(ConfigError::Parse { .. })
    ));
  }
}

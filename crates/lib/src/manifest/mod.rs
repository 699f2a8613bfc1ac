//! JSON manifests.
//!
//! A [`Manifest`] is loaded from disk, turned into the node's [`Config`]
//! (base attributes, then each role's defaults in role order, then
//! overrides), and finally declared into a [`ResourceTable`]. String
//! attributes and names may reference node attributes and secrets with
//! `$${node:path}` and `$${secret:key}`; these are substituted at
//! declaration time.

mod types;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

pub use types::*;

use crate::config::{Config, ConfigProvider};
use crate::error::ConvergeError;
use crate::hooks::builtin::restart_command;
use crate::placeholder::{self, PlaceholderError, Resolver};
use crate::resource::{AttrValue, Attributes, NotifyDecl, ResourceId, ResourceKind, ResourceTable, schema_for};

/// Errors raised while loading or declaring a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
  #[error("failed to read manifest {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse manifest {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("{context}: {source}")]
  Placeholder {
    context: String,
    #[source]
    source: PlaceholderError,
  },

  #[error(transparent)]
  Declaration(#[from] ConvergeError),
}

impl Manifest {
  /// Load a manifest file.
  pub fn load(path: &Path) -> Result<Self, ManifestError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    let manifest = Self::parse(&raw).map_err(|source| ManifestError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    debug!(
      path = %path.display(),
      resources = manifest.resources.len(),
      applications = manifest.applications.len(),
      "loaded manifest"
    );
    Ok(manifest)
  }

  pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(raw)
  }

  /// The node configuration: base attributes, role defaults in the node's
  /// role order, then overrides.
  pub fn config(&self) -> Config {
    let mut builder = Config::builder()
      .node_name(self.node.name.clone())
      .roles(self.node.roles.iter().cloned())
      .base(self.node.attributes.clone());

    for role in &self.node.roles {
      match self.roles.get(role) {
        Some(def) => builder = builder.role_layer(def.default_attributes.clone()),
        None => warn!(role = %role, "node carries a role with no definition"),
      }
    }
    builder.overrides(self.node.overrides.clone()).build()
  }

  /// Role name to address, for the static inventory.
  pub fn inventory(&self) -> &BTreeMap<String, String> {
    &self.inventory
  }

  /// Declare every resource and application into a fresh table.
  ///
  /// # Errors
  ///
  /// - [`ManifestError::Placeholder`] when a reference cannot be resolved
  /// - [`ManifestError::Declaration`] for schema violations and duplicates
  pub fn declare(&self, config: &Config, secrets: &dyn ConfigProvider) -> Result<ResourceTable, ManifestError> {
    let resolver = ManifestResolver { config, secrets };
    let mut table = ResourceTable::new();

    for def in &self.resources {
      let name = resolver.text(&def.name, || format!("{}[{}]", def.kind, def.name))?;
      let id = ResourceId::new(def.kind, name.clone());
      let attrs = resolver.attributes(&def.attributes, &id)?;
      let action = def.action.unwrap_or(schema_for(def.kind).default_action);

      let handle = table.declare_with_action(def.kind, name, action, attrs)?;
      let resource = table.get_mut(handle);
      for dep in &def.depends_on {
        resource.depend_on(resolver.id(dep)?);
      }
      for decl in &def.notifies {
        let decl = resolver.notify(decl)?;
        resource.notify(decl.target, decl.action);
      }
      if let Some(guard) = &def.only_if {
        resource.only_if(guard.to_guard());
      }
    }

    for def in &self.applications {
      let name = resolver.text(&def.name, || format!("application[{}]", def.name))?;
      let id = ResourceId::new(ResourceKind::Application, name.clone());
      let attrs = resolver.attributes(&def.attributes, &id)?;
      let action = def
        .action
        .unwrap_or(schema_for(ResourceKind::Application).default_action);

      let app = table.declare_with_action(ResourceKind::Application, name, action, attrs)?;
      {
        let resource = table.get_mut(app);
        for dep in &def.depends_on {
          resource.depend_on(resolver.id(dep)?);
        }
        for decl in &def.notifies {
          let decl = resolver.notify(decl)?;
          resource.notify(decl.target, decl.action);
        }
        if let Some(guard) = &def.only_if {
          resource.only_if(guard.to_guard());
        }
      }

      for sub_def in &def.sub_resources {
        let sub_id = ResourceId::new(sub_def.kind, id.name.clone());
        let attrs = resolver.attributes(&sub_def.attributes, &sub_id)?;
        let handle = table.declare_sub(app, sub_def.kind, attrs)?;
        let sub = table.sub_mut(handle);
        for dep in &sub_def.depends_on {
          sub.depend_on(resolver.id(dep)?);
        }
        for decl in &sub_def.notifies {
          let decl = resolver.notify(decl)?;
          sub.notify(decl.target, decl.action);
        }
        if let Some(guard) = &sub_def.only_if {
          sub.only_if(guard.to_guard());
        }
        if let Some(command) = &sub_def.restart_command {
          sub.with_restart(restart_command(command.as_str()));
        }
      }
    }

    debug!(resources = table.len(), "declared manifest");
    Ok(table)
  }
}

/// Resolves `$${node:...}` against the node config and `$${secret:...}`
/// against the secrets bag.
struct ManifestResolver<'a> {
  config: &'a Config,
  secrets: &'a dyn ConfigProvider,
}

impl Resolver for ManifestResolver<'_> {
  fn resolve_node(&self, path: &str) -> Result<String, PlaceholderError> {
    self
      .config
      .get_string(path)
      .ok_or_else(|| PlaceholderError::UnresolvedNode(path.to_string()))
  }

  fn resolve_secret(&self, key: &str) -> Result<String, PlaceholderError> {
    self
      .secrets
      .get(key)
      .map_err(|_| PlaceholderError::UnresolvedSecret(key.to_string()))
  }
}

impl ManifestResolver<'_> {
  fn text(&self, input: &str, context: impl FnOnce() -> String) -> Result<String, ManifestError> {
    if !placeholder::has_placeholders(input) {
      return Ok(input.to_string());
    }
    placeholder::substitute(input, self).map_err(|source| ManifestError::Placeholder {
      context: context(),
      source,
    })
  }

  fn id(&self, id: &ResourceId) -> Result<ResourceId, ManifestError> {
    let name = self.text(&id.name, || format!("reference to {id}"))?;
    Ok(ResourceId::new(id.kind, name))
  }

  fn notify(&self, decl: &NotifyDecl) -> Result<NotifyDecl, ManifestError> {
    Ok(NotifyDecl {
      target: self.id(&decl.target)?,
      action: decl.action,
    })
  }

  fn attributes(&self, attrs: &Attributes, owner: &ResourceId) -> Result<Attributes, ManifestError> {
    let mut out = Attributes::new();
    for (key, value) in attrs.iter() {
      out.set(key.clone(), self.value(value, &|| format!("{owner}: attribute `{key}`"))?);
    }
    Ok(out)
  }

  fn value(&self, value: &AttrValue, context: &dyn Fn() -> String) -> Result<AttrValue, ManifestError> {
    Ok(match value {
      AttrValue::Str(s) => AttrValue::Str(self.text(s, context)?),
      AttrValue::List(items) => AttrValue::List(
        items
          .iter()
          .map(|item| self.value(item, context))
          .collect::<Result<_, _>>()?,
      ),
      AttrValue::Map(map) => AttrValue::Map(
        map
          .iter()
          .map(|(k, v)| Ok((k.clone(), self.value(v, context)?)))
          .collect::<Result<_, ManifestError>>()?,
      ),
      other => other.clone(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::StaticConfig;
  use crate::resource::{Action, ResourceState};
  use serde_json::json;

  fn manifest() -> Manifest {
    serde_json::from_value(json!({
      "node": {
        "name": "web1",
        "roles": ["base", "application_server"],
        "attributes": {"app_name": "app1", "site_domain": "example.com"},
        "overrides": {"workers": 8}
      },
      "roles": {
        "base": {"default_attributes": {"workers": 2, "timezone": "UTC"}},
        "application_server": {"default_attributes": {"workers": 4}}
      },
      "inventory": {"database_master": "10.0.0.10"},
      "resources": [
        {"kind": "package", "name": "libpq-dev"},
        {
          "kind": "template",
          "name": "/etc/nginx/sites-enabled/$${node:app_name}",
          "attributes": {
            "source": "nginx-site.conf",
            "variables": {"domain": "$${node:site_domain}"}
          },
          "notifies": [{"target": "service[nginx]", "action": "restart"}]
        },
        {"kind": "service", "name": "nginx", "attributes": {"command": "/usr/sbin/nginx"}}
      ],
      "applications": [{
        "name": "$${node:app_name}",
        "attributes": {"repository": "https://example.com/app1.git", "migrate": true},
        "depends_on": ["package[libpq-dev]"],
        "sub_resources": [
          {
            "kind": "django",
            "attributes": {"database_password": "$${secret:postgres.password}"},
            "only_if": {"role": "application_server"}
          },
          {"kind": "gunicorn", "attributes": {"app_module": "django"}, "restart_command": "kill -HUP 1"}
        ]
      }]
    }))
    .unwrap()
  }

  #[test]
  fn config_layers_roles_in_order() {
    let config = manifest().config();
    assert_eq!(config.node_name(), "web1");
    assert_eq!(config.get_string("workers").as_deref(), Some("8"));
    assert_eq!(config.get_str("timezone"), Some("UTC"));
    assert!(config.has_role("application_server"));
  }

  #[test]
  fn declare_substitutes_node_and_secret_references() {
    let manifest = manifest();
    let config = manifest.config();
    let secrets = StaticConfig::new().with("postgres.password", "hunter2");

    let table = manifest.declare(&config, &secrets).unwrap();

    let site = table
      .find(&ResourceId::new(ResourceKind::Template, "/etc/nginx/sites-enabled/app1"))
      .unwrap();
    assert_eq!(site.attrs.map("variables").unwrap()["domain"], AttrValue::from("example.com"));
    assert_eq!(site.notifies[0].target, ResourceId::new(ResourceKind::Service, "nginx"));

    let app = table
      .find(&ResourceId::new(ResourceKind::Application, "app1"))
      .unwrap();
    assert_eq!(app.action, Action::Deploy);
    assert_eq!(app.state, ResourceState::Pending);
    assert_eq!(app.depends_on, vec![ResourceId::new(ResourceKind::Package, "libpq-dev")]);
    assert_eq!(app.subs.len(), 2);
    assert_eq!(app.subs[0].attrs.str("database_password"), Some("hunter2"));
    assert!(app.subs[0].only_if.as_ref().unwrap().eval(&config));
    assert!(app.subs[1].restart.is_some());
  }

  #[test]
  fn missing_secret_names_the_attribute() {
    let manifest = manifest();
    let err = manifest
      .declare(&manifest.config(), &StaticConfig::new())
      .unwrap_err();
    match err {
      ManifestError::Placeholder { context, source } => {
        assert_eq!(context, "django[app1]: attribute `database_password`");
        assert_eq!(source, PlaceholderError::UnresolvedSecret("postgres.password".into()));
      }
      other => panic!("expected placeholder error, got {other:?}"),
    }
  }

  #[test]
  fn schema_violations_surface_as_declaration_errors() {
    let manifest: Manifest = serde_json::from_value(json!({
      "resources": [{"kind": "gunicorn", "name": "orphan"}]
    }))
    .unwrap();
    let err = manifest
      .declare(&manifest.config(), &StaticConfig::new())
      .unwrap_err();
    assert!(matches!(
      err,
      ManifestError::Declaration(ConvergeError::SchemaViolation { .. })
    ));
  }

  #[test]
  fn load_reports_parse_errors_with_path() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("node.json");
    std::fs::write(&path, "{\"resources\": [}").unwrap();

    let err = Manifest::load(&path).unwrap_err();
    assert!(matches!(err, ManifestError::Parse { .. }));
    assert!(err.to_string().contains("node.json"));
  }
}

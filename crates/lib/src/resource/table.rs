//! The run-wide resource table.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::deploy::CompositePlan;
use crate::error::ConvergeError;

use super::schema::{schema_for, validate};
use super::types::{Action, AttrValue, Attributes, Resource, ResourceId, ResourceKind};

/// Handle to a top-level resource in a [`ResourceTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle(usize);

/// Handle to a sub-resource of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubResourceHandle {
  parent: usize,
  index: usize,
}

impl SubResourceHandle {
  pub fn parent(&self) -> ResourceHandle {
    ResourceHandle(self.parent)
  }
}

/// All resources declared for one convergence pass, in declaration order.
#[derive(Debug, Default)]
pub struct ResourceTable {
  resources: Vec<Resource>,
  index: HashMap<ResourceId, usize>,
}

impl ResourceTable {
  pub fn new() -> Self {
    Self::default()
  }

  /// Declare a resource with its kind's default action.
  ///
  /// # Errors
  ///
  /// - [`ConvergeError::SchemaViolation`] when an attribute is invalid, or
  ///   when a sub-resource kind is declared outside an application.
  /// - [`ConvergeError::DuplicateResource`] when `(kind, name)` exists.
  pub fn declare(
    &mut self,
    kind: ResourceKind,
    name: impl Into<String>,
    attrs: Attributes,
  ) -> Result<ResourceHandle, ConvergeError> {
    self.declare_with_action(kind, name, schema_for(kind).default_action, attrs)
  }

  pub fn declare_with_action(
    &mut self,
    kind: ResourceKind,
    name: impl Into<String>,
    action: Action,
    attrs: Attributes,
  ) -> Result<ResourceHandle, ConvergeError> {
    let id = ResourceId::new(kind, name);

    if kind.is_sub_resource() {
      return Err(ConvergeError::SchemaViolation {
        resource: id,
        field: "kind".to_string(),
        value: format!("\"{kind}\""),
        reason: "sub-resource kinds can only be declared inside an application".to_string(),
      });
    }
    if self.index.contains_key(&id) {
      return Err(ConvergeError::DuplicateResource(id));
    }

    let attrs = validate(&id, action, attrs)?;
    let position = self.resources.len();
    trace!(resource = %id, %action, "declared resource");

    self.index.insert(id.clone(), position);
    self.resources.push(Resource::new(id, action, attrs));
    Ok(ResourceHandle(position))
  }

  /// Declare a sub-resource of the application behind `app`.
  ///
  /// Sub-resources are named after their application; a second
  /// sub-resource of the same kind gets a numeric suffix.
  pub fn declare_sub(
    &mut self,
    app: ResourceHandle,
    kind: ResourceKind,
    attrs: Attributes,
  ) -> Result<SubResourceHandle, ConvergeError> {
    let parent = &mut self.resources[app.0];

    if !parent.kind().is_composite() {
      return Err(ConvergeError::SchemaViolation {
        resource: parent.id.clone(),
        field: "sub_resources".to_string(),
        value: format!("\"{kind}\""),
        reason: format!("{} resources cannot own sub-resources", parent.kind()),
      });
    }

    let same_kind = parent.subs.iter().filter(|sub| sub.kind() == kind).count();
    let name = if same_kind == 0 {
      parent.name().to_string()
    } else {
      format!("{}-{}", parent.name(), same_kind + 1)
    };
    let id = ResourceId::new(kind, name);

    if !kind.is_sub_resource() {
      return Err(ConvergeError::SchemaViolation {
        resource: id,
        field: "kind".to_string(),
        value: format!("\"{kind}\""),
        reason: "not a sub-resource kind".to_string(),
      });
    }

    let action = schema_for(kind).default_action;
    let attrs = validate(&id, action, attrs)?;
    let index = parent.subs.len();
    trace!(resource = %id, application = %parent.id, "declared sub-resource");

    parent.subs.push(Resource::new(id, action, attrs));
    Ok(SubResourceHandle { parent: app.0, index })
  }

  pub fn get(&self, handle: ResourceHandle) -> &Resource {
    &self.resources[handle.0]
  }

  pub fn get_mut(&mut self, handle: ResourceHandle) -> &mut Resource {
    &mut self.resources[handle.0]
  }

  pub fn sub(&self, handle: SubResourceHandle) -> &Resource {
    &self.resources[handle.parent].subs[handle.index]
  }

  pub fn sub_mut(&mut self, handle: SubResourceHandle) -> &mut Resource {
    &mut self.resources[handle.parent].subs[handle.index]
  }

  pub fn handle_of(&self, id: &ResourceId) -> Option<ResourceHandle> {
    self.index.get(id).copied().map(ResourceHandle)
  }

  pub fn find(&self, id: &ResourceId) -> Option<&Resource> {
    self.index.get(id).map(|&idx| &self.resources[idx])
  }

  pub fn contains(&self, id: &ResourceId) -> bool {
    self.index.contains_key(id)
  }

  pub fn iter(&self) -> impl Iterator<Item = &Resource> {
    self.resources.iter()
  }

  pub fn len(&self) -> usize {
    self.resources.len()
  }

  pub fn is_empty(&self) -> bool {
    self.resources.is_empty()
  }

  /// Complete the table before a run.
  ///
  /// - fills run-dependent defaults of sub-resources
  /// - builds each application's [`CompositePlan`]
  /// - declares the process-manager services sub-resources own, so that
  ///   restart notifications always have a target
  /// - validates `depends_on` edges and declared notification targets
  ///
  /// Calling it twice is harmless.
  pub fn finalize(&mut self) -> Result<(), ConvergeError> {
    let mut owned_services: Vec<(String, ResourceId)> = Vec::new();

    for app in self.resources.iter_mut().filter(|r| r.kind().is_composite()) {
      let path = app.attrs.str("path").unwrap_or_default().to_string();
      for sub in &mut app.subs {
        if sub.kind() == ResourceKind::Django && !sub.attrs.contains("virtualenv") {
          sub.attrs.set("virtualenv", format!("{path}/shared/env"));
        }
        for service in owned_service_names(app.id.name.as_str(), sub) {
          owned_services.push((service, app.id.clone()));
        }
      }

      let plan = CompositePlan::build(app)?;
      for dep in &plan.external_deps {
        if !app.depends_on.contains(dep) {
          app.depends_on.push(dep.clone());
        }
      }
      app.composite = Some(plan);
    }

    for (service, app_id) in owned_services {
      let id = ResourceId::new(ResourceKind::Service, service.clone());
      if self.index.contains_key(&id) {
        continue;
      }
      let handle = self.declare_with_action(
        ResourceKind::Service,
        service,
        Action::Nothing,
        Attributes::new(),
      )?;
      self.get_mut(handle).depend_on(app_id);
      debug!(resource = %id, "declared service owned by application");
    }

    for resource in &self.resources {
      for dep in &resource.depends_on {
        if !self.index.contains_key(dep) {
          return Err(ConvergeError::UnknownDependency {
            resource: resource.id.clone(),
            dependency: dep.clone(),
          });
        }
      }
      for owner in std::iter::once(resource).chain(resource.subs.iter()) {
        for decl in &owner.notifies {
          if !self.index.contains_key(&decl.target) {
            return Err(ConvergeError::NotificationTargetMissing {
              source_id: owner.id.clone(),
              target: decl.target.clone(),
            });
          }
          if !schema_for(decl.target.kind).accepts_action(decl.action) {
            return Err(ConvergeError::SchemaViolation {
              resource: owner.id.clone(),
              field: "notifies".to_string(),
              value: format!("\"{}\"", decl.action),
              reason: format!("{} does not support this action", decl.target),
            });
          }
        }
      }
    }

    Ok(())
  }

  pub(crate) fn into_resources(self) -> Vec<Resource> {
    self.resources
  }
}

/// Names of the process-manager services a sub-resource enables.
pub(crate) fn owned_service_names(app_name: &str, sub: &Resource) -> Vec<String> {
  match sub.kind() {
    ResourceKind::Gunicorn => vec![app_name.to_string()],
    ResourceKind::Celery => ["celeryd", "celerybeat", "celerycam"]
      .into_iter()
      .filter(|flag| sub.attrs.get(flag).and_then(AttrValue::as_bool).unwrap_or(false))
      .map(|flag| format!("{app_name}-{flag}"))
      .collect(),
    _ => Vec::new(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn app_attrs() -> Attributes {
    Attributes::new().with("repository", "https://example.com/app1.git")
  }

  #[test]
  fn duplicate_declaration_is_rejected() {
    let mut table = ResourceTable::new();
    table.declare(ResourceKind::Package, "nginx", Attributes::new()).unwrap();
    let err = table
      .declare(ResourceKind::Package, "nginx", Attributes::new())
      .unwrap_err();
    assert!(matches!(err, ConvergeError::DuplicateResource(id) if id.to_string() == "package[nginx]"));
  }

  #[test]
  fn same_name_different_kind_is_allowed() {
    let mut table = ResourceTable::new();
    table.declare(ResourceKind::Package, "nginx", Attributes::new()).unwrap();
    table.declare(ResourceKind::Service, "nginx", Attributes::new()).unwrap();
    assert_eq!(table.len(), 2);
  }

  #[test]
  fn sub_resource_kinds_need_an_application() {
    let mut table = ResourceTable::new();
    let err = table
      .declare(ResourceKind::Gunicorn, "app1", Attributes::new().with("app_module", "django"))
      .unwrap_err();
    assert!(matches!(err, ConvergeError::SchemaViolation { field, .. } if field == "kind"));
  }

  #[test]
  fn sub_resources_are_named_after_the_application() {
    let mut table = ResourceTable::new();
    let app = table.declare(ResourceKind::Application, "app1", app_attrs()).unwrap();
    let first = table
      .declare_sub(app, ResourceKind::Celery, Attributes::new().with("config", "celeryconfig"))
      .unwrap();
    let second = table
      .declare_sub(app, ResourceKind::Celery, Attributes::new().with("config", "other"))
      .unwrap();

    assert_eq!(table.sub(first).id.to_string(), "celery[app1]");
    assert_eq!(table.sub(second).id.to_string(), "celery[app1-2]");
    assert_eq!(second.parent(), app);
  }

  #[test]
  fn finalize_fills_virtualenv_and_declares_services() {
    let mut table = ResourceTable::new();
    let app = table.declare(ResourceKind::Application, "app1", app_attrs()).unwrap();
    let django = table.declare_sub(app, ResourceKind::Django, Attributes::new()).unwrap();
    table
      .declare_sub(app, ResourceKind::Gunicorn, Attributes::new().with("app_module", "django"))
      .unwrap();
    table
      .declare_sub(
        app,
        ResourceKind::Celery,
        Attributes::new()
          .with("config", "celery_settings.py")
          .with("django", true)
          .with("celerybeat", true),
      )
      .unwrap();

    table.finalize().unwrap();

    assert_eq!(table.sub(django).attrs.str("virtualenv"), Some("/srv/app1/shared/env"));
    for name in ["app1", "app1-celeryd", "app1-celerybeat"] {
      let service = table
        .find(&ResourceId::new(ResourceKind::Service, name))
        .unwrap_or_else(|| panic!("service[{name}] should be declared"));
      assert_eq!(service.action, Action::Nothing);
    }
    assert!(!table.contains(&ResourceId::new(ResourceKind::Service, "app1-celerycam")));

    let before = table.len();
    table.finalize().unwrap();
    assert_eq!(table.len(), before);
  }

  #[test]
  fn finalize_keeps_explicit_service_declarations() {
    let mut table = ResourceTable::new();
    let app = table.declare(ResourceKind::Application, "app1", app_attrs()).unwrap();
    table
      .declare_sub(app, ResourceKind::Gunicorn, Attributes::new().with("app_module", "app:wsgi"))
      .unwrap();
    table
      .declare_with_action(ResourceKind::Service, "app1", Action::Enable, Attributes::new())
      .unwrap();

    table.finalize().unwrap();

    let service = table.find(&ResourceId::new(ResourceKind::Service, "app1")).unwrap();
    assert_eq!(service.action, Action::Enable);
  }

  #[test]
  fn finalize_rejects_unknown_dependency() {
    let mut table = ResourceTable::new();
    let file = table.declare(ResourceKind::File, "/etc/motd", Attributes::new()).unwrap();
    table
      .get_mut(file)
      .depend_on(ResourceId::new(ResourceKind::Package, "missing"));

    assert!(matches!(
      table.finalize(),
      Err(ConvergeError::UnknownDependency { .. })
    ));
  }

  #[test]
  fn finalize_rejects_missing_notification_target() {
    let mut table = ResourceTable::new();
    let file = table.declare(ResourceKind::File, "/etc/nginx/nginx.conf", Attributes::new()).unwrap();
    table
      .get_mut(file)
      .notify(ResourceId::new(ResourceKind::Service, "nginx"), Action::Restart);

    let err = table.finalize().unwrap_err();
    assert_eq!(err.kind(), "notification_target_missing");
  }

  #[test]
  fn finalize_rejects_unsupported_notification_action() {
    let mut table = ResourceTable::new();
    table.declare(ResourceKind::Package, "nginx", Attributes::new()).unwrap();
    let file = table.declare(ResourceKind::File, "/etc/nginx/nginx.conf", Attributes::new()).unwrap();
    table
      .get_mut(file)
      .notify(ResourceId::new(ResourceKind::Package, "nginx"), Action::Restart);

    assert!(matches!(
      table.finalize(),
      Err(ConvergeError::SchemaViolation { field, .. }) if field == "notifies"
    ));
  }
}

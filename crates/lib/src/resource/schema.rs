//! Per-kind attribute schemas.
//!
//! Every [`ResourceKind`] has a static [`KindSchema`] listing the actions it
//! accepts and the attributes it knows. Declared attributes are validated
//! against it (unknown fields, types, enum values, required fields) before
//! defaults are filled in.

use crate::error::ConvergeError;

use super::types::{Action, AttrValue, Attributes, ResourceId, ResourceKind};

/// The accepted shape of an attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
  Str,
  Bool,
  Int,
  List,
  Map,
  /// A flag that may also carry a custom string (`collectstatic`).
  StrOrBool,
}

impl AttrType {
  fn accepts(&self, value: &AttrValue) -> bool {
    matches!(
      (self, value),
      (AttrType::Str, AttrValue::Str(_))
        | (AttrType::Bool, AttrValue::Bool(_))
        | (AttrType::Int, AttrValue::Int(_))
        | (AttrType::List, AttrValue::List(_))
        | (AttrType::Map, AttrValue::Map(_))
        | (AttrType::StrOrBool, AttrValue::Str(_) | AttrValue::Bool(_))
    )
  }

  fn describe(&self) -> &'static str {
    match self {
      AttrType::Str => "a string",
      AttrType::Bool => "a boolean",
      AttrType::Int => "an integer",
      AttrType::List => "a list",
      AttrType::Map => "a map",
      AttrType::StrOrBool => "a string or boolean",
    }
  }
}

/// Default applied when an attribute is not declared.
#[derive(Debug, Clone, Copy)]
pub enum DefaultValue {
  None,
  Bool(bool),
  Int(i64),
  Str(&'static str),
  /// The resource name.
  Name,
  /// A string with `{name}` replaced by the resource name.
  Format(&'static str),
  EmptyMap,
}

impl DefaultValue {
  fn resolve(&self, name: &str) -> Option<AttrValue> {
    match self {
      DefaultValue::None => None,
      DefaultValue::Bool(b) => Some(AttrValue::Bool(*b)),
      DefaultValue::Int(n) => Some(AttrValue::Int(*n)),
      DefaultValue::Str(s) => Some(AttrValue::Str((*s).to_string())),
      DefaultValue::Name => Some(AttrValue::Str(name.to_string())),
      DefaultValue::Format(fmt) => Some(AttrValue::Str(fmt.replace("{name}", name))),
      DefaultValue::EmptyMap => Some(AttrValue::Map(Default::default())),
    }
  }
}

/// Schema entry for one attribute.
#[derive(Debug, Clone, Copy)]
pub struct AttrSpec {
  pub name: &'static str,
  pub ty: AttrType,
  pub required: bool,
  pub default: DefaultValue,
  /// Allowed values for string attributes. Empty means unrestricted.
  pub allowed: &'static [&'static str],
}

const fn attr(name: &'static str, ty: AttrType) -> AttrSpec {
  AttrSpec {
    name,
    ty,
    required: false,
    default: DefaultValue::None,
    allowed: &[],
  }
}

const fn required(name: &'static str, ty: AttrType) -> AttrSpec {
  AttrSpec {
    name,
    ty,
    required: true,
    default: DefaultValue::None,
    allowed: &[],
  }
}

const fn defaulted(name: &'static str, ty: AttrType, default: DefaultValue) -> AttrSpec {
  AttrSpec {
    name,
    ty,
    required: false,
    default,
    allowed: &[],
  }
}

const fn one_of(name: &'static str, default: &'static str, allowed: &'static [&'static str]) -> AttrSpec {
  AttrSpec {
    name,
    ty: AttrType::Str,
    required: false,
    default: DefaultValue::Str(default),
    allowed,
  }
}

/// The schema of one resource kind.
#[derive(Debug)]
pub struct KindSchema {
  pub kind: ResourceKind,
  pub actions: &'static [Action],
  pub default_action: Action,
  pub attrs: &'static [AttrSpec],
}

impl KindSchema {
  pub fn attr(&self, name: &str) -> Option<&AttrSpec> {
    self.attrs.iter().find(|spec| spec.name == name)
  }

  pub fn accepts_action(&self, action: Action) -> bool {
    self.actions.contains(&action)
  }
}

use AttrType::{Bool, Int, List, Map, Str, StrOrBool};

static PACKAGE: KindSchema = KindSchema {
  kind: ResourceKind::Package,
  actions: &[Action::Install, Action::Upgrade, Action::Remove, Action::Nothing],
  default_action: Action::Install,
  attrs: &[defaulted("package_name", Str, DefaultValue::Name), attr("version", Str)],
};

static FILE: KindSchema = KindSchema {
  kind: ResourceKind::File,
  actions: &[Action::Create, Action::Delete, Action::Nothing],
  default_action: Action::Create,
  attrs: &[
    defaulted("path", Str, DefaultValue::Name),
    defaulted("content", Str, DefaultValue::Str("")),
    defaulted("mode", Str, DefaultValue::Str("0644")),
    attr("owner", Str),
    attr("group", Str),
  ],
};

static TEMPLATE: KindSchema = KindSchema {
  kind: ResourceKind::Template,
  actions: &[Action::Create, Action::Delete, Action::Nothing],
  default_action: Action::Create,
  attrs: &[
    defaulted("path", Str, DefaultValue::Name),
    required("source", Str),
    defaulted("variables", Map, DefaultValue::EmptyMap),
    defaulted("mode", Str, DefaultValue::Str("0644")),
    attr("owner", Str),
    attr("group", Str),
  ],
};

static SERVICE: KindSchema = KindSchema {
  kind: ResourceKind::Service,
  actions: &[Action::Enable, Action::Disable, Action::Restart, Action::Nothing],
  default_action: Action::Enable,
  attrs: &[
    defaulted("service_name", Str, DefaultValue::Name),
    attr("command", Str),
    attr("directory", Str),
    defaulted("environment", Map, DefaultValue::EmptyMap),
    attr("user", Str),
    defaulted("autostart", Bool, DefaultValue::Bool(false)),
  ],
};

static EXECUTE: KindSchema = KindSchema {
  kind: ResourceKind::Execute,
  actions: &[Action::Run, Action::Nothing],
  default_action: Action::Run,
  attrs: &[
    required("command", Str),
    attr("cwd", Str),
    defaulted("environment", Map, DefaultValue::EmptyMap),
    attr("user", Str),
    attr("creates", Str),
    attr("unless", Str),
  ],
};

static APPLICATION: KindSchema = KindSchema {
  kind: ResourceKind::Application,
  actions: &[Action::Deploy, Action::Nothing],
  default_action: Action::Deploy,
  attrs: &[
    defaulted("path", Str, DefaultValue::Format("/srv/{name}")),
    defaulted("owner", Str, DefaultValue::Str("nobody")),
    defaulted("group", Str, DefaultValue::Str("nogroup")),
    required("repository", Str),
    defaulted("revision", Str, DefaultValue::Str("master")),
    defaulted("migrate", Bool, DefaultValue::Bool(false)),
    defaulted("symlink_before_migrate", Map, DefaultValue::EmptyMap),
    defaulted("symlinks", Map, DefaultValue::EmptyMap),
    defaulted("environment", Map, DefaultValue::EmptyMap),
  ],
};

static DJANGO: KindSchema = KindSchema {
  kind: ResourceKind::Django,
  actions: &[Action::Deploy, Action::Nothing],
  default_action: Action::Deploy,
  attrs: &[
    attr("requirements", Str),
    attr("settings_template", Str),
    defaulted("settings", Map, DefaultValue::EmptyMap),
    defaulted("local_settings_file", Str, DefaultValue::Str("local_settings.py")),
    defaulted("debug", Bool, DefaultValue::Bool(false)),
    defaulted("collectstatic", StrOrBool, DefaultValue::Bool(false)),
    attr("migration_command", Str),
    attr("database_host", Str),
    attr("database_master_role", Str),
    attr("database_name", Str),
    attr("database_engine", Str),
    attr("database_username", Str),
    attr("database_password", Str),
    attr("allowed_hosts", Str),
    defaulted("packages", Map, DefaultValue::EmptyMap),
    attr("virtualenv", Str),
  ],
};

static GUNICORN: KindSchema = KindSchema {
  kind: ResourceKind::Gunicorn,
  actions: &[Action::Deploy, Action::Nothing],
  default_action: Action::Deploy,
  attrs: &[
    required("app_module", Str),
    attr("settings_template", Str),
    defaulted("host", Str, DefaultValue::Str("0.0.0.0")),
    defaulted("port", Int, DefaultValue::Int(8080)),
    attr("bind", Str),
    defaulted("backlog", Int, DefaultValue::Int(2048)),
    defaulted("workers", Int, DefaultValue::Int(8)),
    one_of("worker_class", "sync", &["sync", "eventlet", "gevent", "tornado", "gthread"]),
    defaulted("max_requests", Int, DefaultValue::Int(0)),
    defaulted("timeout", Int, DefaultValue::Int(30)),
    defaulted("keepalive", Int, DefaultValue::Int(2)),
    defaulted("preload_app", Bool, DefaultValue::Bool(false)),
    attr("pidfile", Str),
    attr("virtualenv", Str),
    defaulted("environment", Map, DefaultValue::EmptyMap),
    attr("directory", Str),
    defaulted("packages", Map, DefaultValue::EmptyMap),
    attr("requirements", Str),
  ],
};

static CELERY: KindSchema = KindSchema {
  kind: ResourceKind::Celery,
  actions: &[Action::Deploy, Action::Nothing],
  default_action: Action::Deploy,
  attrs: &[
    required("config", Str),
    attr("template", Str),
    defaulted("django", Bool, DefaultValue::Bool(false)),
    defaulted("celeryd", Bool, DefaultValue::Bool(true)),
    defaulted("celerybeat", Bool, DefaultValue::Bool(false)),
    defaulted("celerycam", Bool, DefaultValue::Bool(false)),
    attr("camera_class", Str),
    defaulted("enable_events", Bool, DefaultValue::Bool(false)),
    defaulted("environment", Map, DefaultValue::EmptyMap),
    attr("queues", List),
    defaulted("broker", Map, DefaultValue::EmptyMap),
    defaulted("results", Map, DefaultValue::EmptyMap),
  ],
};

/// The schema for `kind`.
pub fn schema_for(kind: ResourceKind) -> &'static KindSchema {
  match kind {
    ResourceKind::Package => &PACKAGE,
    ResourceKind::File => &FILE,
    ResourceKind::Template => &TEMPLATE,
    ResourceKind::Service => &SERVICE,
    ResourceKind::Execute => &EXECUTE,
    ResourceKind::Application => &APPLICATION,
    ResourceKind::Django => &DJANGO,
    ResourceKind::Gunicorn => &GUNICORN,
    ResourceKind::Celery => &CELERY,
  }
}

/// Validate `attrs` for `id` and fill in defaults.
///
/// # Errors
///
/// Returns [`ConvergeError::SchemaViolation`] for the first offending field.
pub fn validate(id: &ResourceId, action: Action, mut attrs: Attributes) -> Result<Attributes, ConvergeError> {
  let schema = schema_for(id.kind);
  let violation = |field: &str, value: String, reason: String| ConvergeError::SchemaViolation {
    resource: id.clone(),
    field: field.to_string(),
    value,
    reason,
  };

  if !schema.accepts_action(action) {
    let allowed = schema.actions.iter().map(Action::as_str).collect::<Vec<_>>().join(", ");
    return Err(violation(
      "action",
      action.to_string(),
      format!("expected one of: {allowed}"),
    ));
  }

  for (key, value) in attrs.iter() {
    let Some(spec) = schema.attr(key) else {
      return Err(violation(key, value.to_string(), format!("unknown field for {}", id.kind)));
    };
    if !spec.ty.accepts(value) {
      return Err(violation(
        key,
        value.to_string(),
        format!("expected {}, got {}", spec.ty.describe(), value.type_name()),
      ));
    }
    if !spec.allowed.is_empty()
      && let Some(s) = value.as_str()
      && !spec.allowed.contains(&s)
    {
      return Err(violation(
        key,
        value.to_string(),
        format!("expected one of: {}", spec.allowed.join(", ")),
      ));
    }
  }

  for spec in schema.attrs {
    if attrs.contains(spec.name) {
      continue;
    }
    if spec.required {
      return Err(violation(spec.name, "null".to_string(), "required field is missing".to_string()));
    }
    if let Some(value) = spec.default.resolve(&id.name) {
      attrs.set(spec.name, value);
    }
  }

  validate_kind_rules(id, action, &attrs)?;

  Ok(attrs)
}

fn validate_kind_rules(id: &ResourceId, action: Action, attrs: &Attributes) -> Result<(), ConvergeError> {
  match id.kind {
    ResourceKind::Execute if action == Action::Run && !attrs.contains("creates") && !attrs.contains("unless") => {
      Err(ConvergeError::SchemaViolation {
        resource: id.clone(),
        field: "creates".to_string(),
        value: "null".to_string(),
        reason: "a command run on every pass must be guarded by `creates` or `unless`".to_string(),
      })
    }
    ResourceKind::File | ResourceKind::Template => {
      let mode = attrs.str("mode").unwrap_or("0644");
      if parse_mode(mode).is_none() {
        return Err(ConvergeError::SchemaViolation {
          resource: id.clone(),
          field: "mode".to_string(),
          value: format!("\"{mode}\""),
          reason: "expected an octal file mode".to_string(),
        });
      }
      Ok(())
    }
    ResourceKind::Celery => {
      if let Some(queues) = attrs.list("queues")
        && queues.iter().any(|q| q.as_str().is_none())
      {
        return Err(ConvergeError::SchemaViolation {
          resource: id.clone(),
          field: "queues".to_string(),
          value: attrs.get("queues").map(ToString::to_string).unwrap_or_default(),
          reason: "expected a list of queue names".to_string(),
        });
      }
      Ok(())
    }
    _ => Ok(()),
  }
}

/// Parse an octal mode string such as `"0644"` or `"440"`.
pub fn parse_mode(mode: &str) -> Option<u32> {
  if mode.is_empty() || mode.len() > 4 {
    return None;
  }
  u32::from_str_radix(mode, 8).ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn id(kind: ResourceKind, name: &str) -> ResourceId {
    ResourceId::new(kind, name)
  }

  fn field_of(err: ConvergeError) -> String {
    match err {
      ConvergeError::SchemaViolation { field, .. } => field,
      other => panic!("expected schema violation, got {other:?}"),
    }
  }

  #[test]
  fn gunicorn_defaults_are_filled() {
    let attrs = validate(
      &id(ResourceKind::Gunicorn, "app1"),
      Action::Deploy,
      Attributes::new().with("app_module", "django"),
    )
    .unwrap();

    assert_eq!(attrs.int("port"), Some(8080));
    assert_eq!(attrs.int("backlog"), Some(2048));
    assert_eq!(attrs.int("workers"), Some(8));
    assert_eq!(attrs.int("timeout"), Some(30));
    assert_eq!(attrs.int("keepalive"), Some(2));
    assert_eq!(attrs.str("worker_class"), Some("sync"));
    assert_eq!(attrs.str("host"), Some("0.0.0.0"));
  }

  #[test]
  fn application_defaults_use_name() {
    let attrs = validate(
      &id(ResourceKind::Application, "app1"),
      Action::Deploy,
      Attributes::new().with("repository", "https://example.com/app1.git"),
    )
    .unwrap();

    assert_eq!(attrs.str("path"), Some("/srv/app1"));
    assert_eq!(attrs.str("owner"), Some("nobody"));
    assert_eq!(attrs.str("group"), Some("nogroup"));
    assert_eq!(attrs.str("revision"), Some("master"));
    assert!(!attrs.flag("migrate"));
  }

  #[test]
  fn wrong_type_is_rejected() {
    let err = validate(
      &id(ResourceKind::Gunicorn, "app1"),
      Action::Deploy,
      Attributes::new().with("app_module", "django").with("workers", "eight"),
    )
    .unwrap_err();
    assert_eq!(field_of(err), "workers");
  }

  #[test]
  fn enum_value_is_checked() {
    let err = validate(
      &id(ResourceKind::Gunicorn, "app1"),
      Action::Deploy,
      Attributes::new().with("app_module", "x").with("worker_class", "fibers"),
    )
    .unwrap_err();
    assert_eq!(field_of(err), "worker_class");
  }

  #[test]
  fn unknown_field_is_rejected() {
    let err = validate(
      &id(ResourceKind::Package, "nginx"),
      Action::Install,
      Attributes::new().with("flavour", "mainline"),
    )
    .unwrap_err();
    assert_eq!(field_of(err), "flavour");
  }

  #[test]
  fn required_field_is_enforced() {
    let err = validate(&id(ResourceKind::Celery, "app1"), Action::Deploy, Attributes::new()).unwrap_err();
    assert_eq!(field_of(err), "config");
  }

  #[test]
  fn unsupported_action_is_rejected() {
    let err = validate(&id(ResourceKind::File, "/etc/motd"), Action::Restart, Attributes::new()).unwrap_err();
    assert_eq!(field_of(err), "action");
  }

  #[test]
  fn unguarded_execute_is_rejected() {
    let err = validate(
      &id(ResourceKind::Execute, "apt-update"),
      Action::Run,
      Attributes::new().with("command", "apt-get update"),
    )
    .unwrap_err();
    assert_eq!(field_of(err), "creates");

    validate(
      &id(ResourceKind::Execute, "apt-update"),
      Action::Run,
      Attributes::new()
        .with("command", "apt-get update")
        .with("creates", "/var/lib/apt/periodic/update-success-stamp"),
    )
    .unwrap();
  }

  #[test]
  fn collectstatic_accepts_flag_or_command() {
    for value in [AttrValue::Bool(true), AttrValue::Str("collectstatic --noinput".into())] {
      validate(
        &id(ResourceKind::Django, "app1"),
        Action::Deploy,
        Attributes::new().with("collectstatic", value),
      )
      .unwrap();
    }
  }

  #[test]
  fn file_mode_must_be_octal() {
    let err = validate(
      &id(ResourceKind::File, "/tmp/x"),
      Action::Create,
      Attributes::new().with("mode", "0999"),
    )
    .unwrap_err();
    assert_eq!(field_of(err), "mode");
    assert_eq!(parse_mode("440"), Some(0o440));
  }
}

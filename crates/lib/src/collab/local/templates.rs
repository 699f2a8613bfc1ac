//! Directory-backed template renderer.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::collab::{CollabError, TemplateRenderer, TemplateVars};
use crate::placeholder::{self, PlaceholderError, Resolver};
use crate::resource::AttrValue;

const GUNICORN_CONFIG: &str = r#"# Managed by convoy.
bind = "$${var:listen}"
backlog = $${var:backlog}
workers = $${var:workers}
worker_class = "$${var:worker_class}"
max_requests = $${var:max_requests}
timeout = $${var:timeout}
keepalive = $${var:keepalive}
preload_app = "$${var:preload_app}" == "true"
pidfile = "$${var:pidfile}" or None
"#;

const DJANGO_SETTINGS: &str = r#"# Managed by convoy.
DEBUG = "$${var:debug}" == "true"

DATABASES = {
    "default": {
        "ENGINE": "$${var:database.settings.engine}",
        "NAME": "$${var:database.settings.database}",
        "USER": "$${var:database.settings.username}",
        "PASSWORD": "$${var:database.settings.password}",
        "HOST": "$${var:database.host}",
    }
}
"#;

const CELERY_CONFIG: &str = r#"# Managed by convoy.
BROKER_TRANSPORT = "$${var:broker.transport}"
BROKER_HOST = "$${var:broker.host}"
CELERY_RESULT_BACKEND = "$${var:results_backend}" or None
"#;

/// Bodies used when the template directory has no file of that name.
fn builtin_template(name: &str) -> Option<&'static str> {
  match name {
    "gunicorn_config.py" => Some(GUNICORN_CONFIG),
    "settings.py" => Some(DJANGO_SETTINGS),
    "celeryconfig.py" => Some(CELERY_CONFIG),
    _ => None,
  }
}

/// Renders templates stored under a directory, substituting `$${var:...}`.
///
/// The default gunicorn, django and celery templates are built in and can
/// be replaced by a file of the same name.
#[derive(Debug, Clone)]
pub struct DirTemplates {
  dir: PathBuf,
}

impl DirTemplates {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into() }
  }
}

#[async_trait]
impl TemplateRenderer for DirTemplates {
  async fn render(&self, template: &str, vars: &TemplateVars) -> Result<String, CollabError> {
    let path = self.dir.join(template);
    let body = match tokio::fs::read_to_string(&path).await {
      Ok(body) => body,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => match builtin_template(template) {
        Some(body) => body.to_string(),
        None => return Err(CollabError::TemplateNotFound(template.to_string())),
      },
      Err(e) => return Err(CollabError::io(path, e)),
    };
    debug!(template, path = %path.display(), "rendering template");
    render_body(template, &body, vars)
  }
}

struct VarsResolver<'a>(&'a TemplateVars);

impl Resolver for VarsResolver<'_> {
  fn resolve_var(&self, path: &str) -> Result<String, PlaceholderError> {
    let mut segments = path.split('.');
    let first = segments.next().unwrap_or_default();
    let mut value = self.0.get(first);
    for segment in segments {
      value = value.and_then(AttrValue::as_map).and_then(|map| map.get(segment));
    }
    value
      .map(AttrValue::to_plain_string)
      .ok_or_else(|| PlaceholderError::UnresolvedVar(path.to_string()))
  }
}

/// Substitute template variables into `body`.
pub fn render_body(template: &str, body: &str, vars: &TemplateVars) -> Result<String, CollabError> {
  placeholder::substitute(body, &VarsResolver(vars)).map_err(|e| CollabError::Template {
    template: template.to_string(),
    message: e.to_string(),
  })
}

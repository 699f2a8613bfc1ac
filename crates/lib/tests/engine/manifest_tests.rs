//! Manifests declared into a run and converged.

use std::sync::Arc;

use convoy_lib::collab::memory::MemoryHost;
use convoy_lib::config::StaticConfig;
use convoy_lib::manifest::Manifest;
use convoy_lib::resource::{ResourceKind, ResourceState};

use super::common::{REPO, SHA, engine, id, release};

const APP1: &str = r#"
{
  "node": {
    "name": "web1",
    "roles": ["base", "application_server"],
    "attributes": {
      "app_name": "app1",
      "repository": "https://git.example.com/app1.git",
      "postgresql": { "database": "app1" }
    }
  },
  "roles": {
    "base": { "default_attributes": { "packages": { "libpq": "libpq-dev" } } },
    "application_server": { "default_attributes": { "site_domain": "app1.example.com" } }
  },
  "resources": [
    { "kind": "package", "name": "$${node:packages.libpq}" }
  ],
  "applications": [
    {
      "name": "$${node:app_name}",
      "attributes": { "repository": "$${node:repository}", "migrate": true },
      "depends_on": ["package[libpq-dev]"],
      "sub_resources": [
        {
          "kind": "django",
          "attributes": {
            "database_master_role": "database_master",
            "database_name": "$${node:postgresql.database}",
            "database_password": "$${secret:postgres.password}",
            "allowed_hosts": "$${node:site_domain}",
            "settings_template": "settings.py"
          }
        },
        {
          "kind": "gunicorn",
          "attributes": { "app_module": "django", "workers": 4 }
        },
        {
          "kind": "celery",
          "attributes": { "config": "celeryconfig.py" },
          "only_if": { "role": "celery_worker" }
        }
      ]
    }
  ]
}
"#;

fn host() -> Arc<MemoryHost> {
  let host = MemoryHost::new()
    .with_source_file(REPO, "requirements.txt", "Django==1.4\n")
    .with_role("database_master", "10.0.0.7")
    .with_template(
      "settings.py",
      "NAME = \"$${var:database.settings.database}\"\nPASSWORD = \"$${var:database.settings.password}\"\nHOST = \"$${var:database.host}\"\nALLOWED_HOSTS = [\"$${var:allowed_hosts}\"]\n",
    )
    .with_template("gunicorn_config.py", "workers = $${var:workers}\n");
  host.set_revision(REPO, "master", SHA);
  Arc::new(host)
}

#[tokio::test]
async fn app1_manifest_converges() {
  let host = host();
  let manifest = Manifest::parse(APP1).unwrap();
  let config = manifest.config();
  let secrets = StaticConfig::new().with("postgres.password", "hunter2");
  let table = manifest.declare(&config, &secrets).unwrap();

  let report = engine(&host, config).converge(table).await.unwrap();

  assert!(report.is_success(), "{:?}", report.errors);
  let ids: Vec<String> = report.resources.iter().map(|r| r.id.to_string()).collect();
  assert_eq!(
    ids,
    vec![
      "package[libpq-dev]",
      "application[app1]",
      "service[app1]",
      "service[app1-celeryd]"
    ]
  );
  assert_eq!(host.package_version("libpq-dev").as_deref(), Some("1.0"));

  assert_eq!(
    host.file_contents("/srv/app1/shared/local_settings.py").unwrap(),
    "NAME = \"app1\"\nPASSWORD = \"hunter2\"\nHOST = \"10.0.0.7\"\nALLOWED_HOSTS = [\"app1.example.com\"]\n"
  );
  assert_eq!(
    host.file_contents("/srv/app1/shared/gunicorn_config.py").unwrap(),
    "workers = 4\n"
  );
  assert!(
    host
      .service("app1")
      .unwrap()
      .command
      .starts_with("/srv/app1/shared/env/bin/gunicorn app1.wsgi:application")
  );
  assert_eq!(
    report.state_of(&id(ResourceKind::Celery, "app1")),
    Some(ResourceState::Skipped)
  );
  assert_eq!(report.resource(&id(ResourceKind::Application, "app1")).unwrap().revision.as_deref(), Some(SHA));
  assert_eq!(
    host.link_target("/srv/app1/current").unwrap().display().to_string(),
    release()
  );
  assert_eq!(report.notifications.len(), 1);
  assert_eq!(report.notifications[0].target, id(ResourceKind::Service, "app1"));
  assert_eq!(report.notifications[0].state, ResourceState::Applied);
}

#[tokio::test]
async fn app1_manifest_is_idempotent() {
  let host = host();
  let manifest = Manifest::parse(APP1).unwrap();
  let config = manifest.config();
  let secrets = StaticConfig::new().with("postgres.password", "hunter2");

  let first = manifest.declare(&config, &secrets).unwrap();
  engine(&host, config.clone()).converge(first).await.unwrap();
  host.clear_journal();

  let second = manifest.declare(&config, &secrets).unwrap();
  let report = engine(&host, config).converge(second).await.unwrap();

  assert!(report.is_success());
  assert_eq!(report.applied_count(), 0);
  assert!(report.notifications.is_empty());
  assert!(host.journal().is_empty(), "{:#?}", host.journal());
}

#[tokio::test]
async fn plan_orders_the_application_after_its_package() {
  let host = host();
  let manifest = Manifest::parse(APP1).unwrap();
  let config = manifest.config();
  let secrets = StaticConfig::new().with("postgres.password", "hunter2");
  let mut table = manifest.declare(&config, &secrets).unwrap();

  let waves = engine(&host, config).plan(&mut table).unwrap();

  assert_eq!(
    waves,
    vec![
      vec![id(ResourceKind::Package, "libpq-dev")],
      vec![id(ResourceKind::Application, "app1")],
      vec![id(ResourceKind::Service, "app1"), id(ResourceKind::Service, "app1-celeryd")],
    ]
  );
  assert!(host.journal().is_empty());
}

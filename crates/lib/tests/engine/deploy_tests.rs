//! Composite application deployments.

use convoy_lib::config::Config;
use convoy_lib::hooks::builtin::restart_command;
use convoy_lib::resource::{Attributes, Guard, ResourceKind, ResourceState, ResourceTable};
use convoy_lib::{RunStatus, SubResourceDecl, deploy_with};

use super::common::{REPO, SHA, app1_attrs, app1_host, engine, id, release};

fn django() -> SubResourceDecl {
  SubResourceDecl::new(ResourceKind::Django, Attributes::new().with("database_name", "app1"))
}

fn gunicorn() -> SubResourceDecl {
  SubResourceDecl::new(ResourceKind::Gunicorn, Attributes::new().with("app_module", "django"))
}

#[tokio::test]
async fn app1_deploys_django_behind_gunicorn() {
  let host = app1_host();
  let engine = engine(&host, Config::default());

  let result = deploy_with(&engine, "app1", app1_attrs(), vec![django(), gunicorn()])
    .await
    .unwrap();

  assert!(result.is_success(), "{:?}", result.report.errors);
  assert_eq!(result.state, ResourceState::Applied);
  assert_eq!(result.revision.as_deref(), Some(SHA));
  assert_eq!(result.release_path.unwrap().display().to_string(), release());
  assert_eq!(
    result.sub_resources,
    vec![
      (id(ResourceKind::Django, "app1"), ResourceState::Applied),
      (id(ResourceKind::Gunicorn, "app1"), ResourceState::Applied),
    ]
  );

  let service = host.service("app1").unwrap();
  assert_eq!(
    service.command,
    "/srv/app1/shared/env/bin/gunicorn app1.wsgi:application -c /srv/app1/shared/gunicorn_config.py"
  );
  assert_eq!(service.directory.as_deref(), Some("/srv/app1/current"));
  assert_eq!(service.user.as_deref(), Some("nobody"));
  assert_eq!(
    service.environment.get("PATH").map(String::as_str),
    Some("/srv/app1/shared/env/bin")
  );

  assert_eq!(
    host.link_target("/srv/app1/current").unwrap().display().to_string(),
    release()
  );
  assert_eq!(
    host
      .link_target(format!("{}/local_settings.py", release()))
      .unwrap()
      .display()
      .to_string(),
    "/srv/app1/shared/local_settings.py"
  );
  assert!(host.file_contents("/srv/app1/shared/local_settings.py").is_some());
  assert!(host.pip_packages("/srv/app1/shared/env").contains_key("gunicorn"));

  let commands = host.commands();
  assert!(commands.contains(&format!(
    "/srv/app1/shared/env/bin/pip install -r {}/requirements.txt",
    release()
  )));
  assert!(commands.contains(&"/srv/app1/shared/env/bin/python manage.py migrate --noinput".to_string()));

  assert_eq!(host.restarts(), vec!["app1".to_string()]);
}

#[tokio::test]
async fn phases_run_phase_major() {
  let host = app1_host();
  let engine = engine(&host, Config::default());
  deploy_with(&engine, "app1", app1_attrs(), vec![django(), gunicorn()])
    .await
    .unwrap();

  let journal = host.journal();
  let position = |prefix: &str| {
    journal
      .iter()
      .position(|entry| entry.starts_with(prefix))
      .unwrap_or_else(|| panic!("no journal entry starting with {prefix}: {journal:#?}"))
  };

  // before_compile, before_deploy, before_migrate, before_symlink, before_restart, after_restart
  assert!(position("mkdir /srv/app1") < position("run virtualenv"));
  assert!(position("run virtualenv") < position("file write /srv/app1/shared/local_settings.py"));
  assert!(position("file write /srv/app1/shared/local_settings.py") < position("service enable app1"));
  assert!(position("service enable app1") < position(&format!("checkout {REPO}@master")));
  assert!(position(&format!("checkout {REPO}@master")) < position("run /srv/app1/shared/env/bin/python manage.py migrate"));
  assert!(position("run /srv/app1/shared/env/bin/python manage.py migrate") < position("symlink /srv/app1/current"));
  assert!(position("symlink /srv/app1/current") < position("service restart app1"));
}

#[tokio::test]
async fn second_deploy_changes_nothing() {
  let host = app1_host();
  let engine = engine(&host, Config::default());
  deploy_with(&engine, "app1", app1_attrs(), vec![django(), gunicorn()])
    .await
    .unwrap();
  host.clear_journal();

  let result = deploy_with(&engine, "app1", app1_attrs(), vec![django(), gunicorn()])
    .await
    .unwrap();

  assert!(result.is_success());
  assert_eq!(result.state, ResourceState::UpToDate);
  assert_eq!(result.report.applied_count(), 0);
  assert!(
    result
      .sub_resources
      .iter()
      .all(|(_, state)| *state == ResourceState::UpToDate)
  );
  assert!(host.journal().is_empty(), "{:#?}", host.journal());
  assert!(host.restarts().is_empty());
}

#[tokio::test]
async fn new_revision_migrates_and_restarts_again() {
  let host = app1_host();
  let engine = engine(&host, Config::default());
  deploy_with(&engine, "app1", app1_attrs(), vec![django(), gunicorn()])
    .await
    .unwrap();
  host.clear_journal();

  let next = "9b8a7f6e5d4c3b2a1f0e9d8c7b6a5f4e3d2c1b0a";
  host.set_revision(REPO, "master", next);
  let result = deploy_with(&engine, "app1", app1_attrs(), vec![django(), gunicorn()])
    .await
    .unwrap();

  assert_eq!(result.state, ResourceState::Applied);
  assert_eq!(result.revision.as_deref(), Some(next));
  assert_eq!(
    host.link_target("/srv/app1/current").unwrap().display().to_string(),
    format!("/srv/app1/releases/{next}")
  );
  assert!(
    host
      .commands()
      .contains(&"/srv/app1/shared/env/bin/python manage.py migrate --noinput".to_string())
  );
  assert_eq!(host.restarts(), vec!["app1".to_string()]);
}

#[tokio::test]
async fn gunicorn_without_django_skips_the_composite() {
  let host = app1_host();
  let engine = engine(&host, Config::default());

  let mut table = ResourceTable::new();
  let app = table
    .declare(ResourceKind::Application, "app1", app1_attrs())
    .unwrap();
  table
    .declare_sub(app, ResourceKind::Gunicorn, Attributes::new().with("app_module", "django"))
    .unwrap();
  table
    .declare(ResourceKind::Package, "nginx", Attributes::new())
    .unwrap();

  let report = engine.converge(table).await.unwrap();

  assert_eq!(report.status, RunStatus::Failed);
  assert_eq!(report.exit_code(), 1);
  assert_eq!(
    report.state_of(&id(ResourceKind::Application, "app1")),
    Some(ResourceState::Failed)
  );
  assert_eq!(
    report.state_of(&id(ResourceKind::Gunicorn, "app1")),
    Some(ResourceState::Skipped)
  );
  assert_eq!(
    report.state_of(&id(ResourceKind::Package, "nginx")),
    Some(ResourceState::Applied)
  );
  assert_eq!(report.errors.len(), 1);
  assert_eq!(report.errors[0].kind, "missing_collaborator");
  assert!(!report.errors[0].fatal);

  assert!(host.journal().iter().all(|entry| !entry.contains("/srv/app1")));
}

#[tokio::test]
async fn unresolved_broker_role_aborts_the_run() {
  let host = app1_host();
  let engine = engine(&host, Config::default());

  let mut table = ResourceTable::new();
  let app = table
    .declare(ResourceKind::Application, "app2", app1_attrs())
    .unwrap();
  table
    .declare_sub(app, ResourceKind::Celery, Attributes::new().with("config", "celeryconfig.py"))
    .unwrap();
  let pkg = table
    .declare(ResourceKind::Package, "nginx", Attributes::new())
    .unwrap();
  table
    .get_mut(pkg)
    .depend_on(id(ResourceKind::Application, "app2"));

  let report = engine.converge(table).await.unwrap();

  assert_eq!(report.status, RunStatus::Aborted);
  assert_eq!(report.exit_code(), 2);
  assert_eq!(report.errors.len(), 1);
  assert_eq!(report.errors[0].kind, "unresolved_role");
  assert!(report.errors[0].fatal);
  assert!(report.errors[0].message.contains("app2_task_broker"));
  assert_eq!(
    report.state_of(&id(ResourceKind::Package, "nginx")),
    Some(ResourceState::Skipped)
  );
  assert!(host.package_version("nginx").is_none());
}

#[tokio::test]
async fn celery_resolves_the_broker_and_runs_its_programs() {
  let host = app1_host();
  let engine = engine(&host, Config::default());

  let celery = SubResourceDecl::new(
    ResourceKind::Celery,
    Attributes::new()
      .with("config", "celeryconfig.py")
      .with("django", true)
      .with("celerybeat", true),
  );
  let result = deploy_with(&engine, "app1", app1_attrs(), vec![django(), celery])
    .await
    .unwrap();

  assert!(result.is_success(), "{:?}", result.report.errors);
  let celeryd = host.service("app1-celeryd").unwrap();
  assert_eq!(
    celeryd.command,
    "/srv/app1/shared/env/bin/python manage.py celeryd"
  );
  assert!(host.service("app1-celerybeat").is_some());
  assert!(host.service("app1-celerycam").is_none());

  let mut restarts = host.restarts();
  restarts.sort();
  assert_eq!(restarts, vec!["app1-celerybeat".to_string(), "app1-celeryd".to_string()]);
}

#[tokio::test]
async fn guarded_sub_resource_is_skipped() {
  let host = app1_host();
  let config = Config::builder().roles(["application_server"]).build();
  let engine = engine(&host, config);

  let celery = SubResourceDecl::new(ResourceKind::Celery, Attributes::new().with("config", "celeryconfig.py"))
    .only_if(Guard::role("celery_worker"));
  let result = deploy_with(&engine, "app2", app1_attrs(), vec![django(), celery])
    .await
    .unwrap();

  assert!(result.is_success(), "{:?}", result.report.errors);
  assert_eq!(
    result.sub_resources,
    vec![
      (id(ResourceKind::Django, "app2"), ResourceState::Applied),
      (id(ResourceKind::Celery, "app2"), ResourceState::Skipped),
    ]
  );
  assert!(host.service("app2-celeryd").is_none());
  assert!(host.restarts().is_empty());
}

#[tokio::test]
async fn restart_override_replaces_service_restart() {
  let host = app1_host();
  let engine = engine(&host, Config::default());

  let gunicorn = gunicorn().with_restart(restart_command("touch tmp/restart.txt"));
  let result = deploy_with(&engine, "app1", app1_attrs(), vec![django(), gunicorn])
    .await
    .unwrap();

  assert!(result.is_success(), "{:?}", result.report.errors);
  assert!(host.commands().contains(&"touch tmp/restart.txt".to_string()));
  assert!(host.restarts().is_empty());
}

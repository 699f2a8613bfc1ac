//! Apply command integration tests.

use predicates::prelude::*;
use serde_json::json;

use super::common::TestEnv;

#[test]
fn apply_writes_files_and_is_idempotent() {
  let env = TestEnv::new();
  env.write_manifest(json!([
    { "kind": "file", "name": "$${node:root}/etc/motd", "attributes": { "content": "hello from $${node:hostname}\n" } },
    { "kind": "file", "name": "$${node:root}/etc/issue", "attributes": { "content": "web\n", "mode": "0600" } }
  ]));

  env
    .apply()
    .assert()
    .success()
    .stdout(predicate::str::contains("Run success"))
    .stdout(predicate::str::contains("Applied: 2"));
  assert_eq!(env.read("etc/motd"), "hello from web1\n");

  env
    .apply()
    .assert()
    .success()
    .stdout(predicate::str::contains("Applied: 0"))
    .stdout(predicate::str::contains("Up to date: 2"));
}

#[test]
fn apply_runs_notified_command_once() {
  let env = TestEnv::new();
  env.write_manifest(json!([
    {
      "kind": "file",
      "name": "$${node:root}/app.conf",
      "attributes": { "content": "workers = 4\n" },
      "notifies": [{ "target": "execute[reload]", "action": "run" }]
    },
    {
      "kind": "file",
      "name": "$${node:root}/extra.conf",
      "attributes": { "content": "debug = false\n" },
      "notifies": [{ "target": "execute[reload]", "action": "run" }]
    },
    {
      "kind": "execute",
      "name": "reload",
      "action": "nothing",
      "attributes": { "command": "echo reloaded >> $${node:root}/reloads" }
    }
  ]));

  env
    .apply()
    .assert()
    .success()
    .stdout(predicate::str::contains("Notifications:"));
  assert_eq!(env.read("reloads"), "reloaded\n");

  env.apply().assert().success();
  assert_eq!(env.read("reloads"), "reloaded\n");
}

#[test]
fn apply_respects_dependency_order() {
  let env = TestEnv::new();
  env.write_manifest(json!([
    {
      "kind": "execute",
      "name": "second",
      "attributes": { "command": "echo second >> $${node:root}/order", "creates": "$${node:root}/never" },
      "depends_on": ["execute[first]"]
    },
    {
      "kind": "execute",
      "name": "first",
      "attributes": { "command": "echo first >> $${node:root}/order", "creates": "$${node:root}/never" }
    }
  ]));

  env.apply().assert().success();
  assert_eq!(env.read("order"), "first\nsecond\n");
}

#[test]
fn apply_failure_exits_one_and_skips_dependents() {
  let env = TestEnv::new();
  env.write_manifest(json!([
    {
      "kind": "execute",
      "name": "broken",
      "attributes": { "command": "exit 3", "unless": "test -e $${node:root}/fixed" }
    },
    {
      "kind": "file",
      "name": "$${node:root}/after-broken",
      "depends_on": ["execute[broken]"]
    },
    { "kind": "file", "name": "$${node:root}/independent", "attributes": { "content": "ok" } }
  ]));

  env
    .apply()
    .assert()
    .code(1)
    .stdout(predicate::str::contains("dependency execute[broken] did not converge"))
    .stderr(predicate::str::contains("Run failed"));
  assert_eq!(env.read("independent"), "ok");
  assert!(!env.root().join("after-broken").exists());
}

#[test]
fn apply_guarded_command_runs_once() {
  let env = TestEnv::new();
  env.write_manifest(json!([
    {
      "kind": "execute",
      "name": "init",
      "attributes": {
        "command": "echo ran >> $${node:root}/runs && touch $${node:root}/initialized",
        "creates": "$${node:root}/initialized"
      }
    }
  ]));

  env.apply().assert().success();
  env.apply().assert().success().stdout(predicate::str::contains("Up to date: 1"));
  assert_eq!(env.read("runs"), "ran\n");
}

#[test]
fn apply_renders_templates_from_manifest_directory() {
  let env = TestEnv::new();
  env.write_file("templates/motd.tmpl", "Welcome to $${var:host}\n");
  env.write_manifest(json!([
    {
      "kind": "template",
      "name": "$${node:root}/motd",
      "attributes": { "source": "motd.tmpl", "variables": { "host": "$${node:hostname}" } }
    }
  ]));

  env.apply().assert().success();
  assert_eq!(env.read("motd"), "Welcome to web1\n");
}

#[test]
fn apply_rejects_unguarded_command() {
  let env = TestEnv::new();
  env.write_manifest(json!([
    { "kind": "execute", "name": "migrate", "attributes": { "command": "touch $${node:root}/migrated" } }
  ]));

  env
    .apply()
    .assert()
    .failure()
    .stderr(predicate::str::contains("must be guarded"));
  assert!(!env.root().join("migrated").exists());
}

#[test]
fn apply_json_report() {
  let env = TestEnv::new();
  env.write_manifest(json!([
    { "kind": "file", "name": "$${node:root}/motd", "attributes": { "content": "hi" } }
  ]));

  let output = env.apply().arg("--json").output().unwrap();
  assert!(output.status.success());

  let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(report["status"], "success");
  assert_eq!(report["resources"][0]["state"], "applied");
  assert!(report["resources"][0]["id"].as_str().unwrap().ends_with("/motd]"));
  assert!(report["duration"].is_u64());
}

#[test]
fn apply_undeclared_notification_target_fails_before_changes() {
  let env = TestEnv::new();
  env.write_manifest(json!([
    {
      "kind": "file",
      "name": "$${node:root}/motd",
      "notifies": [{ "target": "service[nginx]", "action": "restart" }]
    }
  ]));

  env
    .apply()
    .assert()
    .failure()
    .stderr(predicate::str::contains("notified undeclared resource service[nginx]"));
  assert!(!env.root().join("motd").exists());
}

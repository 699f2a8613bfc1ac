//! Shared test helpers for CLI integration tests.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

/// Isolated test environment.
///
/// Each test gets its own temporary directory holding the manifest, the
/// template directory and every path the manifest converges.
pub struct TestEnv {
  pub temp: TempDir,
  pub manifest_path: PathBuf,
}

impl TestEnv {
  pub fn new() -> Self {
    let temp = TempDir::new().unwrap();
    let manifest_path = temp.path().join("convoy.json");
    Self { temp, manifest_path }
  }

  /// Directory converged resources write into, exposed to the manifest as
  /// the `root` node attribute.
  pub fn root(&self) -> PathBuf {
    let p = self.temp.path().join("root");
    std::fs::create_dir_all(&p).unwrap();
    dunce::canonicalize(&p).unwrap_or(p)
  }

  /// Write `resources` into a manifest whose node carries `root` and
  /// `hostname` attributes.
  pub fn write_manifest(&self, resources: Value) {
    let manifest = serde_json::json!({
      "node": {
        "name": "web1",
        "attributes": {
          "hostname": "web1",
          "root": self.root().display().to_string()
        }
      },
      "resources": resources
    });
    std::fs::write(&self.manifest_path, serde_json::to_string_pretty(&manifest).unwrap()).unwrap();
  }

  /// Write a file relative to the temp directory.
  pub fn write_file(&self, relative_path: &str, content: &str) {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
  }

  pub fn read(&self, path: impl AsRef<Path>) -> String {
    std::fs::read_to_string(self.root().join(path)).unwrap()
  }

  /// `convoy apply` on this environment's manifest.
  pub fn apply(&self) -> Command {
    let mut cmd = cargo_bin_cmd!("convoy");
    cmd.arg("apply").arg(&self.manifest_path).arg("-j").arg("2");
    cmd
  }
}

//! Shared helpers for engine integration tests.

use std::sync::Arc;

use convoy_lib::collab::Collaborators;
use convoy_lib::collab::memory::MemoryHost;
use convoy_lib::config::Config;
use convoy_lib::resource::{Attributes, ResourceId, ResourceKind};
use convoy_lib::{Engine, ExecuteConfig};

pub const REPO: &str = "https://git.example.com/app1.git";
pub const SHA: &str = "3f2a9c1d7e4b5a6c8d9e0f1a2b3c4d5e6f7a8b9c";

/// A host with the app1 repository at a known revision.
pub fn app1_host() -> Arc<MemoryHost> {
  let host = MemoryHost::new()
    .with_source_file(REPO, "requirements.txt", "Django==1.4\n")
    .with_source_file(REPO, "manage.py", "")
    .with_role("app1_task_broker", "10.0.0.5");
  host.set_revision(REPO, "master", SHA);
  Arc::new(host)
}

pub fn engine(host: &Arc<MemoryHost>, config: Config) -> Engine {
  Engine::new(config, Collaborators::memory(host.clone())).with_options(ExecuteConfig::sequential())
}

pub fn app1_attrs() -> Attributes {
  Attributes::new()
    .with("repository", REPO)
    .with("revision", "master")
    .with("migrate", true)
}

pub fn id(kind: ResourceKind, name: &str) -> ResourceId {
  ResourceId::new(kind, name)
}

pub fn release() -> String {
  format!("/srv/app1/releases/{SHA}")
}

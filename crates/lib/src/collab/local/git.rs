//! Source checkouts with the git command line.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::collab::{CollabError, CommandRunner, CommandSpec, FileStore, SourceFetcher};

#[derive(Clone)]
pub struct GitSource {
  runner: Arc<dyn CommandRunner>,
  files: Arc<dyn FileStore>,
}

impl GitSource {
  pub fn new(runner: Arc<dyn CommandRunner>, files: Arc<dyn FileStore>) -> Self {
    Self { runner, files }
  }

  async fn git(&self, dest: &Path, args: &str) -> Result<String, CollabError> {
    self.runner.run(&CommandSpec::new(format!("git {args}")).cwd(dest)).await
  }
}

#[async_trait]
impl SourceFetcher for GitSource {
  async fn clone_or_update(&self, repository: &str, revision: &str, dest: &Path) -> Result<String, CollabError> {
    let source_err = |e: CollabError| CollabError::Source {
      repository: repository.to_string(),
      message: e.to_string(),
    };

    if self.files.exists(&dest.join(".git")).await? {
      self.git(dest, "fetch --tags --prune origin").await.map_err(source_err)?;
    } else {
      info!(repository, dest = %dest.display(), "cloning repository");
      let parent = dest.parent().unwrap_or(dest);
      self
        .runner
        .run(&CommandSpec::new(format!("git clone --quiet {repository} {}", dest.display())).cwd(parent))
        .await
        .map_err(source_err)?;
    }

    // Branch names resolve through the remote; tags and shas resolve directly.
    let checkout = format!(
      "checkout --quiet --force --detach origin/{revision} 2>/dev/null || git checkout --quiet --force --detach {revision}"
    );
    self.git(dest, &checkout).await.map_err(source_err)?;
    self.git(dest, "rev-parse HEAD").await.map_err(source_err)
  }

  async fn deployed_revision(&self, dest: &Path) -> Result<Option<String>, CollabError> {
    if !self.files.exists(&dest.join(".git")).await? {
      return Ok(None);
    }
    self.git(dest, "rev-parse HEAD").await.map(Some)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::collab::memory::MemoryHost;

  #[tokio::test]
  async fn clones_then_fetches() {
    let host = Arc::new(MemoryHost::new());
    host.on_command("git rev-parse", Ok("0123abcd"));
    let git = GitSource::new(host.clone(), host.clone());
    let dest = Path::new("/srv/app1/shared/cached-copy");

    assert_eq!(git.deployed_revision(dest).await.unwrap(), None);
    let sha = git.clone_or_update("https://example.com/app1.git", "master", dest).await.unwrap();
    assert_eq!(sha, "0123abcd");
    assert!(host.commands()[0].starts_with("git clone --quiet https://example.com/app1.git"));

    // Pretend the clone produced a repository.
    host.write(&dest.join(".git/HEAD"), b"ref", &Default::default()).await.unwrap();
    git.clone_or_update("https://example.com/app1.git", "master", dest).await.unwrap();
    assert!(host.commands().iter().any(|c| c == "git fetch --tags --prune origin"));
    assert_eq!(git.deployed_revision(dest).await.unwrap().as_deref(), Some("0123abcd"));
  }
}

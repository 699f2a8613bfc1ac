//! Filesystem access on the local host.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::collab::{CollabError, FileMeta, FileStore};
use crate::util::hash::{ContentHash, hash_file};

/// [`FileStore`] over the real filesystem.
///
/// Writes go to a sibling temporary file that is renamed into place, so a
/// reader never observes a half-written file.
#[derive(Debug, Clone, Default)]
pub struct LocalFiles;

impl LocalFiles {
  pub fn new() -> Self {
    Self
  }
}

fn not_found_as_none<T>(result: std::io::Result<T>, path: &Path) -> Result<Option<T>, CollabError> {
  match result {
    Ok(value) => Ok(Some(value)),
    Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
    Err(e) => Err(CollabError::io(path, e)),
  }
}

#[async_trait]
impl FileStore for LocalFiles {
  async fn read(&self, path: &Path) -> Result<Option<Vec<u8>>, CollabError> {
    not_found_as_none(fs::read(path).await, path)
  }

  async fn digest(&self, path: &Path) -> Result<Option<ContentHash>, CollabError> {
    let owned = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || hash_file(&owned))
      .await
      .map_err(|e| CollabError::io(path, std::io::Error::other(e)))?;
    not_found_as_none(result, path)
  }

  async fn exists(&self, path: &Path) -> Result<bool, CollabError> {
    Ok(not_found_as_none(fs::symlink_metadata(path).await, path)?.is_some())
  }

  async fn metadata(&self, path: &Path) -> Result<Option<FileMeta>, CollabError> {
    let Some(metadata) = not_found_as_none(fs::symlink_metadata(path).await, path)? else {
      return Ok(None);
    };
    Ok(Some(meta_of(&metadata).await))
  }

  async fn write(&self, path: &Path, contents: &[u8], meta: &FileMeta) -> Result<(), CollabError> {
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).await.map_err(|e| CollabError::io(parent, e))?;
    }

    let tmp = temp_sibling(path);
    fs::write(&tmp, contents).await.map_err(|e| CollabError::io(&tmp, e))?;
    if let Err(e) = apply_meta(&tmp, meta).await {
      let _ = fs::remove_file(&tmp).await;
      return Err(e);
    }
    fs::rename(&tmp, path).await.map_err(|e| CollabError::io(path, e))?;

    debug!(path = %path.display(), bytes = contents.len(), "wrote file");
    Ok(())
  }

  async fn remove(&self, path: &Path) -> Result<bool, CollabError> {
    let Some(metadata) = not_found_as_none(fs::symlink_metadata(path).await, path)? else {
      return Ok(false);
    };
    let result = if metadata.is_dir() {
      fs::remove_dir_all(path).await
    } else {
      fs::remove_file(path).await
    };
    result.map_err(|e| CollabError::io(path, e))?;
    debug!(path = %path.display(), "removed");
    Ok(true)
  }

  async fn create_dir_all(&self, path: &Path, meta: &FileMeta) -> Result<bool, CollabError> {
    if let Some(metadata) = not_found_as_none(fs::metadata(path).await, path)?
      && metadata.is_dir()
    {
      return Ok(false);
    }
    fs::create_dir_all(path).await.map_err(|e| CollabError::io(path, e))?;
    apply_meta(path, meta).await?;
    debug!(path = %path.display(), "created directory");
    Ok(true)
  }

  async fn read_link(&self, path: &Path) -> Result<Option<PathBuf>, CollabError> {
    let Some(metadata) = not_found_as_none(fs::symlink_metadata(path).await, path)? else {
      return Ok(None);
    };
    if !metadata.file_type().is_symlink() {
      return Ok(None);
    }
    fs::read_link(path).await.map(Some).map_err(|e| CollabError::io(path, e))
  }

  async fn symlink(&self, target: &Path, link: &Path) -> Result<(), CollabError> {
    self.remove(link).await?;
    if let Some(parent) = link.parent() {
      fs::create_dir_all(parent).await.map_err(|e| CollabError::io(parent, e))?;
    }
    #[cfg(unix)]
    fs::symlink(target, link).await.map_err(|e| CollabError::io(link, e))?;
    #[cfg(windows)]
    fs::symlink_dir(target, link).await.map_err(|e| CollabError::io(link, e))?;
    debug!(link = %link.display(), target = %target.display(), "linked");
    Ok(())
  }

  async fn copy_dir(&self, from: &Path, to: &Path) -> Result<(), CollabError> {
    let (from, to) = (from.to_path_buf(), to.to_path_buf());
    tokio::task::spawn_blocking(move || copy_tree(&from, &to))
      .await
      .map_err(|e| CollabError::io(PathBuf::new(), std::io::Error::other(e)))?
  }
}

fn temp_sibling(path: &Path) -> PathBuf {
  let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
  path.with_file_name(format!(".{name}.convoy-tmp"))
}

fn copy_tree(from: &Path, to: &Path) -> Result<(), CollabError> {
  for entry in WalkDir::new(from).follow_links(false) {
    let entry = entry.map_err(|e| {
      let path = e.path().unwrap_or(from).to_path_buf();
      CollabError::io(path, e.into())
    })?;
    let src = entry.path();
    let relative = src.strip_prefix(from).unwrap_or(src);
    let dst = to.join(relative);
    let file_type = entry.file_type();

    if file_type.is_dir() {
      std::fs::create_dir_all(&dst).map_err(|e| CollabError::io(&dst, e))?;
    } else if file_type.is_symlink() {
      let target = std::fs::read_link(src).map_err(|e| CollabError::io(src, e))?;
      #[cfg(unix)]
      std::os::unix::fs::symlink(&target, &dst).map_err(|e| CollabError::io(&dst, e))?;
      #[cfg(windows)]
      std::os::windows::fs::symlink_file(&target, &dst).map_err(|e| CollabError::io(&dst, e))?;
    } else {
      std::fs::copy(src, &dst).map_err(|e| CollabError::io(src, e))?;
    }
    trace!(src = %src.display(), dst = %dst.display(), "copied");
  }
  Ok(())
}

#[cfg(unix)]
async fn meta_of(metadata: &std::fs::Metadata) -> FileMeta {
  use std::os::unix::fs::MetadataExt;

  FileMeta {
    mode: Some(metadata.mode() & 0o7777),
    owner: lookup_name("/etc/passwd", metadata.uid()).await,
    group: lookup_name("/etc/group", metadata.gid()).await,
  }
}

#[cfg(windows)]
async fn meta_of(_metadata: &std::fs::Metadata) -> FileMeta {
  FileMeta::default()
}

/// Map a numeric id to its name using a colon-separated database file.
#[cfg(unix)]
async fn lookup_name(database: &str, id: u32) -> Option<String> {
  let contents = fs::read_to_string(database).await.ok()?;
  contents.lines().find_map(|line| {
    let mut fields = line.split(':');
    let name = fields.next()?;
    let entry_id = fields.nth(1)?.parse::<u32>().ok()?;
    (entry_id == id).then(|| name.to_string())
  })
}

async fn apply_meta(path: &Path, meta: &FileMeta) -> Result<(), CollabError> {
  #[cfg(unix)]
  if let Some(mode) = meta.mode {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
      .await
      .map_err(|e| CollabError::io(path, e))?;
  }

  let owner = match (&meta.owner, &meta.group) {
    (Some(owner), Some(group)) => format!("{owner}:{group}"),
    (Some(owner), None) => owner.clone(),
    (None, Some(group)) => format!(":{group}"),
    (None, None) => return Ok(()),
  };

  let status = tokio::process::Command::new("chown")
    .arg(&owner)
    .arg(path)
    .status()
    .await
    .map_err(|source| CollabError::Spawn {
      command: format!("chown {owner} {}", path.display()),
      source,
    })?;
  if !status.success() {
    return Err(CollabError::CommandFailed {
      command: format!("chown {owner} {}", path.display()),
      code: status.code(),
      stderr: String::new(),
    });
  }
  Ok(())
}

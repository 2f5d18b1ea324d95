//! Scratch directory lifecycle
//!
//! Every sandboxed execution owns one freshly created directory, named by a
//! random UUID so concurrent executions never collide.

use std::path::{Path, PathBuf};

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::sandbox::SandboxError;

/// An exclusively owned scratch directory
///
/// # Cleanup
///
/// Call [`cleanup()`](Self::cleanup) on the normal path. If the directory is
/// dropped without it (a cancelled request, a panic), `Drop` removes it
/// synchronously.
#[derive(Debug)]
pub struct ScratchDir {
    id: Uuid,
    path: PathBuf,
    owner: Option<(u32, u32)>,
    removed: bool,
}

impl ScratchDir {
    /// Create a new uniquely named directory under `root`.
    ///
    /// With an `owner`, the directory is handed to that uid/gid so a program
    /// running as the dedicated sandbox user can write into it.
    #[instrument(skip(root), fields(root = %root.as_ref().display()))]
    pub async fn create(
        root: impl AsRef<Path>,
        owner: Option<(u32, u32)>,
    ) -> Result<Self, SandboxError> {
        let root = root.as_ref();
        let id = Uuid::new_v4();
        let path = root.join(format!("run-{id}"));

        let scratch_err = |source| SandboxError::ScratchDir {
            path: path.clone(),
            source,
        };

        tokio::fs::create_dir_all(root).await.map_err(scratch_err)?;
        // create_dir (not create_dir_all) so an existing directory is an error
        tokio::fs::create_dir(&path).await.map_err(scratch_err)?;

        let mode = if owner.is_some() { 0o770 } else { 0o700 };
        set_mode(&path, mode).await.map_err(scratch_err)?;
        if let Some((uid, gid)) = owner {
            std::os::unix::fs::chown(&path, Some(uid), Some(gid)).map_err(scratch_err)?;
        }

        debug!(path = %path.display(), "scratch directory created");

        Ok(Self {
            id,
            path,
            owner,
            removed: false,
        })
    }

    /// Unique identifier of this directory
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Path to the directory on the host
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the host path to a file inside the directory
    ///
    /// Returns an error if the path contains path traversal attempts.
    pub fn file_path(&self, name: &str) -> Result<PathBuf, SandboxError> {
        if name.is_empty() || name.contains("..") || name.starts_with('/') {
            return Err(SandboxError::InvalidPath(format!(
                "path traversal not allowed: {name}"
            )));
        }
        Ok(self.path.join(name))
    }

    /// Write a file into the directory
    #[instrument(skip(self, content), fields(scratch = %self.id))]
    pub async fn write_file(&self, name: &str, content: &[u8]) -> Result<(), SandboxError> {
        let path = self.file_path(name)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::write(&path, content).await?;
        set_mode(&path, 0o644).await?;
        debug!(?path, len = content.len(), "wrote file to scratch directory");
        Ok(())
    }

    /// Read a file from the directory
    pub async fn read_file(&self, name: &str) -> Result<Vec<u8>, SandboxError> {
        let path = self.file_path(name)?;
        Ok(tokio::fs::read(&path).await?)
    }

    /// Check if a file exists in the directory
    pub async fn file_exists(&self, name: &str) -> Result<bool, SandboxError> {
        let path = self.file_path(name)?;
        Ok(tokio::fs::metadata(&path).await.is_ok())
    }

    /// Copy every regular file and directory of `source` into this directory.
    ///
    /// Symlinks are skipped: they were produced by untrusted code and could
    /// point anywhere on the host. Copies are handed to this directory's
    /// owner, so the program can replace or delete what was staged.
    #[instrument(skip(self, source), fields(scratch = %self.id, from = %source.id))]
    pub async fn stage_from(&self, source: &ScratchDir) -> Result<(), SandboxError> {
        let from = source.path.clone();
        let to = self.path.clone();
        let owner = self.owner;
        tokio::task::spawn_blocking(move || copy_tree(&from, &to, owner))
            .await
            .map_err(|e| SandboxError::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    /// Remove the directory and everything in it
    #[instrument(skip(self), fields(scratch = %self.id))]
    pub async fn cleanup(&mut self) -> Result<(), SandboxError> {
        if self.removed {
            return Ok(());
        }

        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "scratch cleanup failed");
                return Err(e.into());
            }
        }

        self.removed = true;
        debug!("scratch directory removed");
        Ok(())
    }

    /// Check if the directory has not been removed yet
    pub fn is_live(&self) -> bool {
        !self.removed
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        debug!(
            path = %self.path.display(),
            "scratch directory dropped without explicit cleanup, removing"
        );
        if let Err(e) = std::fs::remove_dir_all(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "scratch removal on drop failed");
        }
    }
}

async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

fn copy_tree(from: &Path, to: &Path, owner: Option<(u32, u32)>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = to.join(entry.file_name());
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
            copy_tree(&entry.path(), &target, owner)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
        } else {
            continue;
        }
        if let Some((uid, gid)) = owner {
            std::os::unix::fs::chown(&target, Some(uid), Some(gid))?;
        }
    }
    Ok(())
}

//! Ephemeral per-invocation workspace.
//!
//! Each invocation owns exactly one workspace directory holding the local
//! content store and the artifacts database. The workspace is deleted
//! unconditionally at invocation end, by either the happy-path finalizer or
//! the deadline guard, whichever fires first. Both paths may race at the
//! boundary, so deletion is idempotent: removing an already-removed
//! workspace succeeds.

use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{Error, Result};

/// Directory name of the local content store inside a workspace.
pub const STORE_DIR_NAME: &str = "store";

/// File name of the artifacts database inside a workspace.
pub const ARTIFACTS_DB_NAME: &str = "artifacts.db";

/// Free-disk-space query for the scratch volume.
///
/// The probe itself is environment-specific; the orchestrator only consumes
/// the answer to warn when space is short.
pub trait FreeSpace: Send + Sync {
    /// Returns the available bytes at `path`, or `None` when unknown.
    fn available_bytes(&self, path: &Path) -> Option<u64>;
}

/// A probe that never answers. Used where no platform query is wired.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProbe;

impl FreeSpace for NoProbe {
    fn available_bytes(&self, _path: &Path) -> Option<u64> {
        None
    }
}

/// An ephemeral directory tree owned by a single invocation.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Creates a fresh workspace under `base`, named after the request id
    /// plus a random suffix so retried request ids cannot collide.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` when the directory cannot be created.
    pub fn create(base: impl AsRef<Path>, request_id: &str) -> Result<Self> {
        let root = base
            .as_ref()
            .join(format!("{request_id}-{}", Uuid::new_v4().simple()));
        std::fs::create_dir_all(&root).map_err(|e| {
            Error::storage_with_source(
                format!("failed to create workspace at {}", root.display()),
                e,
            )
        })?;
        Ok(Self { root })
    }

    /// Returns the workspace root directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Returns the path of the local content store.
    #[must_use]
    pub fn store_dir(&self) -> PathBuf {
        self.root.join(STORE_DIR_NAME)
    }

    /// Returns the path of the artifacts database.
    #[must_use]
    pub fn artifacts_db_path(&self) -> PathBuf {
        self.root.join(ARTIFACTS_DB_NAME)
    }

    /// Returns whether the workspace directory still exists on disk.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.root.exists()
    }

    /// Removes the workspace directory and everything under it.
    ///
    /// Idempotent: a workspace that is already gone, including one deleted
    /// concurrently while this call walks the tree, is success.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cleanup` for any other I/O failure. Callers log this
    /// and never escalate it.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::cleanup(format!(
                "failed to remove workspace {}: {e}",
                self.root.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_and_removes_workspace() {
        let base = tempfile::tempdir().expect("base dir");
        let workspace = Workspace::create(base.path(), "req-abc").expect("workspace");

        assert!(workspace.exists());
        assert!(workspace
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("req-abc-")));
        assert_eq!(workspace.store_dir(), workspace.path().join("store"));
        assert_eq!(
            workspace.artifacts_db_path(),
            workspace.path().join("artifacts.db")
        );

        workspace.remove().expect("remove");
        assert!(!workspace.exists());
    }

    #[test]
    fn remove_is_idempotent() {
        let base = tempfile::tempdir().expect("base dir");
        let workspace = Workspace::create(base.path(), "req-twice").expect("workspace");

        workspace.remove().expect("first remove");
        workspace.remove().expect("second remove");
        assert!(!workspace.exists());
    }

    #[test]
    fn removes_populated_workspace() {
        let base = tempfile::tempdir().expect("base dir");
        let workspace = Workspace::create(base.path(), "req-full").expect("workspace");

        std::fs::create_dir_all(workspace.store_dir()).expect("store dir");
        std::fs::write(workspace.store_dir().join("blob"), b"data").expect("blob");
        std::fs::write(workspace.artifacts_db_path(), b"db").expect("db");

        workspace.remove().expect("remove");
        assert!(!workspace.exists());
    }

    #[test]
    fn two_workspaces_for_same_request_do_not_collide() {
        let base = tempfile::tempdir().expect("base dir");
        let a = Workspace::create(base.path(), "req-same").expect("first");
        let b = Workspace::create(base.path(), "req-same").expect("second");
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn no_probe_reports_unknown() {
        assert_eq!(NoProbe.available_bytes(Path::new("/tmp")), None);
    }
}

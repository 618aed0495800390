//! Per-request scratch workspaces.
//!
//! Every execution gets its own directory under the scratch root holding
//! exactly one source file:
//!
//! ```text
//! {scratch_root}/
//! └── {id}/             # mounted at /code inside the sandbox
//!     └── {id}.{ext}    # the submitted source, verbatim
//! ```
//!
//! Identifiers are `{unix-millis}-{uuid}` and are never reused. The
//! directory is removed by [`WorkspaceManager::release`]; a [`Workspace`]
//! that is dropped without being released removes itself, so unwinding and
//! early returns cannot leak one.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::WorkspaceError;

/// The fixed mount point for workspaces inside the sandbox.
pub const WORKSPACE_MOUNT_POINT: &str = "/code";

/// Directory permissions: owner read/write/execute only (0700).
const DIR_PERMISSIONS: u32 = 0o700;

/// An exclusively owned scratch directory holding one source file.
#[derive(Debug)]
pub struct Workspace {
    id: String,
    dir: PathBuf,
    source_path: PathBuf,
    released: bool,
}

impl Workspace {
    /// Unique identifier of this workspace.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Host directory that gets mounted into the sandbox.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Host path of the source file.
    #[must_use]
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Source file name, as seen from the mount point.
    #[must_use]
    pub fn file_name(&self) -> String {
        self.source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Path next to the workspace directory, outside the mount, for
    /// per-run bookkeeping files (`{root}/{id}.{extension}`).
    ///
    /// Callers own these files and remove them; [`WorkspaceManager::sweep_stale`]
    /// only catches what a crash left behind.
    #[must_use]
    pub fn sidecar_path(&self, extension: &str) -> PathBuf {
        self.dir.with_extension(extension)
    }

    fn remove(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        remove_workspace_dir(&self.id, &self.dir);
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.released {
            debug!(id = %self.id, "Workspace dropped without release, removing");
            self.remove();
        }
    }
}

/// Allocates and removes workspaces under one scratch root.
///
/// The root is configuration, not a global, so tests can point it at a
/// temporary directory.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    /// Creates a manager for the given scratch root.
    ///
    /// The root itself is created lazily on first [`acquire`](Self::acquire).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the scratch root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates a fresh workspace and writes `source` into it.
    ///
    /// # Errors
    ///
    /// - `StorageUnavailable` if the scratch root cannot be created
    /// - `CreateFailed` / `WriteFailed` if the workspace cannot be populated
    /// - `InvalidExtension` if `extension` contains path characters
    ///
    /// A partially created workspace is removed before the error is returned.
    #[instrument(skip(self, source), fields(root = %self.root.display(), bytes = source.len()))]
    pub fn acquire(&self, source: &str, extension: &str) -> Result<Workspace, WorkspaceError> {
        if extension.is_empty() || extension.contains(['/', '\\', '.']) {
            return Err(WorkspaceError::InvalidExtension(extension.to_string()));
        }

        self.ensure_root()?;

        let id = generate_id();
        let dir = self.root.join(&id);

        fs::create_dir(&dir).map_err(|e| WorkspaceError::CreateFailed {
            path: dir.clone(),
            source: e,
        })?;

        // From here on the guard removes the directory on any error path.
        let workspace = Workspace {
            source_path: dir.join(format!("{id}.{extension}")),
            id,
            dir,
            released: false,
        };

        fs::set_permissions(&workspace.dir, fs::Permissions::from_mode(DIR_PERMISSIONS)).map_err(
            |e| WorkspaceError::CreateFailed {
                path: workspace.dir.clone(),
                source: e,
            },
        )?;

        write_source(&workspace.source_path, source)?;

        trace!(id = %workspace.id, path = %workspace.source_path.display(), "Workspace ready");
        Ok(workspace)
    }

    /// Removes a workspace.
    ///
    /// Removal failures are logged and swallowed: they must never replace
    /// the result of the execution that used the workspace.
    #[instrument(skip(self, workspace), fields(id = %workspace.id))]
    pub fn release(&self, mut workspace: Workspace) {
        workspace.remove();
    }

    /// Returns true if a workspace with this id is present on disk.
    #[must_use]
    pub fn exists(&self, id: &str) -> bool {
        self.root.join(id).exists()
    }

    /// Removes workspaces left behind by a previous process (crash, kill -9).
    ///
    /// Only entries whose names look like workspace ids are touched. Call
    /// this at startup, before any request is accepted.
    ///
    /// Returns the number of workspaces removed.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub fn sweep_stale(&self) -> usize {
        if !self.root.exists() {
            return 0;
        }

        let mut removed = 0;
        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };

            if !entry.file_type().is_dir() {
                if is_sidecar_name(name) {
                    match fs::remove_file(entry.path()) {
                        Ok(()) => debug!(file = name, "Removed stale sidecar file"),
                        Err(e) => warn!(file = name, error = %e, "Failed to remove stale sidecar file"),
                    }
                }
                continue;
            }

            if is_workspace_id(name) {
                match fs::remove_dir_all(entry.path()) {
                    Ok(()) => {
                        debug!(id = name, "Removed stale workspace");
                        removed += 1;
                    }
                    Err(e) => warn!(id = name, error = %e, "Failed to remove stale workspace"),
                }
            }
        }

        debug!(removed, "Stale workspace sweep complete");
        removed
    }

    fn ensure_root(&self) -> Result<(), WorkspaceError> {
        let unavailable = |e: std::io::Error| WorkspaceError::StorageUnavailable {
            path: self.root.clone(),
            source: e,
        };

        if !self.root.exists() {
            fs::create_dir_all(&self.root).map_err(unavailable)?;
            fs::set_permissions(&self.root, fs::Permissions::from_mode(DIR_PERMISSIONS))
                .map_err(unavailable)?;
            debug!("Created scratch root");
        } else if !self.root.is_dir() {
            return Err(unavailable(std::io::Error::new(
                ErrorKind::NotADirectory,
                "scratch root is not a directory",
            )));
        }
        Ok(())
    }
}

fn write_source(path: &Path, source: &str) -> Result<(), WorkspaceError> {
    let write_failed = |e: std::io::Error| WorkspaceError::WriteFailed {
        path: path.to_path_buf(),
        source: e,
    };

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(write_failed)?;
    file.write_all(source.as_bytes()).map_err(write_failed)?;
    file.sync_all().map_err(write_failed)
}

fn remove_workspace_dir(id: &str, dir: &Path) {
    match fs::remove_dir_all(dir) {
        Ok(()) => trace!(%id, "Workspace removed"),
        Err(e) if e.kind() == ErrorKind::NotFound => trace!(%id, "Workspace already gone"),
        Err(e) => warn!(%id, path = %dir.display(), error = %e, "Failed to remove workspace"),
    }
}

/// Generates a workspace id: millisecond timestamp plus a random suffix.
fn generate_id() -> String {
    format!("{}-{}", Utc::now().timestamp_millis(), Uuid::new_v4().simple())
}

/// Checks whether a directory name has the shape produced by `generate_id`.
fn is_workspace_id(name: &str) -> bool {
    let Some((millis, suffix)) = name.split_once('-') else {
        return false;
    };
    !millis.is_empty()
        && millis.chars().all(|c| c.is_ascii_digit())
        && Uuid::try_parse(suffix).is_ok()
}

/// Checks whether a file name is `{workspace-id}.{extension}`.
fn is_sidecar_name(name: &str) -> bool {
    name.split_once('.')
        .is_some_and(|(stem, ext)| !ext.is_empty() && is_workspace_id(stem))
}

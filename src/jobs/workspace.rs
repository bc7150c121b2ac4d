//! Disposable per-job working directories.
//!
//! Each execution attempt gets `<root>/job_<id>`, created fresh and removed
//! when the attempt ends. Removal happens on [`Workspace::teardown`] or, on any
//! path that skips it, when the guard is dropped.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::errors::ExecutionError;

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    config_file_name: String,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, config_file_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            config_file_name: config_file_name.into(),
        }
    }

    /// Directory used for `job_id`. Distinct ids never share a directory.
    pub fn path_for(&self, job_id: i64) -> PathBuf {
        self.root.join(format!("job_{}", job_id))
    }

    /// Create a fresh, empty workspace for `job_id`.
    ///
    /// A leftover directory from an earlier crashed attempt is removed first.
    /// Creation itself is exclusive: a second concurrent `acquire` for the
    /// same id fails rather than sharing the directory.
    pub fn acquire(&self, job_id: i64) -> Result<Workspace, ExecutionError> {
        std::fs::create_dir_all(&self.root).map_err(|source| ExecutionError::Workspace {
            path: self.root.clone(),
            source,
        })?;

        let path = self.path_for(job_id);
        if path.exists() {
            warn!(job_id, path = %path.display(), "removing stale workspace");
            remove_dir(&path)?;
        }

        create_private_dir(&path)
            .map_err(|source| ExecutionError::Workspace {
                path: path.clone(),
                source,
            })?;
        debug!(job_id, path = %path.display(), "workspace created");

        Ok(Workspace {
            job_id,
            config_path: path.join(&self.config_file_name),
            path,
            removed: false,
        })
    }

    /// Remove a leftover workspace for `job_id`, if any. Returns whether one
    /// existed.
    pub fn remove_stale(&self, job_id: i64) -> Result<bool, ExecutionError> {
        let path = self.path_for(job_id);
        if !path.exists() {
            return Ok(false);
        }
        remove_dir(&path)?;
        Ok(true)
    }
}

/// An acquired workspace directory. Removed on teardown or drop.
#[derive(Debug)]
pub struct Workspace {
    job_id: i64,
    path: PathBuf,
    config_path: PathBuf,
    removed: bool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the configuration source into the workspace's single config file.
    pub fn write_config(&self, code: &str) -> Result<&Path, ExecutionError> {
        std::fs::write(&self.config_path, code).map_err(|source| ExecutionError::Workspace {
            path: self.config_path.clone(),
            source,
        })?;
        Ok(&self.config_path)
    }

    /// Remove the directory. A failure is logged at warn and otherwise
    /// ignored, so it can never change a job's outcome.
    pub fn teardown(mut self) {
        self.removed = true;
        match remove_dir(&self.path) {
            Ok(()) => debug!(job_id = self.job_id, "workspace removed"),
            Err(e) => warn!(job_id = self.job_id, error = %e, "failed to remove workspace"),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = remove_dir(&self.path) {
            warn!(job_id = self.job_id, error = %e, "failed to remove workspace on drop");
        }
    }
}

fn remove_dir(path: &Path) -> Result<(), ExecutionError> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ExecutionError::Workspace {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new().mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir(path)
}

//! Version-namespaced scratch area for one update.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use mailops_core::ReleaseVersion;

/// `<root>/update-<version>.zip` and `<root>/update-<version>/`.
#[derive(Debug, Clone)]
pub struct UpdateWorkspace {
    root: PathBuf,
    version: ReleaseVersion,
}

impl UpdateWorkspace {
    pub fn new(root: impl Into<PathBuf>, version: ReleaseVersion) -> Self {
        Self {
            root: root.into(),
            version,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive_path(&self) -> PathBuf {
        self.root.join(format!("update-{}.zip", self.version))
    }

    /// Where the archive unpacks to.
    pub fn folder_path(&self) -> PathBuf {
        self.root.join(format!("update-{}", self.version))
    }

    /// Create the root and clear this version's stale archive and folder.
    pub fn prepare(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;
        let archive = self.archive_path();
        self.discard_archive()?;
        if archive.exists() {
            return Err(io::Error::other(format!(
                "stale archive {} could not be removed",
                archive.display()
            )));
        }
        remove_dir_if_present(&self.folder_path())
    }

    pub fn discard_archive(&self) -> io::Result<()> {
        remove_file_if_present(&self.archive_path())
    }

    /// Remove the archive and the extracted folder; absent entries are fine.
    pub fn cleanup(&self) -> io::Result<()> {
        self.discard_archive()?;
        remove_dir_if_present(&self.folder_path())
    }
}

fn remove_file_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn remove_dir_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

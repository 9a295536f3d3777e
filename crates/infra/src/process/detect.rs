//! Locating external binaries before a job depends on them.

use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};

/// Resolves program names the way the OS would when spawning them.
#[derive(Debug, Clone, Default)]
pub struct ProgramLocator {
    search_path: Vec<PathBuf>,
}

impl ProgramLocator {
    /// Empty entries of the search path are ignored.
    pub fn new(search_path: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            search_path: search_path
                .into_iter()
                .filter(|dir| !dir.as_os_str().is_empty())
                .collect(),
        }
    }

    /// Locator over the current `PATH`.
    pub fn from_env() -> Self {
        match std::env::var_os("PATH") {
            Some(path) => Self::new(std::env::split_paths(&path)),
            None => Self::default(),
        }
    }

    /// Where `program` would be executed from, if anywhere.
    ///
    /// A program with more than one path component is checked as given; a
    /// bare name is looked up in the search path, first match wins.
    pub fn locate(&self, program: &str) -> Option<PathBuf> {
        let program = program.trim();
        if program.is_empty() {
            return None;
        }

        let given = Path::new(program);
        if given.components().count() > 1 {
            return is_executable(given).then(|| given.to_path_buf());
        }
        self.search_path
            .iter()
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
    }
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && has_exec_permission(&meta))
        .unwrap_or(false)
}

#[cfg(unix)]
fn has_exec_permission(meta: &Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn has_exec_permission(_meta: &Metadata) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    #[test]
    fn bare_names_search_in_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        install(second.path(), "unzip");
        let shadowing = install(first.path(), "unzip");

        let locator = ProgramLocator::new([
            PathBuf::new(),
            first.path().to_path_buf(),
            second.path().to_path_buf(),
        ]);

        assert_eq!(locator.locate(" unzip "), Some(shadowing));
        assert_eq!(locator.locate("curl"), None);
        assert_eq!(locator.locate(""), None);
    }

    #[test]
    fn explicit_paths_skip_the_search_path() {
        let dir = tempfile::tempdir().unwrap();
        let tool = install(dir.path(), "copy-tool");
        let locator = ProgramLocator::default();

        let explicit = tool.to_string_lossy();
        assert_eq!(locator.locate(&explicit), Some(tool.clone()));
        assert_eq!(locator.locate("copy-tool"), None);
        assert!(locator.locate(&dir.path().join("missing").to_string_lossy()).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn files_without_exec_bit_do_not_count() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cp"), "not a program").unwrap();

        let locator = ProgramLocator::new([dir.path().to_path_buf()]);
        assert!(locator.locate("cp").is_none());
    }
}

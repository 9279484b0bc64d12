use std::{
    collections::BTreeSet,
    fs,
    path::PathBuf,
};

use super::{canon_path, AccessorError, FileType, InputAccessor, Stat};

/// Filesystem-backed accessor over a directory subtree.
///
/// With an `allowed` set (canonical paths of the files git knows
/// about), access is restricted to those files and their parent
/// directories: a dirty working tree exposes exactly what
/// `git ls-files` reports, and untracked paths yield an error naming
/// the backing repository. Without a set, the whole subtree is visible,
/// which is the shape store-path snapshots are served in.
#[derive(Debug)]
pub struct FsAccessor {
    root: PathBuf,
    allowed: Option<BTreeSet<String>>,
    repo: String,
    path_display: Option<String>,
}

impl FsAccessor {
    /// Accessor over the whole subtree at `root`; restricted-path
    /// errors name `repo`.
    pub fn new(root: PathBuf, repo: String) -> Self {
        Self {
            root,
            allowed: None,
            repo,
            path_display: None,
        }
    }

    /// Accessor over a working tree restricted to `files`
    /// (repo-relative paths, as listed by git).
    pub fn with_allowed_files(root: PathBuf, repo: String, files: &[String]) -> Self {
        let allowed = files.iter().map(|f| canon_path(f)).collect();
        Self {
            root,
            allowed: Some(allowed),
            repo,
            path_display: None,
        }
    }

    fn fs_path(&self, canon: &str) -> PathBuf {
        // `canon` always begins with `/`; joining the relative remainder
        // keeps the result under the root.
        self.root.join(&canon[1..])
    }

    /// Whether `canon` is a visible file or a directory on the way to
    /// one.
    fn visible(&self, canon: &str) -> bool {
        match &self.allowed {
            None => true,
            Some(allowed) => {
                if canon == "/" {
                    return true;
                }
                if allowed.contains(canon) {
                    return true;
                }
                let prefix = format!("{canon}/");
                allowed
                    .range(prefix.clone()..)
                    .next()
                    .is_some_and(|entry| entry.starts_with(&prefix))
            }
        }
    }

    fn check_visible(&self, canon: &str) -> Result<(), AccessorError> {
        if self.visible(canon) {
            return Ok(());
        }
        let path = self.display_path(canon);
        if self.fs_path(canon).symlink_metadata().is_ok() {
            Err(AccessorError::NotTracked {
                path,
                repo: self.repo.clone(),
            })
        } else {
            Err(AccessorError::NotFoundInRepo {
                path,
                repo: self.repo.clone(),
            })
        }
    }

    fn display_path(&self, canon: &str) -> String {
        match &self.path_display {
            Some(display) => format!("{display}{canon}"),
            None => self.fs_path(canon).display().to_string(),
        }
    }
}

impl InputAccessor for FsAccessor {
    fn path_exists(&mut self, path: &str) -> bool {
        let canon = canon_path(path);
        self.visible(&canon) && self.fs_path(&canon).symlink_metadata().is_ok()
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, AccessorError> {
        let canon = canon_path(path);
        self.check_visible(&canon)?;
        Ok(fs::read(self.fs_path(&canon))?)
    }

    fn lstat(&mut self, path: &str) -> Result<Stat, AccessorError> {
        let canon = canon_path(path);
        self.check_visible(&canon)?;
        let meta = self.fs_path(&canon).symlink_metadata()?;
        let file_type = if meta.file_type().is_dir() {
            FileType::Directory
        } else if meta.file_type().is_symlink() {
            FileType::Symlink
        } else if meta.file_type().is_file() {
            FileType::Regular
        } else {
            return Err(AccessorError::UnsupportedType {
                path: self.display_path(&canon),
            });
        };
        Ok(Stat {
            file_type,
            is_executable: file_type == FileType::Regular && is_executable(&meta),
        })
    }

    fn read_directory(&mut self, path: &str) -> Result<BTreeSet<String>, AccessorError> {
        let canon = canon_path(path);
        self.check_visible(&canon)?;

        let mut entries = BTreeSet::new();
        for entry in fs::read_dir(self.fs_path(&canon))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let child = if canon == "/" {
                format!("/{name}")
            } else {
                format!("{canon}/{name}")
            };
            if self.visible(&child) {
                entries.insert(name);
            }
        }
        Ok(entries)
    }

    fn read_link(&mut self, path: &str) -> Result<String, AccessorError> {
        let canon = canon_path(path);
        self.check_visible(&canon)?;
        let target = fs::read_link(self.fs_path(&canon))?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn set_path_display(&mut self, display: String) {
        self.path_display = Some(display);
    }
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o100 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn fixture() -> (tempfile::TempDir, FsAccessor) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/lib.rs"), "tracked").unwrap();
        fs::write(dir.path().join("notes.txt"), "untracked").unwrap();
        let accessor = FsAccessor::with_allowed_files(
            dir.path().to_path_buf(),
            "/repo".to_string(),
            &["src/lib.rs".to_string()],
        );
        (dir, accessor)
    }

    #[test]
    fn tracked_files_are_visible() {
        let (_dir, mut accessor) = fixture();
        assert!(accessor.path_exists("src/lib.rs"));
        assert_eq!(accessor.read_file("src/lib.rs").unwrap(), b"tracked");
        assert_eq!(
            accessor.lstat("src").unwrap().file_type,
            FileType::Directory
        );
    }

    #[test]
    fn untracked_paths_are_restricted() {
        let (_dir, mut accessor) = fixture();
        assert!(!accessor.path_exists("notes.txt"));
        match accessor.read_file("notes.txt") {
            Err(AccessorError::NotTracked { repo, .. }) => assert_eq!(repo, "/repo"),
            other => panic!("expected NotTracked, got {other:?}"),
        }
        assert!(matches!(
            accessor.read_file("never-created.txt"),
            Err(AccessorError::NotFoundInRepo { .. })
        ));
    }

    #[test]
    fn directory_listing_is_filtered() {
        let (_dir, mut accessor) = fixture();
        let entries = accessor.read_directory("/").unwrap();
        assert_eq!(entries, BTreeSet::from(["src".to_string()]));
    }

    #[test]
    fn unrestricted_accessor_sees_everything() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("any.txt"), "data").unwrap();
        let mut accessor = FsAccessor::new(dir.path().to_path_buf(), "store".to_string());
        assert!(accessor.path_exists("any.txt"));
        assert_eq!(accessor.read_file("any.txt").unwrap(), b"data");
    }
}

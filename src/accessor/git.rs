use std::{collections::BTreeSet, path::Path};

use git2::{ErrorCode, Oid, Repository, TreeEntry};

use super::{canon_path, AccessorError, FileType, InputAccessor, Stat};

const MODE_DIR: i32 = 0o040000;
const MODE_BLOB: i32 = 0o100644;
const MODE_BLOB_EXEC: i32 = 0o100755;
const MODE_LINK: i32 = 0o120000;
const MODE_COMMIT: i32 = 0o160000;

/// Read-only accessor over the tree of one commit, keyed by
/// `(repo_dir, rev)`, reading objects in place instead of checking the
/// tree out. Submodule (gitlink) entries appear as empty directories.
pub struct GitTreeAccessor {
    repo: Repository,
    tree_id: Oid,
    path_display: Option<String>,
}

impl std::fmt::Debug for GitTreeAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitTreeAccessor")
            .field("tree_id", &self.tree_id)
            .field("path_display", &self.path_display)
            .finish()
    }
}

impl GitTreeAccessor {
    pub fn open(repo_dir: &Path, rev: &str) -> Result<Self, AccessorError> {
        let repo = Repository::open(repo_dir)?;
        let oid = Oid::from_str(rev)?;
        let tree_id = repo.find_commit(oid)?.tree_id();
        Ok(Self {
            repo,
            tree_id,
            path_display: None,
        })
    }

    fn entry(&self, canon: &str) -> Result<TreeEntry<'static>, AccessorError> {
        let tree = self.repo.find_tree(self.tree_id)?;
        tree.get_path(Path::new(&canon[1..])).map_err(|error| {
            if error.code() == ErrorCode::NotFound {
                AccessorError::NotFound(self.display_path(canon))
            } else {
                error.into()
            }
        })
    }

    fn display_path(&self, canon: &str) -> String {
        match &self.path_display {
            Some(display) => format!("{display}{canon}"),
            None => canon.to_string(),
        }
    }
}

impl InputAccessor for GitTreeAccessor {
    fn path_exists(&mut self, path: &str) -> bool {
        let canon = canon_path(path);
        canon == "/" || self.entry(&canon).is_ok()
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, AccessorError> {
        let canon = canon_path(path);
        if canon == "/" {
            return Err(AccessorError::UnsupportedType {
                path: self.display_path(&canon),
            });
        }
        let entry = self.entry(&canon)?;
        let object = entry.to_object(&self.repo)?;
        let blob = object.peel_to_blob()?;
        Ok(blob.content().to_vec())
    }

    fn lstat(&mut self, path: &str) -> Result<Stat, AccessorError> {
        let canon = canon_path(path);
        if canon == "/" {
            return Ok(Stat {
                file_type: FileType::Directory,
                is_executable: false,
            });
        }
        let entry = self.entry(&canon)?;
        let (file_type, is_executable) = match entry.filemode() {
            MODE_DIR | MODE_COMMIT => (FileType::Directory, false),
            MODE_BLOB => (FileType::Regular, false),
            MODE_BLOB_EXEC => (FileType::Regular, true),
            MODE_LINK => (FileType::Symlink, false),
            _ => {
                return Err(AccessorError::UnsupportedType {
                    path: self.display_path(&canon),
                })
            }
        };
        Ok(Stat {
            file_type,
            is_executable,
        })
    }

    fn read_directory(&mut self, path: &str) -> Result<BTreeSet<String>, AccessorError> {
        let canon = canon_path(path);
        let tree = if canon == "/" {
            self.repo.find_tree(self.tree_id)?
        } else {
            let entry = self.entry(&canon)?;
            if entry.filemode() == MODE_COMMIT {
                // A submodule pointer has no readable contents here.
                return Ok(BTreeSet::new());
            }
            entry.to_object(&self.repo)?.peel_to_tree()?
        };
        Ok(tree
            .iter()
            .filter_map(|entry| entry.name().map(str::to_string))
            .collect())
    }

    fn read_link(&mut self, path: &str) -> Result<String, AccessorError> {
        let canon = canon_path(path);
        let entry = self.entry(&canon)?;
        if entry.filemode() != MODE_LINK {
            return Err(AccessorError::UnsupportedType {
                path: self.display_path(&canon),
            });
        }
        let object = entry.to_object(&self.repo)?;
        let blob = object.peel_to_blob()?;
        Ok(String::from_utf8_lossy(blob.content()).into_owned())
    }

    fn set_path_display(&mut self, display: String) {
        self.path_display = Some(display);
    }
}

impl GitTreeAccessor {
    /// Walk the commit's tree and write it out under `dest`,
    /// preserving executable bits and symlinks. This is how snapshots
    /// are materialized for store insertion without a checkout.
    pub fn extract_to(&self, dest: &Path) -> Result<(), AccessorError> {
        let tree = self.repo.find_tree(self.tree_id)?;
        self.extract_tree(&tree, dest)
    }

    fn extract_tree(&self, tree: &git2::Tree, dest: &Path) -> Result<(), AccessorError> {
        std::fs::create_dir_all(dest)?;
        for entry in tree.iter() {
            let name = match entry.name() {
                Some(name) => name,
                None => continue,
            };
            let target = dest.join(name);
            match entry.filemode() {
                MODE_DIR => {
                    let subtree = entry.to_object(&self.repo)?.peel_to_tree()?;
                    self.extract_tree(&subtree, &target)?;
                }
                MODE_COMMIT => {
                    // Submodule pointer: materialize as an empty
                    // directory, matching what `git archive` emits.
                    std::fs::create_dir_all(&target)?;
                }
                MODE_LINK => {
                    let blob = entry.to_object(&self.repo)?.peel_to_blob()?;
                    let link = String::from_utf8_lossy(blob.content()).into_owned();
                    make_symlink(&link, &target)?;
                }
                mode => {
                    let blob = entry.to_object(&self.repo)?.peel_to_blob()?;
                    std::fs::write(&target, blob.content())?;
                    if mode == MODE_BLOB_EXEC {
                        make_executable(&target)?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn make_symlink(target: &str, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn make_symlink(target: &str, link: &Path) -> std::io::Result<()> {
    // Fall back to a regular file carrying the target path.
    std::fs::write(link, target)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o111);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

use std::{
    fmt::Display,
    fs,
    io::Read,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use log::debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::input::Attrs;

/// An immutable content-addressed directory produced by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorePath(PathBuf);

impl StorePath {
    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl Display for StorePath {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInfo {
    /// `sha256-<hex>` over the canonical serialization of the tree.
    pub nar_hash: String,
}

/// A two-level cache record: the value attributes of a previous fetch
/// plus the snapshot it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    pub info: Attrs,
    pub store_path: StorePath,
}

pub type PathFilter = fn(&Path) -> bool;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store path '{0}' has disappeared")]
    MissingPath(PathBuf),
    #[error("invalid cache record: {0}")]
    BadRecord(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

/// The store surface the fetcher depends on: content-addressed blob
/// insertion and query, a key/value facts API, and the two-level
/// (unlocked/locked) cache records.
#[cfg_attr(test, automock)]
pub trait Store {
    /// Insert `source` as a recursively sha256-hashed directory,
    /// copying only the paths `filter` accepts.
    fn add_to_store(
        &self,
        name: &str,
        source: &Path,
        filter: Option<PathFilter>,
    ) -> Result<StorePath, StoreError>;

    fn query_path_info(&self, path: &StorePath) -> Result<PathInfo, StoreError>;

    fn query_fact(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn upsert_fact(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Look up a cache record by its key attributes. Unlocked records
    /// expire with the configured TTL; locked records are immutable.
    fn lookup(&self, key: &Attrs) -> Result<Option<CacheRecord>, StoreError>;

    fn add(
        &self,
        key: &Attrs,
        info: &Attrs,
        store_path: &StorePath,
        locked: bool,
    ) -> Result<(), StoreError>;
}

/// Filesystem-backed store: snapshots under `store/`, cache records as
/// per-key JSON files under `records/`, facts under `facts/`.
pub struct LocalStore {
    root: PathBuf,
    ttl: u64,
}

#[derive(Serialize, Deserialize)]
struct RecordFile {
    key: Attrs,
    info: Attrs,
    store_path: StorePath,
    locked: bool,
    timestamp: u64,
}

impl LocalStore {
    pub fn open(root: PathBuf, ttl: u64) -> Result<Self, StoreError> {
        fs::create_dir_all(root.join("store"))?;
        fs::create_dir_all(root.join("records"))?;
        fs::create_dir_all(root.join("facts"))?;
        Ok(Self { root, ttl })
    }

    fn record_path(&self, key: &Attrs) -> Result<PathBuf, StoreError> {
        // BTreeMap keys serialize in sorted order, so equal key attrs
        // always map to the same file.
        let canonical = serde_json::to_vec(key)?;
        let digest = hex::encode(Sha256::digest(&canonical));
        Ok(self.root.join("records").join(format!("{digest}.json")))
    }

    fn fact_path(&self, key: &str) -> PathBuf {
        self.root.join("facts").join(key)
    }
}

impl Store for LocalStore {
    fn add_to_store(
        &self,
        name: &str,
        source: &Path,
        filter: Option<PathFilter>,
    ) -> Result<StorePath, StoreError> {
        let digest = hash_tree(source, filter)?;
        let hash = hex::encode(digest);
        let dest = self.root.join("store").join(format!("{}-{}", &hash[..32], name));

        if !dest.exists() {
            // Copy into a sibling staging dir first so a crashed copy
            // never leaves a half-populated store path behind.
            let staging = tempfile::tempdir_in(self.root.join("store"))?;
            let staged = staging.path().join("tree");
            copy_tree(source, &staged, filter)?;
            match fs::rename(&staged, &dest) {
                Ok(()) => {}
                // Lost the race against a concurrent insertion of the
                // same content; theirs is as good as ours.
                Err(_) if dest.exists() => {}
                Err(error) => return Err(error.into()),
            }
            debug!("added '{}' to the store", dest.display());
        }

        Ok(StorePath(dest))
    }

    fn query_path_info(&self, path: &StorePath) -> Result<PathInfo, StoreError> {
        if !path.as_path().exists() {
            return Err(StoreError::MissingPath(path.as_path().to_path_buf()));
        }
        let digest = hash_tree(path.as_path(), None)?;
        Ok(PathInfo {
            nar_hash: format!("sha256-{}", hex::encode(digest)),
        })
    }

    fn query_fact(&self, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.fact_path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    fn upsert_fact(&self, key: &str, value: &str) -> Result<(), StoreError> {
        Ok(fs::write(self.fact_path(key), value)?)
    }

    fn lookup(&self, key: &Attrs) -> Result<Option<CacheRecord>, StoreError> {
        let path = self.record_path(key)?;
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        let record: RecordFile = serde_json::from_slice(&data)?;

        if !record.locked && !within_ttl(record.timestamp, self.ttl) {
            debug!("cache record for {:?} has expired", key);
            return Ok(None);
        }
        if !record.store_path.as_path().exists() {
            debug!(
                "cache record for {:?} points at missing path '{}'",
                key, record.store_path
            );
            return Ok(None);
        }

        Ok(Some(CacheRecord {
            info: record.info,
            store_path: record.store_path,
        }))
    }

    fn add(
        &self,
        key: &Attrs,
        info: &Attrs,
        store_path: &StorePath,
        locked: bool,
    ) -> Result<(), StoreError> {
        let record = RecordFile {
            key: key.clone(),
            info: info.clone(),
            store_path: store_path.clone(),
            locked,
            timestamp: unix_now(),
        };
        let path = self.record_path(key)?;
        Ok(fs::write(path, serde_json::to_vec(&record)?)?)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn within_ttl(timestamp: u64, ttl: u64) -> bool {
    timestamp.saturating_add(ttl) > unix_now()
}

/// Recursive sha256 over a canonical serialization of the tree: sorted
/// entries, a kind tag per node, the executable bit for regular files,
/// file contents, and symlink targets. Equal trees hash equal
/// regardless of where they live.
pub fn hash_tree(path: &Path, filter: Option<PathFilter>) -> Result<[u8; 32], StoreError> {
    let mut hasher = Sha256::new();
    hash_node(&mut hasher, path, filter)?;
    Ok(hasher.finalize().into())
}

fn hash_node(
    hasher: &mut Sha256,
    path: &Path,
    filter: Option<PathFilter>,
) -> Result<(), StoreError> {
    let meta = path.symlink_metadata()?;

    if meta.file_type().is_dir() {
        hasher.update(b"dir\0");
        let mut entries: Vec<_> = fs::read_dir(path)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|e| e.path())
            .collect();
        entries.sort();
        for entry in entries {
            if let Some(filter) = filter {
                if !filter(&entry) {
                    continue;
                }
            }
            hasher.update(b"entry\0");
            hasher.update(
                entry
                    .file_name()
                    .unwrap_or(std::ffi::OsStr::new(""))
                    .as_encoded_bytes(),
            );
            hasher.update(b"\0");
            hash_node(hasher, &entry, filter)?;
        }
    } else if meta.file_type().is_symlink() {
        hasher.update(b"symlink\0");
        hasher.update(fs::read_link(path)?.as_os_str().as_encoded_bytes());
    } else {
        hasher.update(if is_executable(&meta) {
            b"executable\0".as_slice()
        } else {
            b"regular\0".as_slice()
        });
        hasher.update(meta.len().to_le_bytes());
        let mut file = fs::File::open(path)?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
    }
    Ok(())
}

/// Copy the subtree at `src` to `dst`, skipping paths `filter` rejects
/// and preserving executable bits and symlinks.
pub fn copy_tree(src: &Path, dst: &Path, filter: Option<PathFilter>) -> Result<(), StoreError> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let path = entry.path();
        if let Some(filter) = filter {
            if !filter(&path) {
                continue;
            }
        }
        let target = dst.join(entry.file_name());
        let meta = path.symlink_metadata()?;
        if meta.file_type().is_dir() {
            copy_tree(&path, &target, filter)?;
        } else if meta.file_type().is_symlink() {
            copy_symlink(&path, &target)?;
        } else {
            fs::copy(&path, &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(src)?, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::copy(src, dst).map(|_| ())
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

/// Path filter excluding `.git` at any level, applied when snapshots
/// come from a checked-out worktree.
pub fn is_not_dot_git(path: &Path) -> bool {
    path.file_name().map(|n| n != ".git").unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::input::Attr;

    use pretty_assertions::assert_eq;

    fn write_fixture(dir: &Path) {
        fs::create_dir_all(dir.join("src")).unwrap();
        fs::write(dir.join("src/lib.rs"), "pub fn f() {}").unwrap();
        fs::write(dir.join("README.md"), "# fixture").unwrap();
    }

    #[test]
    fn equal_trees_hash_equal() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        write_fixture(a.path());
        write_fixture(b.path());
        assert_eq!(
            hash_tree(a.path(), None).unwrap(),
            hash_tree(b.path(), None).unwrap()
        );

        fs::write(b.path().join("README.md"), "# changed").unwrap();
        assert_ne!(
            hash_tree(a.path(), None).unwrap(),
            hash_tree(b.path(), None).unwrap()
        );
    }

    #[test]
    fn filter_affects_hash_and_copy() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/config"), "noise").unwrap();

        let clean = tempfile::tempdir().unwrap();
        write_fixture(clean.path());

        assert_eq!(
            hash_tree(dir.path(), Some(is_not_dot_git)).unwrap(),
            hash_tree(clean.path(), None).unwrap()
        );

        let copied = tempfile::tempdir().unwrap();
        let copy_root = copied.path().join("tree");
        copy_tree(dir.path(), &copy_root, Some(is_not_dot_git)).unwrap();
        assert!(!copy_root.join(".git").exists());
        assert_eq!(
            hash_tree(&copy_root, None).unwrap(),
            hash_tree(clean.path(), None).unwrap()
        );
    }

    #[test]
    fn store_insertion_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let store = LocalStore::open(root.path().to_path_buf(), 3600).unwrap();

        let source = tempfile::tempdir().unwrap();
        write_fixture(source.path());

        let first = store.add_to_store("source", source.path(), None).unwrap();
        let second = store.add_to_store("source", source.path(), None).unwrap();
        assert_eq!(first, second);
        assert!(first.as_path().join("src/lib.rs").exists());

        let info = store.query_path_info(&first).unwrap();
        assert!(info.nar_hash.starts_with("sha256-"));
    }

    #[test]
    fn facts_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        let store = LocalStore::open(root.path().to_path_buf(), 3600).unwrap();
        assert_eq!(store.query_fact("git-abc-revcount").unwrap(), None);
        store.upsert_fact("git-abc-revcount", "42").unwrap();
        assert_eq!(
            store.query_fact("git-abc-revcount").unwrap(),
            Some("42".to_string())
        );
    }

    #[test]
    fn unlocked_records_expire_but_locked_do_not() {
        let root = tempfile::tempdir().unwrap();
        let store = LocalStore::open(root.path().to_path_buf(), 0).unwrap();

        let source = tempfile::tempdir().unwrap();
        write_fixture(source.path());
        let store_path = store.add_to_store("source", source.path(), None).unwrap();

        let unlocked_key =
            Attrs::from([("type".to_string(), Attr::String("git".to_string()))]);
        let locked_key = Attrs::from([("rev".to_string(), Attr::String("abc".to_string()))]);
        let info = Attrs::from([("lastModified".to_string(), Attr::Int(1))]);

        store.add(&unlocked_key, &info, &store_path, false).unwrap();
        store.add(&locked_key, &info, &store_path, true).unwrap();

        // TTL of zero: the unlocked record is immediately stale.
        assert_eq!(store.lookup(&unlocked_key).unwrap(), None);
        let hit = store.lookup(&locked_key).unwrap().expect("locked hit");
        assert_eq!(hit.store_path, store_path);
        assert_eq!(hit.info, info);
    }
}

use std::{
    fs::File,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use fs4::fs_std::FileExt;
use log::debug;
use thiserror::Error;

/// How long we are willing to wait for another fetcher to release a
/// mirror directory before giving up.
const LOCK_TIMEOUT: Duration = Duration::from_secs(300);

/// Advisory exclusive lock on a path, released on drop.
///
/// Mirror directories are mutated (init, fetch, ref touch) under this
/// lock; read-only operations on known revisions do not take it.
pub struct FileLock {
    path: PathBuf,
    _file: File,
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("timed out waiting for lock on {0}")]
    Timeout(PathBuf),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

impl FileLock {
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let file = File::create(path)?;
        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(_) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                        _file: file,
                    });
                }
                Err(error)
                    if error.raw_os_error() == fs4::lock_contended_error().raw_os_error() =>
                {
                    if start.elapsed() >= LOCK_TIMEOUT {
                        return Err(LockError::Timeout(path.to_path_buf()));
                    }
                    debug!("failed to acquire a lock on {}, retrying", path.display());
                    std::thread::sleep(Duration::from_secs(1));
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("mirror.lock");
        {
            let lock = FileLock::acquire(&lock_path).unwrap();
            assert_eq!(lock.path(), lock_path);
        }
        // Released on drop; a second acquisition must succeed immediately.
        let _lock = FileLock::acquire(&lock_path).unwrap();
    }
}

use std::{
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};

use log::{info, warn};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::head::DUMMY_BRANCH;
use super::runner::{Git, GitCliError};
use crate::config::FetchConfig;
use crate::flock::{FileLock, LockError};

/// Version segment of the mirror layout; bump when the on-disk format
/// changes so old and new layouts can coexist under one cache root.
const MIRROR_FORMAT: &str = "gitv1";

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Git error: {0}")]
    Git(#[from] GitCliError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

/// Manages the per-URL bare repositories under the cache root.
///
/// Mutation of a specific mirror (creation, `git fetch`, symbolic HEAD
/// update, ref mtime touch) happens under an advisory lock on
/// `<mirror>.lock`. Read-only operations on known revisions are safe
/// without it: git object files are append-only and only
/// `refs/heads/<ref>` and the symbolic HEAD are ever rewritten.
pub struct MirrorCache {
    root: PathBuf,
    ttl: u64,
    jobs: String,
    git: Git,
}

impl MirrorCache {
    pub fn new(config: &FetchConfig) -> Self {
        Self {
            root: config.cache_dir.clone(),
            ttl: config.cache_ttl,
            jobs: config.num_jobs(),
            git: Git::new(),
        }
    }

    pub fn ttl(&self) -> u64 {
        self.ttl
    }

    /// Mirror directory for a URL: `<root>/gitv1/<sha256(url) hex>`.
    pub fn mirror_dir(&self, url: &str) -> PathBuf {
        let digest = Sha256::digest(url.as_bytes());
        self.root.join(MIRROR_FORMAT).join(hex::encode(digest))
    }

    /// Take the advisory lock guarding a mirror's mutating section.
    pub fn lock(&self, mirror_dir: &Path) -> Result<FileLock, MirrorError> {
        let mut lock_path = mirror_dir.as_os_str().to_owned();
        lock_path.push(".lock");
        Ok(FileLock::acquire(Path::new(&lock_path))?)
    }

    /// Initialize a bare repository at `mirror_dir` unless one exists.
    /// Must be called under the mirror lock.
    pub fn ensure_bare(&self, mirror_dir: &Path) -> Result<(), MirrorError> {
        if mirror_dir.exists() {
            return Ok(());
        }
        let dir = mirror_dir.to_string_lossy();
        let default_branch = format!("init.defaultBranch={DUMMY_BRANCH}");
        self.git
            .run(["-c", default_branch.as_str(), "init", "--bare", dir.as_ref()])?;
        Ok(())
    }

    /// The file whose mtime records the last successful fetch of `ref`.
    pub fn local_ref_file(mirror_dir: &Path, ref_name: &str) -> PathBuf {
        if ref_name.starts_with("refs/") {
            mirror_dir.join(ref_name)
        } else {
            mirror_dir.join("refs/heads").join(ref_name)
        }
    }

    /// Whether `git cat-file -e <rev>` succeeds in the repository, i.e.
    /// the object is already present and no fetch is needed.
    pub fn contains_rev(
        &self,
        repo_dir: &str,
        git_dir: &str,
        rev: &str,
    ) -> Result<bool, MirrorError> {
        let out = self
            .git
            .status(["-C", repo_dir, "--git-dir", git_dir, "cat-file", "-e", rev])?;
        if out.success() {
            return Ok(true);
        }
        if out.code().is_some() {
            Ok(false)
        } else {
            Err(GitCliError::Failed {
                args: vec!["cat-file".into(), "-e".into(), rev.into()],
                status: out.status,
                stderr: out.stderr,
            }
            .into())
        }
    }

    pub fn is_shallow(&self, repo_dir: &str, git_dir: &str) -> Result<bool, MirrorError> {
        let out = self.git.output([
            "-C",
            repo_dir,
            "--git-dir",
            git_dir,
            "rev-parse",
            "--is-shallow-repository",
        ])?;
        Ok(out.trim() == "true")
    }

    /// Fetch `refspec` into the mirror, degrading to the cached ref on
    /// network failure when one exists. Must be called under the mirror
    /// lock. On success the local ref file's mtime is bumped to now and,
    /// when the caller supplied no explicit ref, the resolved default
    /// ref is persisted as the mirror's symbolic HEAD.
    pub fn fetch(
        &self,
        mirror_dir: &Path,
        url: &str,
        fetch_args: &FetchArgs,
        local_ref_file: &Path,
        ref_was_explicit: bool,
        resolved_ref: &str,
    ) -> Result<(), MirrorError> {
        info!("fetching Git repository '{}'", url);

        let mirror = mirror_dir.to_string_lossy();
        let mut args: Vec<String> = vec![
            "-C".into(),
            mirror.to_string(),
            "--git-dir".into(),
            ".".into(),
            "fetch".into(),
            "--quiet".into(),
            "--force".into(),
            "--jobs".into(),
            self.jobs.clone(),
        ];
        args.extend(fetch_args.options.iter().cloned());
        args.push("--".into());
        args.push(url.to_string());
        args.push(fetch_args.refspec.clone());

        if let Err(error) = self.git.run(&args) {
            if !local_ref_file.exists() {
                return Err(error.into());
            }
            warn!(
                "could not update local clone of Git repository '{}'; \
                 continuing with the most recent version",
                url
            );
        }

        if let Err(error) = touch(local_ref_file) {
            warn!(
                "could not update mtime for file '{}': {}",
                local_ref_file.display(),
                error
            );
        }
        if !ref_was_explicit && !self.store_cached_head(mirror_dir, resolved_ref) {
            warn!(
                "could not update cached head '{}' for '{}'",
                resolved_ref, url
            );
        }

        Ok(())
    }

    /// Persist the remote's default branch as the mirror's symbolic
    /// HEAD. `git symbolic-ref` updates the HEAD file's mtime itself.
    pub fn store_cached_head(&self, mirror_dir: &Path, head_ref: &str) -> bool {
        let dir = mirror_dir.to_string_lossy();
        match self.git.run([
            "-C",
            dir.as_ref(),
            "--git-dir",
            ".",
            "symbolic-ref",
            "--",
            "HEAD",
            head_ref,
        ]) {
            Ok(()) => true,
            Err(error) => {
                if !error.exited() {
                    warn!("git symbolic-ref died unexpectedly: {}", error);
                }
                false
            }
        }
    }
}

/// Options and refspec for one `git fetch` into a mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchArgs {
    pub options: Vec<String>,
    pub refspec: String,
}

impl FetchArgs {
    /// `<src>:<dst>` construction:
    ///
    /// - `dst` is `refs/*` when all refs are wanted, the verbatim ref
    ///   when it already names a full ref or `HEAD`, and
    ///   `refs/heads/<ref>` otherwise.
    /// - A shallow fetch of a pinned revision uses the revision as
    ///   `src` with `--depth=1`; an unshallow fetch of a historically
    ///   shallow mirror adds `--unshallow`.
    pub fn new(
        shallow: bool,
        all_refs: bool,
        ref_name: &str,
        rev: Option<&str>,
        mirror_is_shallow: bool,
    ) -> Self {
        let dst = if all_refs {
            "refs/*".to_string()
        } else if ref_name.starts_with("refs/") || ref_name == "HEAD" {
            ref_name.to_string()
        } else {
            format!("refs/heads/{ref_name}")
        };

        let mut options = Vec::new();
        let src = match (shallow, rev) {
            (true, Some(rev)) => {
                options.push("--depth=1".to_string());
                rev.to_string()
            }
            (true, None) => {
                options.push("--depth=1".to_string());
                dst.clone()
            }
            (false, _) => {
                if mirror_is_shallow {
                    options.push("--unshallow".to_string());
                }
                dst.clone()
            }
        };

        FetchArgs {
            options,
            refspec: format!("{src}:{dst}"),
        }
    }
}

fn touch(path: &Path) -> std::io::Result<()> {
    fs::File::options()
        .write(true)
        .open(path)?
        .set_modified(SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn cache() -> MirrorCache {
        MirrorCache::new(&FetchConfig {
            cache_dir: PathBuf::from("/tmp/cache"),
            cache_ttl: 3600,
            max_fetch_jobs: 2,
            allow_dirty: true,
            warn_dirty: true,
        })
    }

    #[test]
    fn mirror_dir_is_stable_per_url() {
        let cache = cache();
        let a = cache.mirror_dir("https://example.org/repo.git");
        let b = cache.mirror_dir("https://example.org/repo.git");
        let c = cache.mirror_dir("https://example.org/other.git");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("/tmp/cache/gitv1"));
    }

    #[test]
    fn ref_file_respects_full_refs() {
        let dir = Path::new("/mirror");
        assert_eq!(
            MirrorCache::local_ref_file(dir, "main"),
            PathBuf::from("/mirror/refs/heads/main")
        );
        assert_eq!(
            MirrorCache::local_ref_file(dir, "refs/tags/v1"),
            PathBuf::from("/mirror/refs/tags/v1")
        );
    }

    #[test]
    fn plain_branch_refspec() {
        let args = FetchArgs::new(false, false, "main", None, false);
        assert!(args.options.is_empty());
        assert_eq!(args.refspec, "refs/heads/main:refs/heads/main");
    }

    #[test]
    fn full_ref_and_head_are_verbatim() {
        let args = FetchArgs::new(false, false, "refs/tags/v1", None, false);
        assert_eq!(args.refspec, "refs/tags/v1:refs/tags/v1");
        let args = FetchArgs::new(false, false, "HEAD", None, false);
        assert_eq!(args.refspec, "HEAD:HEAD");
    }

    #[test]
    fn all_refs_fetches_everything() {
        let args = FetchArgs::new(false, true, "main", None, false);
        assert_eq!(args.refspec, "refs/*:refs/*");
    }

    #[test]
    fn shallow_pins_the_revision() {
        let rev = "29b0b4b9b85cdc45395b0d4b0d1128dbd4cde8cd";
        let args = FetchArgs::new(true, false, "main", Some(rev), false);
        assert_eq!(args.options, vec!["--depth=1".to_string()]);
        assert_eq!(args.refspec, format!("{rev}:refs/heads/main"));
    }

    #[test]
    fn shallow_without_rev_fetches_the_ref() {
        let args = FetchArgs::new(true, false, "main", None, false);
        assert_eq!(args.options, vec!["--depth=1".to_string()]);
        assert_eq!(args.refspec, "refs/heads/main:refs/heads/main");
    }

    #[test]
    fn unshallowing_a_shallow_mirror() {
        let args = FetchArgs::new(false, false, "main", None, true);
        assert_eq!(args.options, vec!["--unshallow".to_string()]);
    }
}

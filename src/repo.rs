use log::warn;
use thiserror::Error;

use crate::config::FetchConfig;
use crate::git::{Git, GitCliError};
use crate::input::Input;

/// Forces `file://` URLs to be treated as remote, exercising the mirror
/// workflow in tests.
pub const FORCE_HTTP_ENV: &str = "GITFETCH_FORCE_HTTP";

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("'{0}' is not a Git repository")]
    NotARepository(String),
    #[error("getting the HEAD of the Git tree '{path}' failed with exit code {code}:\n{message}")]
    HeadFailed {
        path: String,
        code: i32,
        message: String,
    },
    #[error("Git error: {0}")]
    Git(#[from] GitCliError),
}

/// Facts about the repository behind an input, derived once per fetch.
#[derive(Debug, Clone)]
pub struct RepoInfo {
    pub shallow: bool,
    pub submodules: bool,
    pub all_refs: bool,

    /// Cache-key type tag; options that change snapshot content yield
    /// distinct cache entries.
    pub cache_type: String,

    /// Whether this is a local, non-bare repository.
    pub is_local: bool,

    /// Whether this is a local, non-bare, dirty repository.
    pub is_dirty: bool,

    /// Whether this repository has any commits.
    pub has_head: bool,

    /// URL of the repo, or its filesystem path if `is_local`.
    pub url: String,

    pub git_dir: String,
}

impl RepoInfo {
    pub fn warn_dirty(&self, config: &FetchConfig) -> Result<(), DirtyTreeError> {
        if self.is_dirty {
            if !config.allow_dirty {
                return Err(DirtyTreeError(self.url.clone()));
            }
            if config.warn_dirty {
                warn!("Git tree '{}' is dirty", self.url);
            }
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
#[error("Git tree '{0}' is dirty")]
pub struct DirtyTreeError(pub String);

/// `"git"` plus any of `-shallow`, `-submodules`, `-all-refs`, in that
/// order.
pub fn cache_type(shallow: bool, submodules: bool, all_refs: bool) -> String {
    let mut cache_type = String::from("git");
    if shallow {
        cache_type.push_str("-shallow");
    }
    if submodules {
        cache_type.push_str("-submodules");
    }
    if all_refs {
        cache_type.push_str("-all-refs");
    }
    cache_type
}

/// Classify the repository behind `input`: local working tree, local
/// bare, or remote; for a local working tree with neither ref nor rev,
/// also detect dirtiness and whether HEAD exists.
pub fn classify(input: &Input) -> Result<RepoInfo, RepoError> {
    let force_http = std::env::var(FORCE_HTTP_ENV).as_deref() == Ok("1");

    let url = &input.url;
    let path = url.to_file_path().unwrap_or_else(|_| url.path().into());
    let is_bare = url.scheme() == "file" && !path.join(".git").exists();
    let is_local = url.scheme() == "file" && !force_http && !is_bare;

    let mut info = RepoInfo {
        shallow: input.shallow,
        submodules: input.submodules,
        all_refs: input.all_refs,
        cache_type: cache_type(input.shallow, input.submodules, input.all_refs),
        is_local,
        is_dirty: false,
        has_head: true,
        url: if is_local {
            path.to_string_lossy().into_owned()
        } else {
            let mut base = url.clone();
            base.set_query(None);
            base.set_fragment(None);
            base.to_string()
        },
        git_dir: ".git".to_string(),
    };

    // A local directory with no ref or revision may be used as an
    // unclean working tree.
    if input.ref_name.is_none() && input.rev.is_none() && info.is_local {
        info.is_dirty = true;
        refine_working_tree(&mut info)?;
    }

    Ok(info)
}

/// Check whether HEAD points at a commit and whether the tree differs
/// from it. `LC_ALL=C` is forced because the error messages of
/// `git rev-parse` decide which code path is taken; unknown messages
/// must fail instead of being routed down the wrong path.
fn refine_working_tree(info: &mut RepoInfo) -> Result<(), RepoError> {
    let git = Git::with_env(vec![("LC_ALL".to_string(), "C".to_string())]);

    let (status, message) = git.status_merged([
        "-C",
        info.url.as_str(),
        "--git-dir",
        info.git_dir.as_str(),
        "rev-parse",
        "--verify",
        "--no-revs",
        "HEAD^{commit}",
    ])?;

    if message.contains("fatal: not a git repository") {
        return Err(RepoError::NotARepository(info.url.clone()));
    } else if message.contains("fatal: Needed a single revision") {
        // The repo has no commits yet; keep it marked dirty.
    } else if !status.success() {
        return Err(RepoError::HeadFailed {
            path: info.url.clone(),
            code: status.code().unwrap_or(-1),
            message,
        });
    }

    info.has_head = status.success();

    if info.has_head {
        // `git diff` is preferable to lower-level plumbing here: only
        // the exit code is needed.
        let mut args = vec![
            "-C",
            info.url.as_str(),
            "--git-dir",
            info.git_dir.as_str(),
            "diff",
            "HEAD",
            "--quiet",
        ];
        if !info.submodules {
            // Changes in submodules only make the tree dirty when the
            // submodules will be copied as well.
            args.push("--ignore-submodules");
        }
        args.push("--");

        let out = git.status(args)?;
        match out.code() {
            Some(0) => info.is_dirty = false,
            Some(1) => {}
            _ => {
                return Err(GitCliError::Failed {
                    args: vec!["diff".into(), "HEAD".into(), "--quiet".into()],
                    status: out.status,
                    stderr: out.stderr,
                }
                .into())
            }
        }
    }

    Ok(())
}

/// Paths under Git control in a working tree, as reported by
/// `git ls-files -z` (recursing into submodules when they are part of
/// the snapshot). Paths are repo-relative with no leading slash.
pub fn list_files(git: &Git, info: &RepoInfo) -> Result<Vec<String>, RepoError> {
    let mut args = vec![
        "-C",
        info.url.as_str(),
        "--git-dir",
        info.git_dir.as_str(),
        "ls-files",
        "-z",
    ];
    if info.submodules {
        args.push("--recurse-submodules");
    }
    let out = git.output(args)?;
    Ok(out
        .split('\0')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect())
}

/// Resolve `ref_name` to a commit id in a local repository.
pub fn resolve_ref(git: &Git, info: &RepoInfo, ref_name: &str) -> Result<String, RepoError> {
    let out = git.output([
        "-C",
        info.url.as_str(),
        "--git-dir",
        info.git_dir.as_str(),
        "rev-parse",
        ref_name,
    ])?;
    Ok(out.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn cache_type_flag_order() {
        assert_eq!(cache_type(false, false, false), "git");
        assert_eq!(cache_type(true, false, false), "git-shallow");
        assert_eq!(cache_type(false, true, true), "git-submodules-all-refs");
        assert_eq!(
            cache_type(true, true, true),
            "git-shallow-submodules-all-refs"
        );
    }

    #[test]
    fn remote_url_is_canonicalized_without_query() {
        let input =
            Input::from_url("git+https://example.org/repo.git?ref=main&foo=bar").unwrap();
        let info = classify(&input).unwrap();
        assert!(!info.is_local);
        assert_eq!(info.url, "https://example.org/repo.git");
        assert_eq!(info.git_dir, ".git");
    }

    #[test]
    fn missing_dot_git_means_bare() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("git+file://{}", dir.path().display());
        let input = Input::from_url(&url).unwrap();
        let info = classify(&input).unwrap();
        // No `.git` directory: treated as a bare (remote-like) repo.
        assert!(!info.is_local);
    }
}

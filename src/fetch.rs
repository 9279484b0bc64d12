use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::accessor::{AccessorError, FsAccessor, GitTreeAccessor, InputAccessor};
use crate::config::FetchConfig;
use crate::facts;
use crate::git::{
    head, FetchArgs, Git, GitCliError, MirrorCache, MirrorError, DUMMY_BRANCH, GIT_FATAL_EXIT,
};
use crate::input::{validate_rev, Attr, Attrs, Input, InputError};
use crate::repo::{self, classify, DirtyTreeError, RepoError, RepoInfo};
use crate::store::{self, Store, StoreError, StorePath};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Dirty(#[from] DirtyTreeError),
    #[error("Git error: {0}")]
    Git(#[from] GitCliError),
    #[error(transparent)]
    Mirror(#[from] MirrorError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("accessor error: {0}")]
    Accessor(#[from] AccessorError),
    #[error(
        "cannot find Git revision '{rev}' in ref '{ref_name}' of repository '{url}'; \
         please make sure that the rev exists on the ref you've specified, or add \
         allRefs = true to fetch all refs"
    )]
    RevNotFound {
        rev: String,
        ref_name: String,
        url: String,
    },
    #[error(
        "'{0}' is a shallow Git repository, but shallow repositories are only allowed \
         when shallow = true is specified"
    )]
    ShallowMismatch(String),
    #[error("'{path}' in repository '{url}' does not contain a commit id")]
    BadLocalRef { path: PathBuf, url: String },
    #[error("cloning a specific revision is not implemented")]
    CloneRevUnsupported,
    #[error("cannot commit '{path}' to Git repository '{input}' because it's not a working tree")]
    NotAWorkingTree { path: String, input: String },
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

/// Fetch the snapshot an input describes, returning a read-only
/// accessor over it together with the fully resolved input.
///
/// A local working tree with neither ref nor rev is served directly
/// from disk (the dirty path); everything else resolves to a commit
/// and goes through the store.
pub fn get_accessor(
    config: &FetchConfig,
    store: &dyn Store,
    input: Input,
) -> Result<(Box<dyn InputAccessor>, Input), FetchError> {
    let mut repo_info = classify(&input)?;

    if input.ref_name.is_some() || input.rev.is_some() || !repo_info.is_local {
        from_commit(config, store, &mut repo_info, input)
    } else {
        from_checkout(config, store, &mut repo_info, input)
    }
}

/// `git clone` an input into `dest`.
pub fn clone_to(input: &Input, dest: &Path) -> Result<(), FetchError> {
    let info = classify(input)?;

    if input.rev.is_some() {
        return Err(FetchError::CloneRevUnsupported);
    }

    let mut args = vec!["clone".to_string(), info.url.clone()];
    if let Some(ref_name) = &input.ref_name {
        args.push("--branch".to_string());
        args.push(ref_name.clone());
    }
    args.push(dest.to_string_lossy().into_owned());

    Git::new().run(&args)?;
    Ok(())
}

/// Write a file into a local working tree, register it with
/// `git add --intent-to-add`, and optionally commit it.
pub fn put_file(
    input: &Input,
    rel_path: &str,
    contents: &[u8],
    commit_msg: Option<&str>,
) -> Result<(), FetchError> {
    let info = classify(input)?;
    if !info.is_local {
        return Err(FetchError::NotAWorkingTree {
            path: rel_path.to_string(),
            input: input.to_string(),
        });
    }

    let abs_path = Path::new(&info.url).join(rel_path);
    if let Some(parent) = abs_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&abs_path, contents)?;

    let git = Git::new();
    git.run([
        "-C",
        info.url.as_str(),
        "--git-dir",
        info.git_dir.as_str(),
        "add",
        "--intent-to-add",
        "--",
        rel_path,
    ])?;

    if let Some(message) = commit_msg {
        git.run([
            "-C",
            info.url.as_str(),
            "--git-dir",
            info.git_dir.as_str(),
            "commit",
            rel_path,
            "-m",
            message,
        ])?;
    }

    Ok(())
}

/// The ref to use when the input names none: the repo's HEAD branch,
/// resolved directly for local repos and through the TTL cache for
/// remote ones, falling back to the literal `master`.
fn default_ref(git: &Git, mirrors: &MirrorCache, info: &RepoInfo) -> String {
    let head = if info.is_local {
        head::read_head(git, &info.url)
    } else {
        head::read_head_cached(git, &mirrors.mirror_dir(&info.url), mirrors.ttl(), &info.url)
    };
    match head {
        Some(head) => head,
        None => {
            warn!(
                "could not read HEAD ref from repo at '{}', using 'master'",
                info.url
            );
            "master".to_string()
        }
    }
}

fn update_rev(
    git: &Git,
    info: &RepoInfo,
    input: &mut Input,
    ref_name: &str,
) -> Result<(), FetchError> {
    if input.rev.is_none() {
        let rev = repo::resolve_ref(git, info, ref_name)?;
        validate_rev(&rev)?;
        input.rev = Some(rev);
    }
    Ok(())
}

fn locked_key(info: &RepoInfo, name: &str, rev: &str) -> Attrs {
    Attrs::from([
        ("type".to_string(), Attr::String(info.cache_type.clone())),
        ("name".to_string(), Attr::String(name.to_string())),
        ("rev".to_string(), Attr::String(rev.to_string())),
    ])
}

fn unlocked_key(info: &RepoInfo, name: &str, ref_name: &str) -> Attrs {
    Attrs::from([
        ("type".to_string(), Attr::String(info.cache_type.clone())),
        ("name".to_string(), Attr::String(name.to_string())),
        ("url".to_string(), Attr::String(info.url.clone())),
        ("ref".to_string(), Attr::String(ref_name.to_string())),
    ])
}

/// Finalize a fetch: pin the snapshot's content hash and metadata on
/// the input and wrap the store path in an accessor.
fn make_result(
    store: &dyn Store,
    info: &RepoInfo,
    mut input: Input,
    info_attrs: &Attrs,
    store_path: StorePath,
) -> Result<(Box<dyn InputAccessor>, Input), FetchError> {
    debug_assert!(input.rev.is_some());

    input.nar_hash = Some(store.query_path_info(&store_path)?.nar_hash);
    if !info.shallow {
        input.rev_count = info_attrs.get("revCount").and_then(Attr::as_int);
    }
    input.last_modified = info_attrs.get("lastModified").and_then(Attr::as_int);

    let mut accessor: Box<dyn InputAccessor> = Box::new(FsAccessor::new(
        store_path.as_path().to_path_buf(),
        info.url.clone(),
    ));
    accessor.set_path_display(format!("«{}»", input));
    Ok((accessor, input))
}

/// Fetch a specific commit, via the mirror cache for remote inputs.
fn from_commit(
    config: &FetchConfig,
    store: &dyn Store,
    info: &mut RepoInfo,
    mut input: Input,
) -> Result<(Box<dyn InputAccessor>, Input), FetchError> {
    debug_assert!(!info.is_dirty);

    let git = Git::new();
    let mirrors = MirrorCache::new(config);

    let orig_rev = input.rev.clone();
    let name = input.name().to_string();

    if let Some(rev) = &input.rev {
        if let Some(record) = store.lookup(&locked_key(info, &name, rev))? {
            return make_result(store, info, input, &record.info, record.store_path);
        }
    }

    let original_ref = input.ref_name.clone();
    let ref_name = original_ref
        .clone()
        .unwrap_or_else(|| default_ref(&git, &mirrors, info));
    input.ref_name = Some(ref_name.clone());

    let unlocked = unlocked_key(info, &name, &ref_name);

    let repo_dir: String;

    if info.is_local {
        update_rev(&git, info, &mut input, &ref_name)?;
        repo_dir = info.url.clone();
    } else {
        if let Some(record) = store.lookup(&unlocked)? {
            if let Some(cached_rev) = record.info.get("rev").and_then(Attr::as_str) {
                if input.rev.is_none() || input.rev.as_deref() == Some(cached_rev) {
                    input.rev = Some(cached_rev.to_string());
                    return make_result(store, info, input, &record.info, record.store_path);
                }
            }
        }

        let mirror_dir = mirrors.mirror_dir(&info.url);
        repo_dir = mirror_dir.to_string_lossy().into_owned();
        info.git_dir = ".".to_string();

        if let Some(parent) = mirror_dir.parent() {
            fs::create_dir_all(parent)?;
        }
        let _lock = mirrors.lock(&mirror_dir)?;

        mirrors.ensure_bare(&mirror_dir)?;

        let local_ref_file = MirrorCache::local_ref_file(&mirror_dir, &ref_name);

        // A pinned revision already present in the mirror needs no
        // fetch regardless of ref freshness.
        let mut do_fetch = if let Some(rev) = &input.rev {
            !mirrors.contains_rev(&repo_dir, ".", rev)?
        } else if info.all_refs {
            true
        } else {
            match local_ref_file.metadata().and_then(|meta| meta.modified()) {
                Ok(mtime) => !head::within_ttl(mtime, mirrors.ttl()),
                Err(_) => true,
            }
        };

        let mirror_is_shallow = mirrors.is_shallow(&repo_dir, ".")?;
        if mirror_is_shallow && !info.shallow {
            // The mirror must be unshallowed before it can serve a
            // full-depth request.
            do_fetch = true;
        }

        if do_fetch {
            let fetch_args = FetchArgs::new(
                info.shallow,
                info.all_refs,
                &ref_name,
                input.rev.as_deref(),
                mirror_is_shallow,
            );
            mirrors.fetch(
                &mirror_dir,
                &info.url,
                &fetch_args,
                &local_ref_file,
                original_ref.is_some(),
                &ref_name,
            )?;
        }

        if input.rev.is_none() {
            let raw = fs::read_to_string(&local_ref_file).map_err(|_| {
                FetchError::BadLocalRef {
                    path: local_ref_file.clone(),
                    url: info.url.clone(),
                }
            })?;
            let rev = raw.trim().to_string();
            validate_rev(&rev).map_err(|_| FetchError::BadLocalRef {
                path: local_ref_file.clone(),
                url: info.url.clone(),
            })?;
            input.rev = Some(rev);
        }

        // The mirror lock is released here; the remainder performs only
        // read-only operations on a specific revision.
    }

    if mirrors.is_shallow(&repo_dir, &info.git_dir)? && !info.shallow {
        return Err(FetchError::ShallowMismatch(info.url.clone()));
    }

    let rev = input.rev.clone().expect("rev was resolved above");
    debug_assert!(orig_rev.is_none() || orig_rev.as_deref() == Some(rev.as_str()));

    debug!("using revision {} of repo '{}'", rev, info.url);

    // Now that the rev is known, check the locked record again.
    if let Some(record) = store.lookup(&locked_key(info, &name, &rev))? {
        return make_result(store, info, input, &record.info, record.store_path);
    }

    // Refuse a revision the repository does not actually contain, with
    // a pointer at the likely fixes.
    let (status, message) = git.status_merged([
        "-C",
        repo_dir.as_str(),
        "--git-dir",
        info.git_dir.as_str(),
        "cat-file",
        "commit",
        rev.as_str(),
    ])?;
    if status.code() == Some(GIT_FATAL_EXIT) && message.contains("bad file") {
        return Err(FetchError::RevNotFound {
            rev,
            ref_name,
            url: info.url.clone(),
        });
    }

    let mut info_attrs = Attrs::from([
        ("rev".to_string(), Attr::String(rev.clone())),
        (
            "lastModified".to_string(),
            Attr::Int(facts::last_modified(&git, store, info, &repo_dir, &rev)?),
        ),
    ]);
    if !info.shallow {
        info_attrs.insert(
            "revCount".to_string(),
            Attr::Int(facts::rev_count(&git, store, info, &repo_dir, &rev)?),
        );
    }

    info!("copying Git tree '{}' to the store", input);

    let scratch = tempfile::tempdir()?;
    let filter = if info.submodules {
        checkout_with_submodules(&git, config, info, &repo_dir, &rev, scratch.path())?;
        Some(store::is_not_dot_git as fn(&Path) -> bool)
    } else {
        materialize_plain(&git, info, &repo_dir, &rev, scratch.path())?;
        None
    };

    let store_path = store.add_to_store(&name, scratch.path(), filter)?;

    if orig_rev.is_none() {
        store.add(&unlocked, &info_attrs, &store_path, false)?;
    }
    store.add(&locked_key(info, &name, &rev), &info_attrs, &store_path, true)?;

    make_result(store, info, input, &info_attrs, store_path)
}

/// Materialize a commit without touching submodules: read the objects
/// in place when possible, falling back to `git archive` streamed
/// through a tarball.
fn materialize_plain(
    git: &Git,
    info: &RepoInfo,
    repo_dir: &str,
    rev: &str,
    dest: &Path,
) -> Result<(), FetchError> {
    let git_dir = Path::new(repo_dir).join(&info.git_dir);
    match GitTreeAccessor::open(&git_dir, rev) {
        Ok(accessor) => {
            accessor.extract_to(dest)?;
            Ok(())
        }
        Err(error) => {
            debug!(
                "native object read of '{}' failed ({}); falling back to git archive",
                rev, error
            );
            let mut tarball = tempfile::NamedTempFile::new()?;
            git.stream(
                [
                    "-C",
                    repo_dir,
                    "--git-dir",
                    info.git_dir.as_str(),
                    "archive",
                    rev,
                ],
                tarball.as_file_mut(),
            )?;
            let mut archive = tar::Archive::new(tarball.reopen()?);
            archive.set_preserve_permissions(true);
            archive.unpack(dest)?;
            Ok(())
        }
    }
}

/// Materialize a commit including its submodules by checking it out
/// into a scratch worktree.
///
/// For local sources the user's repository must not be mutated, so a
/// scratch git dir borrows its objects via `--reference` (an alternate)
/// and `submodule.alternateLocation=superproject` lets submodules
/// inherit it. For remote sources the mirror's git dir is used
/// directly.
fn checkout_with_submodules(
    git: &Git,
    config: &FetchConfig,
    info: &RepoInfo,
    repo_dir: &str,
    rev: &str,
    worktree: &Path,
) -> Result<(), FetchError> {
    let worktree_str = worktree.to_string_lossy().into_owned();
    let scratch_git = tempfile::tempdir()?;

    let git_folder = if info.is_local {
        let scratch_dir = scratch_git.path().join("scratch.git");
        let scratch_str = scratch_dir.to_string_lossy().into_owned();
        let default_branch = format!("init.defaultBranch={DUMMY_BRANCH}");
        git.run([
            "-c",
            default_branch.as_str(),
            "init",
            worktree_str.as_str(),
            "--separate-git-dir",
            scratch_str.as_str(),
            "--reference",
            repo_dir,
            "-c",
            "submodule.alternateLocation=superproject",
        ])?;

        // Use the repo's own config so submodules with relative URLs
        // resolve against the right origin, then restore the bare flag
        // the copy clobbered.
        let source_config = Path::new(repo_dir).join(&info.git_dir).join("config");
        fs::copy(&source_config, scratch_dir.join("config"))?;
        git.run([
            "--git-dir",
            scratch_str.as_str(),
            "--work-tree",
            worktree_str.as_str(),
            "config",
            "core.bare",
            "false",
        ])?;

        scratch_dir
    } else {
        let mirror_git = Path::new(repo_dir).join(&info.git_dir);
        let mirror_str = mirror_git.to_string_lossy().into_owned();
        git.run([
            "--git-dir",
            mirror_str.as_str(),
            "--work-tree",
            worktree_str.as_str(),
            "config",
            "remote.origin.url",
            info.url.as_str(),
        ])?;
        mirror_git
    };
    let git_folder = git_folder.to_string_lossy().into_owned();

    git.run([
        "--git-dir",
        git_folder.as_str(),
        "--work-tree",
        worktree_str.as_str(),
        "checkout",
        "--quiet",
        rev,
        ".",
    ])?;

    if !info.shallow {
        // Submodules previously initialized as shallow must be
        // unshallowed; when none are initialized yet this is a no-op.
        let unshallow = format!("git fetch --unshallow --jobs={}", config.num_jobs());
        git.run([
            "--git-dir",
            git_folder.as_str(),
            "--work-tree",
            worktree_str.as_str(),
            "-C",
            worktree_str.as_str(),
            "submodule",
            "foreach",
            "--recursive",
            unshallow.as_str(),
        ])?;
    }

    info!("fetching submodules of '{}'", info.url);
    let jobs = config.num_jobs();
    let mut args = vec![
        "--git-dir",
        git_folder.as_str(),
        "--work-tree",
        worktree_str.as_str(),
        "-C",
        worktree_str.as_str(),
        "submodule",
        "update",
        "--init",
        "--recursive",
        "--quiet",
        "--recommend-shallow",
        "--jobs",
        jobs.as_str(),
    ];
    if info.shallow {
        args.push("--depth=1");
    }

    // Try without fetching first: when the submodule commit is present
    // but not reachable, git would otherwise fetch needlessly.
    let mut no_fetch = args.clone();
    no_fetch.push("--no-fetch");
    if git.run(&no_fetch).is_err() {
        git.run(&args)?;
    }

    Ok(())
}

/// Serve a local working tree directly, restricted to the files git
/// knows about.
fn from_checkout(
    config: &FetchConfig,
    store: &dyn Store,
    info: &mut RepoInfo,
    mut input: Input,
) -> Result<(Box<dyn InputAccessor>, Input), FetchError> {
    let git = Git::new();

    if !info.is_dirty {
        let mirrors = MirrorCache::new(config);
        let ref_name = default_ref(&git, &mirrors, info);
        input.ref_name = Some(ref_name.clone());
        update_rev(&git, info, &mut input, &ref_name)?;

        let rev = input.rev.clone().expect("rev was just resolved");
        input.rev_count = Some(facts::rev_count(&git, store, info, &info.url, &rev)?);
        input.last_modified = Some(facts::last_modified(&git, store, info, &info.url, &rev)?);
    } else {
        info.warn_dirty(config)?;

        input.last_modified = Some(facts::last_modified_for_ref(&git, info, &info.url, "HEAD")?);
    }

    let files = repo::list_files(&git, info)?;
    let accessor = FsAccessor::with_allowed_files(
        PathBuf::from(&info.url),
        info.url.clone(),
        &files,
    );
    Ok((Box::new(accessor), input))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::repo::cache_type;

    use pretty_assertions::assert_eq;

    fn repo_info() -> RepoInfo {
        RepoInfo {
            shallow: false,
            submodules: false,
            all_refs: false,
            cache_type: cache_type(false, false, false),
            is_local: false,
            is_dirty: false,
            has_head: true,
            url: "https://example.org/repo.git".into(),
            git_dir: ".".into(),
        }
    }

    #[test]
    fn locked_key_is_rev_only() {
        let rev = "29b0b4b9b85cdc45395b0d4b0d1128dbd4cde8cd";
        let key = locked_key(&repo_info(), "source", rev);
        assert_eq!(
            key.keys().collect::<Vec<_>>(),
            vec!["name", "rev", "type"]
        );
        assert_eq!(key.get("type").unwrap().as_str(), Some("git"));
    }

    #[test]
    fn unlocked_key_carries_url_and_ref() {
        let key = unlocked_key(&repo_info(), "source", "main");
        assert_eq!(
            key.keys().collect::<Vec<_>>(),
            vec!["name", "ref", "type", "url"]
        );
        assert_eq!(
            key.get("url").unwrap().as_str(),
            Some("https://example.org/repo.git")
        );
    }

    #[test]
    fn clone_refuses_pinned_revisions() {
        let input = Input::from_url(
            "git+https://example.invalid/repo.git?ref=main&rev=29b0b4b9b85cdc45395b0d4b0d1128dbd4cde8cd",
        )
        .unwrap();
        let dest = tempfile::tempdir().unwrap();
        assert!(matches!(
            clone_to(&input, dest.path()),
            Err(FetchError::CloneRevUnsupported)
        ));
    }

    #[test]
    fn put_file_requires_a_working_tree() {
        let input = Input::from_url("git+https://example.invalid/repo.git").unwrap();
        assert!(matches!(
            put_file(&input, "a.txt", b"data", None),
            Err(FetchError::NotAWorkingTree { .. })
        ));
    }
}

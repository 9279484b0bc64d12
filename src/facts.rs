use log::debug;

use crate::git::{Git, GitCliError};
use crate::repo::RepoInfo;
use crate::store::Store;

/// Memoized commit timestamp for an immutable revision. A repository
/// without commits reports 0.
pub fn last_modified(
    git: &Git,
    store: &dyn Store,
    info: &RepoInfo,
    repo_dir: &str,
    rev: &str,
) -> Result<u64, GitCliError> {
    if !info.has_head {
        return Ok(0);
    }

    let key = format!("git-{rev}-last-modified");
    if let Ok(Some(cached)) = store.query_fact(&key) {
        if let Ok(value) = cached.parse() {
            return Ok(value);
        }
    }

    let value = last_modified_for_ref(git, info, repo_dir, rev)?;

    if let Err(error) = store.upsert_fact(&key, &value.to_string()) {
        debug!("could not record fact '{}': {}", key, error);
    }
    Ok(value)
}

/// Commit timestamp of an arbitrary ref, bypassing the fact cache;
/// the dirty/local paths use this with mutable refs like `HEAD`.
pub fn last_modified_for_ref(
    git: &Git,
    info: &RepoInfo,
    repo_dir: &str,
    ref_name: &str,
) -> Result<u64, GitCliError> {
    if !info.has_head {
        return Ok(0);
    }
    let out = git.output([
        "-C",
        repo_dir,
        "--git-dir",
        info.git_dir.as_str(),
        "log",
        "-1",
        "--format=%ct",
        "--no-show-signature",
        ref_name,
    ])?;
    Ok(parse_count(&out))
}

/// Memoized `git rev-list --count` for an immutable revision.
pub fn rev_count(
    git: &Git,
    store: &dyn Store,
    info: &RepoInfo,
    repo_dir: &str,
    rev: &str,
) -> Result<u64, GitCliError> {
    if !info.has_head {
        return Ok(0);
    }

    let key = format!("git-{rev}-revcount");
    if let Ok(Some(cached)) = store.query_fact(&key) {
        if let Ok(value) = cached.parse() {
            return Ok(value);
        }
    }

    debug!("getting Git revision count of '{}'", info.url);
    let value = rev_count_for_ref(git, info, repo_dir, rev)?;

    if let Err(error) = store.upsert_fact(&key, &value.to_string()) {
        debug!("could not record fact '{}': {}", key, error);
    }
    Ok(value)
}

/// Revision count of an arbitrary ref, bypassing the fact cache.
pub fn rev_count_for_ref(
    git: &Git,
    info: &RepoInfo,
    repo_dir: &str,
    ref_name: &str,
) -> Result<u64, GitCliError> {
    let out = git.output([
        "-C",
        repo_dir,
        "--git-dir",
        info.git_dir.as_str(),
        "rev-list",
        "--count",
        ref_name,
    ])?;
    Ok(parse_count(&out))
}

fn parse_count(out: &str) -> u64 {
    out.trim().parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::repo::cache_type;
    use crate::store::MockStore;

    use pretty_assertions::assert_eq;

    fn repo_info() -> RepoInfo {
        RepoInfo {
            shallow: false,
            submodules: false,
            all_refs: false,
            cache_type: cache_type(false, false, false),
            is_local: false,
            is_dirty: false,
            has_head: false,
            url: "https://example.org/repo.git".into(),
            git_dir: ".".into(),
        }
    }

    #[test]
    fn headless_repos_report_zero() {
        let store = MockStore::new();
        let git = Git::new();
        let info = repo_info();
        assert_eq!(
            last_modified(&git, &store, &info, "/nowhere", "deadbeef").unwrap(),
            0
        );
        assert_eq!(
            rev_count(&git, &store, &info, "/nowhere", "deadbeef").unwrap(),
            0
        );
    }

    #[test]
    fn cached_facts_skip_the_subprocess() {
        let mut store = MockStore::new();
        store
            .expect_query_fact()
            .withf(|key| key == "git-deadbeef-last-modified")
            .returning(|_| Ok(Some("1700000000".to_string())));

        let git = Git::new();
        let mut info = repo_info();
        info.has_head = true;
        // The repo dir does not exist: a cache miss would fail loudly.
        assert_eq!(
            last_modified(&git, &store, &info, "/nowhere", "deadbeef").unwrap(),
            1_700_000_000
        );
    }
}

use std::{
    path::Path,
    time::{Duration, SystemTime},
};

use log::{debug, warn};

use super::runner::Git;

/// Initial branch for freshly created bare mirrors. The value itself
/// does not matter (we always fetch a specific revision or branch); it
/// suppresses init warnings and lets us tell a never-populated mirror
/// apart from one whose real HEAD has been resolved.
pub const DUMMY_BRANCH: &str = "__gitfetch_dummy_branch";

/// One parsed line of `git ls-remote --symref` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LsRemoteLine {
    /// `ref: refs/heads/main\tHEAD` — HEAD is a symbolic ref.
    Symbolic(String),
    /// `<oid>\t<name>` — a plain object line.
    Object(String),
}

impl LsRemoteLine {
    pub fn target(self) -> String {
        match self {
            LsRemoteLine::Symbolic(target) | LsRemoteLine::Object(target) => target,
        }
    }
}

pub fn parse_ls_remote_line(line: &str) -> Option<LsRemoteLine> {
    if let Some(rest) = line.strip_prefix("ref:") {
        let target = rest.trim_start().split_whitespace().next()?;
        return Some(LsRemoteLine::Symbolic(target.to_string()));
    }
    let target = line.split_whitespace().next()?;
    if target.is_empty() {
        return None;
    }
    Some(LsRemoteLine::Object(target.to_string()))
}

/// Resolve the HEAD of `target` (a URL or a local repository path) via
/// `git ls-remote --symref`. Returns the full symbolic ref name (e.g.
/// `refs/heads/main`) or, when the remote reports a plain object line,
/// the commit id itself. Returns `None` on any non-zero exit.
pub fn read_head(git: &Git, target: &str) -> Option<String> {
    let out = git.status(["ls-remote", "--symref", target]).ok()?;
    if !out.success() {
        return None;
    }
    let line = out.stdout.lines().next()?;
    let parsed = parse_ls_remote_line(line)?;
    match &parsed {
        LsRemoteLine::Symbolic(head) => {
            debug!("resolved HEAD ref '{}' for repo '{}'", head, target);
        }
        LsRemoteLine::Object(head) => {
            debug!("resolved HEAD rev '{}' for repo '{}'", head, target);
        }
    }
    Some(parsed.target())
}

/// Whether `mtime + ttl` is still in the future.
pub fn within_ttl(mtime: SystemTime, ttl: u64) -> bool {
    match mtime.elapsed() {
        Ok(age) => age < Duration::from_secs(ttl),
        // An mtime in the future is as fresh as it gets.
        Err(_) => true,
    }
}

/// TTL-cached variant of [`read_head`] for remote URLs, backed by the
/// mirror directory's own `HEAD` file.
///
/// Falls back to the (possibly expired) cached value when the remote is
/// unreachable: connectivity loss must not prevent offline use. The
/// same degradation applies to a failed `git fetch`, so the two stay
/// consistent.
pub fn read_head_cached(git: &Git, mirror_dir: &Path, ttl: u64, url: &str) -> Option<String> {
    let head_file = mirror_dir.join("HEAD");

    let mut cached_ref = None;
    if let Ok(meta) = head_file.metadata() {
        cached_ref = read_head(git, &mirror_dir.to_string_lossy());
        if let Some(cached) = &cached_ref {
            if cached != DUMMY_BRANCH {
                if let Ok(mtime) = meta.modified() {
                    if within_ttl(mtime, ttl) {
                        debug!("using cached HEAD ref '{}' for repo '{}'", cached, url);
                        return cached_ref;
                    }
                }
            }
        }
    }

    if let Some(head) = read_head(git, url) {
        return Some(head);
    }

    if let Some(cached) = cached_ref {
        warn!(
            "could not get HEAD ref for repository '{}'; using expired cached ref '{}'",
            url, cached
        );
        return Some(cached);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn parses_symref_line() {
        assert_eq!(
            parse_ls_remote_line("ref: refs/heads/main\tHEAD"),
            Some(LsRemoteLine::Symbolic("refs/heads/main".into()))
        );
    }

    #[test]
    fn parses_object_line() {
        assert_eq!(
            parse_ls_remote_line("29b0b4b9b85cdc45395b0d4b0d1128dbd4cde8cd\tHEAD"),
            Some(LsRemoteLine::Object(
                "29b0b4b9b85cdc45395b0d4b0d1128dbd4cde8cd".into()
            ))
        );
    }

    #[test]
    fn empty_line_is_none() {
        assert_eq!(parse_ls_remote_line(""), None);
    }

    #[test]
    fn fresh_and_stale_mtimes() {
        let now = SystemTime::now();
        assert!(within_ttl(now, 3600));
        assert!(!within_ttl(now - Duration::from_secs(7200), 3600));
    }
}

pub mod fs;
pub mod git;
pub mod zip;

use std::collections::BTreeSet;

use thiserror::Error;

pub use fs::FsAccessor;
pub use git::GitTreeAccessor;
pub use zip::ZipAccessor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub file_type: FileType,
    pub is_executable: bool,
}

#[derive(Error, Debug)]
pub enum AccessorError {
    #[error("file '{0}' does not exist")]
    NotFound(String),
    #[error("path '{path}' does not exist in Git repository '{repo}'")]
    NotFoundInRepo { path: String, repo: String },
    #[error(
        "access to path '{path}' is forbidden because it is not under Git control; \
         maybe you should 'git add' it to the repository '{repo}'?"
    )]
    NotTracked { path: String, repo: String },
    #[error("file '{path}' has unsupported type")]
    UnsupportedType { path: String },
    #[error("reading symlinks is not supported by this accessor")]
    ReadLinkUnsupported,
    #[error("archive error: {0}")]
    Archive(#[from] ::zip::result::ZipError),
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

/// Read-only virtual-filesystem capability handed back to callers.
///
/// Variants: filesystem subtree (optionally restricted to the paths a
/// working tree's git index knows about), native git-object reader, and
/// ZIP archive. No inheritance hierarchy; a trait object suffices.
pub trait InputAccessor: std::fmt::Debug {
    fn path_exists(&mut self, path: &str) -> bool;

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, AccessorError>;

    fn lstat(&mut self, path: &str) -> Result<Stat, AccessorError>;

    /// Immediate child names of a directory, sorted.
    fn read_directory(&mut self, path: &str) -> Result<BTreeSet<String>, AccessorError>;

    fn read_link(&mut self, path: &str) -> Result<String, AccessorError>;

    /// Label used when paths from this accessor appear in messages.
    fn set_path_display(&mut self, display: String);
}

/// Canonicalize an accessor path: leading `/`, no `.` or empty
/// segments, `..` resolved lexically (never above the root).
pub fn canon_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn canonicalizes_paths() {
        assert_eq!(canon_path(""), "/");
        assert_eq!(canon_path("/"), "/");
        assert_eq!(canon_path("a"), "/a");
        assert_eq!(canon_path("a/b/"), "/a/b");
        assert_eq!(canon_path("/a//b/./c"), "/a/b/c");
        assert_eq!(canon_path("a/b/../c"), "/a/c");
        assert_eq!(canon_path("../a"), "/a");
    }
}

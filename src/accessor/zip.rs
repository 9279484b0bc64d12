use std::{collections::BTreeMap, fs::File, io::Read, path::Path};

use zip::ZipArchive;

use super::{canon_path, AccessorError, FileType, InputAccessor, Stat};

#[derive(Debug)]
struct Member {
    index: usize,
    size: u64,
    /// Full POSIX mode from the upper 16 bits of the external
    /// attributes, present when the entry was written on Unix.
    unix_mode: Option<u32>,
}

/// Read-only virtual filesystem over a ZIP archive.
///
/// The archive index is read once into an ordered map so that member
/// lookup is O(log n); the underlying library's name lookup is linear,
/// which is too slow when a single open is followed by many reads.
/// Only entries whose name contains a `/` are indexed; directory
/// entries keep their trailing `/` in the key.
#[derive(Debug)]
pub struct ZipAccessor {
    archive: ZipArchive<File>,
    members: BTreeMap<String, Member>,
    path_display: Option<String>,
}

impl ZipAccessor {
    pub fn open(path: &Path) -> Result<Self, AccessorError> {
        let file = File::open(path)?;
        let mut archive = ZipArchive::new(file)?;

        let mut members = BTreeMap::new();
        for index in 0..archive.len() {
            let entry = archive.by_index_raw(index)?;
            let name = entry.name().to_string();
            if !name.contains('/') {
                continue;
            }
            members.insert(
                format!("/{name}"),
                Member {
                    index,
                    size: entry.size(),
                    unix_mode: entry.unix_mode(),
                },
            );
        }

        Ok(Self {
            archive,
            members,
            path_display: None,
        })
    }

    fn display_path(&self, canon: &str) -> String {
        match &self.path_display {
            Some(display) => format!("{display}{canon}"),
            None => canon.to_string(),
        }
    }
}

impl InputAccessor for ZipAccessor {
    fn path_exists(&mut self, path: &str) -> bool {
        self.members.contains_key(&canon_path(path))
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, AccessorError> {
        let canon = canon_path(path);
        let member = self
            .members
            .get(&canon)
            .ok_or_else(|| AccessorError::NotFound(self.display_path(&canon)))?;
        let size = member.size as usize;

        let mut entry = self.archive.by_index(member.index)?;
        let mut buf = Vec::with_capacity(size);
        entry.read_to_end(&mut buf)?;
        if buf.len() != size {
            return Err(AccessorError::IO(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("archive member '{canon}' is truncated"),
            )));
        }
        Ok(buf)
    }

    fn lstat(&mut self, path: &str) -> Result<Stat, AccessorError> {
        let canon = canon_path(path);

        let mut file_type = FileType::Regular;
        let mut member = self.members.get(&canon);
        if member.is_none() {
            // Directories are stored with a trailing slash.
            member = self.members.get(&format!("{canon}/"));
            file_type = FileType::Directory;
        }
        let member = member.ok_or_else(|| AccessorError::NotFound(self.display_path(&canon)))?;

        let mut is_executable = false;
        if let Some(mode) = member.unix_mode {
            match mode & 0o170000 {
                0o040000 => file_type = FileType::Directory,
                0o100000 => {
                    file_type = FileType::Regular;
                    is_executable = mode & 0o100 != 0;
                }
                0o120000 => file_type = FileType::Symlink,
                _ => {
                    return Err(AccessorError::UnsupportedType {
                        path: self.display_path(&canon),
                    })
                }
            }
        }
        // Entries written on other systems carry no mode; they stay
        // plain regular files (or directories, via the marker).

        Ok(Stat {
            file_type,
            is_executable,
        })
    }

    fn read_directory(
        &mut self,
        path: &str,
    ) -> Result<std::collections::BTreeSet<String>, AccessorError> {
        let canon = canon_path(path);
        let prefix = if canon == "/" {
            canon.clone()
        } else {
            format!("{canon}/")
        };

        let mut entries = std::collections::BTreeSet::new();
        let mut seen_any = false;
        for name in self.members.range(prefix.clone()..) {
            let (name, _) = name;
            if !name.starts_with(&prefix) {
                break;
            }
            seen_any = true;
            let rest = &name[prefix.len()..];
            if rest.is_empty() {
                // The directory marker itself.
                continue;
            }
            match rest.find('/') {
                // A plain immediate child.
                None => {
                    entries.insert(rest.to_string());
                }
                // An immediate child directory marker; deeper
                // descendants are skipped.
                Some(slash) if slash == rest.len() - 1 => {
                    entries.insert(rest[..slash].to_string());
                }
                Some(_) => {}
            }
        }

        if !seen_any && canon != "/" {
            return Err(AccessorError::NotFound(self.display_path(&canon)));
        }
        Ok(entries)
    }

    fn read_link(&mut self, _path: &str) -> Result<String, AccessorError> {
        Err(AccessorError::ReadLinkUnsupported)
    }

    fn set_path_display(&mut self, display: String) {
        self.path_display = Some(display);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    use pretty_assertions::assert_eq;
    use zip::write::SimpleFileOptions;

    fn build_archive() -> tempfile::TempPath {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut writer = zip::ZipWriter::new(file.reopen().unwrap());

        writer
            .add_directory("a", SimpleFileOptions::default().unix_permissions(0o755))
            .unwrap();
        writer
            .start_file(
                "a/b.txt",
                SimpleFileOptions::default().unix_permissions(0o100755),
            )
            .unwrap();
        writer.write_all(b"hello").unwrap();
        writer
            .add_directory("a/c", SimpleFileOptions::default().unix_permissions(0o755))
            .unwrap();
        writer
            .start_file(
                "a/c/d.txt",
                SimpleFileOptions::default().unix_permissions(0o100644),
            )
            .unwrap();
        writer.write_all(b"nested").unwrap();
        writer.finish().unwrap();

        file.into_temp_path()
    }

    #[test]
    fn stats_executables_and_directories() {
        let path = build_archive();
        let mut accessor = ZipAccessor::open(&path).unwrap();

        let stat = accessor.lstat("a/b.txt").unwrap();
        assert_eq!(stat.file_type, FileType::Regular);
        assert!(stat.is_executable);

        let stat = accessor.lstat("a").unwrap();
        assert_eq!(stat.file_type, FileType::Directory);

        let stat = accessor.lstat("a/c/d.txt").unwrap();
        assert_eq!(stat.file_type, FileType::Regular);
        assert!(!stat.is_executable);
    }

    #[test]
    fn reads_files_exactly() {
        let path = build_archive();
        let mut accessor = ZipAccessor::open(&path).unwrap();
        assert_eq!(accessor.read_file("a/b.txt").unwrap(), b"hello");
        assert_eq!(accessor.read_file("/a/c/d.txt").unwrap(), b"nested");
    }

    #[test]
    fn lists_immediate_children_only() {
        let path = build_archive();
        let mut accessor = ZipAccessor::open(&path).unwrap();
        let entries = accessor.read_directory("a").unwrap();
        let expected: std::collections::BTreeSet<String> =
            ["b.txt".to_string(), "c".to_string()].into();
        assert_eq!(entries, expected);
    }

    #[test]
    fn missing_paths() {
        let path = build_archive();
        let mut accessor = ZipAccessor::open(&path).unwrap();
        assert!(!accessor.path_exists("missing"));
        assert!(matches!(
            accessor.read_file("missing"),
            Err(AccessorError::NotFound(_))
        ));
        assert!(matches!(
            accessor.read_directory("a/b.txt"),
            Err(AccessorError::NotFound(_))
        ));
    }

    #[test]
    fn read_link_is_unsupported() {
        let path = build_archive();
        let mut accessor = ZipAccessor::open(&path).unwrap();
        assert!(matches!(
            accessor.read_link("a/b.txt"),
            Err(AccessorError::ReadLinkUnsupported)
        ));
    }
}

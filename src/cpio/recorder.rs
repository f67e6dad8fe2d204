//! Filesystem → records.
//!
//! The recorder replaces host inode numbers with small sequential ones so
//! that two recordings of the same tree produce the same archive, while
//! keeping hard links recognizable: every path that shares a host
//! `(dev, ino)` gets the same synthetic inode, and only the first carries
//! content.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use super::{dev_major, dev_minor, Info, LazyFile, Record, S_IFMT, S_IFREG};
use crate::error::{Error, Result};

/// Host identity of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DevInode {
    dev: u64,
    ino: u64,
}

#[derive(Debug, Clone)]
struct Seen {
    ino: u64,
    first_name: String,
}

/// Turns filesystem entries into records.
///
/// The inode map belongs to one archive. Use a fresh recorder per archive;
/// sharing one across archives leaks inode numbers between them.
#[derive(Debug)]
pub struct Recorder {
    inodes: HashMap<DevInode, Seen>,
    next_ino: u64,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            inodes: HashMap::new(),
            next_ino: 1,
        }
    }

    /// Record `path`, naming the entry after the path itself.
    pub fn get_record(&mut self, path: &Path) -> Result<Record> {
        let name = utf8_name(path, path)?;
        self.record_as(path, &name)
    }

    /// Record `path` under the archive name `name`.
    ///
    /// Symlinks are not followed. A regular file whose host inode was
    /// already recorded under another name comes back without content.
    pub fn record_as(&mut self, path: &Path, name: &str) -> Result<Record> {
        let meta = fs::symlink_metadata(path).map_err(|e| Error::path(path, e))?;
        let (ino, already_recorded) = self.assign_inode(
            DevInode {
                dev: meta.dev(),
                ino: meta.ino(),
            },
            name,
        );

        let mode = u64::from(meta.mode());
        let rdev = meta.rdev();
        let mut info = Info {
            ino,
            mode,
            uid: u64::from(meta.uid()),
            gid: u64::from(meta.gid()),
            nlink: meta.nlink(),
            mtime: u64::try_from(meta.mtime()).unwrap_or(0),
            file_size: 0,
            dev: 0,
            major: dev_major(meta.dev()),
            minor: dev_minor(meta.dev()),
            rmajor: dev_major(rdev),
            rminor: dev_minor(rdev),
            name: name.to_string(),
        };

        if meta.file_type().is_symlink() {
            let target = fs::read_link(path).map_err(|e| Error::path(path, e))?;
            return Ok(Record::static_record(target.as_os_str().as_bytes(), info));
        }

        if mode & S_IFMT == S_IFREG && !already_recorded {
            info.file_size = meta.len();
            let content = LazyFile::new(path, meta.len());
            return Ok(Record::new(info, Some(Arc::new(content))));
        }

        Ok(Record::new(info, None))
    }

    /// Synthetic inode for `key`, and whether another name already
    /// claimed it.
    fn assign_inode(&mut self, key: DevInode, name: &str) -> (u64, bool) {
        if let Some(seen) = self.inodes.get(&key) {
            return (seen.ino, seen.first_name != name);
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.inodes.insert(
            key,
            Seen {
                ino,
                first_name: name.to_string(),
            },
        );
        (ino, false)
    }

    /// Record every entry below `root`, sorted by archive name.
    ///
    /// Names are relative to `root` with `/` separators; `root` itself is
    /// not recorded. Parents sort before their children.
    pub fn record_tree(&mut self, root: &Path) -> Result<Vec<Record>> {
        let mut entries: Vec<(String, PathBuf)> = Vec::new();
        for ent in WalkDir::new(root).follow_links(false).min_depth(1) {
            let ent = ent.map_err(|e| Error::path(root, e.into()))?;
            let rel = utf8_name(ent.path().strip_prefix(root).unwrap_or(ent.path()), ent.path())?;
            entries.push((rel, ent.into_path()));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        tracing::debug!(root = %root.display(), entries = entries.len(), "recording tree");
        entries
            .iter()
            .map(|(name, path)| self.record_as(path, name))
            .collect()
    }
}

/// Archive names are UTF-8; a host name that is not cannot be recorded
/// without altering it.
fn utf8_name(name: &Path, path: &Path) -> Result<String> {
    name.to_str().map(str::to_string).ok_or_else(|| {
        Error::path(
            path,
            io::Error::new(io::ErrorKind::InvalidData, "file name is not valid UTF-8"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpio::{make_all_reproducible, newc};
    use std::ffi::OsStr;
    use std::io::Read;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn populate(root: &Path) {
        fs::create_dir(root.join("bin")).unwrap();
        fs::write(root.join("bin/busybox"), b"\x7fELF-ish").unwrap();
        fs::hard_link(root.join("bin/busybox"), root.join("bin/ls")).unwrap();
        symlink("busybox", root.join("bin/sh")).unwrap();
        fs::write(root.join("init"), b"#!/bin/sh\nexec /bin/sh\n").unwrap();
    }

    #[test]
    fn hardlinks_share_inode_and_skip_content() {
        let temp = TempDir::new().unwrap();
        populate(temp.path());

        let mut recorder = Recorder::new();
        let first = recorder
            .record_as(&temp.path().join("bin/busybox"), "bin/busybox")
            .unwrap();
        let second = recorder
            .record_as(&temp.path().join("bin/ls"), "bin/ls")
            .unwrap();

        assert_eq!(first.info.ino, 1);
        assert_eq!(second.info.ino, first.info.ino);
        assert!(first.content.is_some());
        assert_eq!(first.read_all().unwrap(), b"\x7fELF-ish");
        assert!(second.content.is_none());
        assert_eq!(first.info.dev, 0);
    }

    #[test]
    fn same_path_twice_keeps_content() {
        let temp = TempDir::new().unwrap();
        populate(temp.path());
        let path = temp.path().join("init");

        let mut recorder = Recorder::new();
        let a = recorder.record_as(&path, "init").unwrap();
        let b = recorder.record_as(&path, "init").unwrap();
        assert_eq!(a.info.ino, b.info.ino);
        assert!(b.content.is_some());
    }

    #[test]
    fn symlink_is_not_followed() {
        let temp = TempDir::new().unwrap();
        populate(temp.path());

        let rec = Recorder::new()
            .record_as(&temp.path().join("bin/sh"), "bin/sh")
            .unwrap();
        assert!(rec.info.is_symlink());
        assert_eq!(rec.read_string().unwrap(), "busybox");
    }

    #[test]
    fn non_utf8_name_is_rejected_not_mangled() {
        let temp = TempDir::new().unwrap();
        let bad = temp.path().join(OsStr::from_bytes(b"bad\xff"));
        fs::write(&bad, b"x").unwrap();

        let err = Recorder::new().get_record(&bad).unwrap_err();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::InvalidData));

        let err = Recorder::new().record_tree(temp.path()).unwrap_err();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::InvalidData));
    }

    #[test]
    fn non_utf8_symlink_target_is_kept_verbatim() {
        let temp = TempDir::new().unwrap();
        let link = temp.path().join("link");
        symlink(OsStr::from_bytes(b"tgt\xfe"), &link).unwrap();

        let rec = Recorder::new().record_as(&link, "link").unwrap();
        let mut target = Vec::new();
        rec.reader().read_to_end(&mut target).unwrap();
        assert_eq!(target, b"tgt\xfe");
    }

    #[test]
    fn regular_content_is_lazy() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("big");
        fs::write(&path, vec![7u8; 4096]).unwrap();

        let rec = Recorder::new().get_record(&path).unwrap();
        fs::write(&path, vec![9u8; 4096]).unwrap();
        assert_eq!(rec.read_all().unwrap(), vec![9u8; 4096]);
    }

    #[test]
    fn tree_is_sorted_and_relative() {
        let temp = TempDir::new().unwrap();
        populate(temp.path());

        let records = Recorder::new().record_tree(temp.path()).unwrap();
        let names: Vec<&str> = records.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["bin", "bin/busybox", "bin/ls", "bin/sh", "init"]);
    }

    #[test]
    fn identical_trees_encode_identically() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        populate(a.path());
        populate(b.path());

        let encode = |root: &Path| {
            let records = Recorder::new().record_tree(root).unwrap();
            newc::encode_all(make_all_reproducible(records)).unwrap()
        };
        assert_eq!(encode(a.path()), encode(b.path()));
    }
}

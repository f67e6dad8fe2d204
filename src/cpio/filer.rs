//! Records → filesystem.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut filer = UnixFiler::new("/tmp/rootfs", false);
//! for_each_record(&mut reader, |rec| filer.create(&rec))?;
//! filer.finish()?;
//! ```

use std::collections::HashMap;
use std::ffi::CString;
use std::fs::{self, DirBuilder, OpenOptions, Permissions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{lchown, symlink, DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{makedev, normalize, FileType, Info, Record, MODE_PERM_MASK, S_ISGID, S_ISUID};
use crate::error::{Error, Result};

/// Mode for parent directories the archive does not mention.
const IMPLICIT_DIR_MODE: u32 = 0o755;

/// Materializes records under a root directory.
///
/// Regular files sharing a non-zero inode number become hard links to the
/// first path written with that inode. Directory modes are applied by
/// [`UnixFiler::finish`], after everything inside them exists.
///
/// Device nodes, ownership, and permissions are best effort unless
/// `force_priv` is set: unprivileged extraction is routine and should not
/// fail on `mknod` or `chown`.
#[derive(Debug)]
pub struct UnixFiler {
    root: PathBuf,
    force_priv: bool,
    inodes: HashMap<u64, PathBuf>,
    pending_dirs: Vec<(PathBuf, Info)>,
}

impl UnixFiler {
    pub fn new(root: impl Into<PathBuf>, force_priv: bool) -> Self {
        Self {
            root: root.into(),
            force_priv,
            inodes: HashMap::new(),
            pending_dirs: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the filesystem entry for `rec`.
    ///
    /// Entries whose name escapes the root are skipped with a warning.
    pub fn create(&mut self, rec: &Record) -> Result<()> {
        let name = normalize(&rec.info.name);
        if name == ".." || name.starts_with("../") {
            warn!(name = %rec.info.name, "skipping entry outside extraction root");
            return Ok(());
        }
        let target = if name == "." {
            self.root.clone()
        } else {
            self.root.join(&name)
        };

        if let Some(parent) = target.parent() {
            if !parent.exists() {
                DirBuilder::new()
                    .recursive(true)
                    .mode(IMPLICIT_DIR_MODE)
                    .create(parent)
                    .map_err(|e| Error::path(parent, e))?;
            }
        }

        match rec.info.file_type() {
            Some(FileType::Socket) | Some(FileType::Fifo) => Err(Error::Unsupported(format!(
                "creating IPC endpoint '{name}'"
            ))),
            Some(FileType::Symlink) => {
                let link = rec.read_string()?;
                symlink(&link, &target).map_err(|e| Error::path(&target, e))
            }
            Some(FileType::Regular) => self.create_regular(rec, &target),
            Some(FileType::Directory) => {
                DirBuilder::new()
                    .recursive(true)
                    .mode(perm_bits(&rec.info) | 0o700)
                    .create(&target)
                    .map_err(|e| Error::path(&target, e))?;
                self.pending_dirs.push((target, rec.info.clone()));
                Ok(())
            }
            Some(FileType::Char) | Some(FileType::Block) => {
                if let Err(e) = mknod(&target, &rec.info) {
                    if self.force_priv {
                        return Err(Error::path(&target, e));
                    }
                    warn!(path = %target.display(), error = %e, "mknod failed, skipping device");
                    return Ok(());
                }
                self.apply_modes(&target, &rec.info)
            }
            None => Err(Error::Unsupported(format!(
                "file type {:#o} of '{name}'",
                rec.info.mode & super::S_IFMT
            ))),
        }
    }

    fn create_regular(&mut self, rec: &Record, target: &Path) -> Result<()> {
        let ino = rec.info.ino;
        if ino != 0 {
            if let Some(first) = self.inodes.get(&ino) {
                debug!(link = %target.display(), to = %first.display(), "creating hard link");
                return fs::hard_link(first, target).map_err(|e| Error::path(target, e));
            }
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(perm_bits(&rec.info))
            .open(target)
            .map_err(|e| Error::path(target, e))?;
        let copied = io::copy(&mut rec.reader(), &mut file).map_err(|e| Error::path(target, e))?;
        if rec.content.is_some() && copied < rec.info.file_size {
            return Err(Error::ShortContent {
                name: rec.info.name.clone(),
                want: rec.info.file_size,
                got: copied,
            });
        }
        drop(file);

        if ino != 0 {
            self.inodes.insert(ino, target.to_path_buf());
        }
        self.apply_modes(target, &rec.info)
    }

    /// Permissions without setuid/setgid, then ownership, then the full
    /// mode. A chown clears setuid/setgid, so the final chmod must come
    /// last.
    fn set_modes(path: &Path, info: &Info) -> io::Result<()> {
        let perm = info.mode & MODE_PERM_MASK;
        fs::set_permissions(
            path,
            Permissions::from_mode((perm & !(S_ISUID | S_ISGID)) as u32),
        )?;
        lchown(path, Some(info.uid as u32), Some(info.gid as u32))?;
        fs::set_permissions(path, Permissions::from_mode(perm as u32))?;
        set_mtime(path, info.mtime)
    }

    fn apply_modes(&self, path: &Path, info: &Info) -> Result<()> {
        match Self::set_modes(path, info) {
            Ok(()) => Ok(()),
            Err(e) if self.force_priv => Err(Error::path(path, e)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not apply ownership or mode");
                Ok(())
            }
        }
    }

    /// Apply modes to every directory created so far, deepest first.
    ///
    /// Keeps going past individual failures and reports them together.
    pub fn finish(&mut self) -> Result<()> {
        let mut dirs = std::mem::take(&mut self.pending_dirs);
        dirs.sort_by(|a, b| b.0.components().count().cmp(&a.0.components().count()));

        let mut errors = Vec::new();
        for (path, info) in dirs {
            if let Err(e) = self.apply_modes(&path, &info) {
                errors.push(e);
            }
        }
        match errors.len() {
            0 => Ok(()),
            _ => Err(Error::Aggregate(errors)),
        }
    }
}

fn perm_bits(info: &Info) -> u32 {
    (info.mode & 0o777) as u32
}

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn out_of_range(what: &str, value: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{what} {value:#x} out of range"),
    )
}

fn mknod(path: &Path, info: &Info) -> io::Result<()> {
    let cpath = c_path(path)?;
    let mode = libc::mode_t::try_from(info.mode).map_err(|_| out_of_range("mode", info.mode))?;
    let dev = makedev(info.rmajor, info.rminor) as libc::dev_t;
    // SAFETY: cpath is a valid NUL-terminated string for the duration of the call
    let rc = unsafe { libc::mknod(cpath.as_ptr(), mode, dev) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Set the modification time without touching the access time or
/// following symlinks.
fn set_mtime(path: &Path, mtime: u64) -> io::Result<()> {
    let cpath = c_path(path)?;
    let tv_sec = libc::time_t::try_from(mtime).map_err(|_| out_of_range("mtime", mtime))?;
    let times = [
        libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        libc::timespec { tv_sec, tv_nsec: 0 },
    ];
    let flags = libc::AT_SYMLINK_NOFOLLOW;
    // SAFETY: cpath and times outlive the call; times has the two entries utimensat reads
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, cpath.as_ptr(), times.as_ptr(), flags) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpio::{Recorder, S_IFIFO, S_IFREG};
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    #[test]
    fn unrepresentable_mtime_is_refused_before_the_syscall() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("f");
        fs::write(&path, b"x").unwrap();
        let before = fs::metadata(&path).unwrap().mtime();

        let err = set_mtime(&path, u64::MAX).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(fs::metadata(&path).unwrap().mtime(), before);

        set_mtime(&path, 1_000_000).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().mtime(), 1_000_000);
    }

    #[test]
    fn oversized_mode_is_refused_by_mknod() {
        let temp = TempDir::new().unwrap();
        let info = Info {
            mode: u64::from(u32::MAX) + 1,
            name: "fifo".into(),
            ..Info::default()
        };
        let err = mknod(&temp.path().join("fifo"), &info).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(!temp.path().join("fifo").exists());
    }

    fn owned_file(name: &str, body: &str, perm: u64, owner: &fs::Metadata) -> Record {
        let mut rec = Record::static_file(name, body, perm);
        rec.info.uid = u64::from(owner.uid());
        rec.info.gid = u64::from(owner.gid());
        rec
    }

    #[test]
    fn creates_missing_parents_and_content() {
        let temp = TempDir::new().unwrap();
        let owner = fs::metadata(temp.path()).unwrap();
        let mut filer = UnixFiler::new(temp.path(), false);
        filer
            .create(&owned_file("etc/ssh/sshd_config", "Port 22\n", 0o600, &owner))
            .unwrap();

        let path = temp.path().join("etc/ssh/sshd_config");
        assert_eq!(fs::read_to_string(&path).unwrap(), "Port 22\n");
        assert_eq!(fs::metadata(&path).unwrap().mode() & 0o7777, 0o600);
        assert!(temp.path().join("etc/ssh").is_dir());
    }

    #[test]
    fn shared_inode_becomes_hard_link() {
        let temp = TempDir::new().unwrap();
        let mut filer = UnixFiler::new(temp.path(), false);

        let mut first = Record::static_file("bin/busybox", "elf", 0o755);
        first.info.ino = 4;
        let second = Record::new(
            Info {
                ino: 4,
                mode: S_IFREG | 0o755,
                name: "bin/ls".into(),
                ..Info::default()
            },
            None,
        );
        filer.create(&first).unwrap();
        filer.create(&second).unwrap();

        let a = fs::metadata(temp.path().join("bin/busybox")).unwrap();
        let b = fs::metadata(temp.path().join("bin/ls")).unwrap();
        assert_eq!(a.ino(), b.ino());
        assert_eq!(fs::read(temp.path().join("bin/ls")).unwrap(), b"elf");
    }

    #[test]
    fn recorded_hardlinks_survive_extraction() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("a"), b"same").unwrap();
        fs::hard_link(src.path().join("a"), src.path().join("b")).unwrap();
        let records = Recorder::new().record_tree(src.path()).unwrap();

        let dst = TempDir::new().unwrap();
        let mut filer = UnixFiler::new(dst.path(), false);
        for rec in &records {
            filer.create(rec).unwrap();
        }
        filer.finish().unwrap();

        let a = fs::metadata(dst.path().join("a")).unwrap();
        let b = fs::metadata(dst.path().join("b")).unwrap();
        assert_eq!(a.ino(), b.ino());
    }

    #[test]
    fn escaping_entry_is_skipped() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir(&root).unwrap();
        let mut filer = UnixFiler::new(&root, false);

        filer
            .create(&Record::static_file("../evil", "x", 0o644))
            .unwrap();
        assert!(!temp.path().join("evil").exists());
    }

    #[test]
    fn fifo_is_rejected() {
        let temp = TempDir::new().unwrap();
        let mut filer = UnixFiler::new(temp.path(), false);
        let fifo = Record::new(
            Info {
                mode: S_IFIFO | 0o644,
                name: "pipe".into(),
                ..Info::default()
            },
            None,
        );
        assert!(matches!(filer.create(&fifo), Err(Error::Unsupported(_))));
    }

    #[test]
    fn device_failure_is_not_fatal_without_force() {
        let temp = TempDir::new().unwrap();
        let mut filer = UnixFiler::new(temp.path(), false);
        filer
            .create(&Record::char_dev("dev/null", 0o666, 1, 3))
            .unwrap();
    }

    #[test]
    fn symlink_points_at_content() {
        let temp = TempDir::new().unwrap();
        let mut filer = UnixFiler::new(temp.path(), false);
        filer.create(&Record::symlink("bin/sh", "busybox")).unwrap();
        assert_eq!(
            fs::read_link(temp.path().join("bin/sh")).unwrap(),
            PathBuf::from("busybox")
        );
    }

    #[test]
    fn setuid_survives_ownership_change() {
        let temp = TempDir::new().unwrap();
        let owner = fs::metadata(temp.path()).unwrap();
        let mut filer = UnixFiler::new(temp.path(), true);
        filer
            .create(&owned_file("bin/su", "", 0o4755, &owner))
            .unwrap();
        let mode = fs::metadata(temp.path().join("bin/su")).unwrap().mode();
        assert_eq!(mode & 0o7777, 0o4755);
    }

    #[test]
    fn mtime_is_applied() {
        let temp = TempDir::new().unwrap();
        let owner = fs::metadata(temp.path()).unwrap();
        let mut filer = UnixFiler::new(temp.path(), true);
        let mut rec = owned_file("stamp", "t", 0o644, &owner);
        rec.info.mtime = 1_000_000;
        filer.create(&rec).unwrap();
        assert_eq!(fs::metadata(temp.path().join("stamp")).unwrap().mtime(), 1_000_000);
    }

    #[test]
    fn directory_mode_applied_on_finish() {
        let temp = TempDir::new().unwrap();
        let owner = fs::metadata(temp.path()).unwrap();
        let mut filer = UnixFiler::new(temp.path(), false);
        let mut dir = Record::directory("ro", 0o555);
        dir.info.uid = u64::from(owner.uid());
        dir.info.gid = u64::from(owner.gid());
        filer.create(&dir).unwrap();
        filer
            .create(&owned_file("ro/inside", "x", 0o644, &owner))
            .unwrap();
        filer.finish().unwrap();

        let path = temp.path().join("ro");
        assert_eq!(fs::metadata(&path).unwrap().mode() & 0o777, 0o555);
        fs::set_permissions(&path, Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn finish_collects_every_failure() {
        let temp = TempDir::new().unwrap();
        let mut filer = UnixFiler::new(temp.path(), true);
        filer.create(&Record::directory("a", 0o755)).unwrap();
        filer.create(&Record::directory("b", 0o755)).unwrap();
        fs::remove_dir(temp.path().join("a")).unwrap();
        fs::remove_dir(temp.path().join("b")).unwrap();

        match filer.finish() {
            Err(Error::Aggregate(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregate, got {other:?}"),
        }
    }
}

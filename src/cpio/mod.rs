//! cpio record model and streaming codec.
//!
//! An archive is a linear sequence of [`Record`]s terminated by a trailer
//! record named `TRAILER!!!`. Records flow through [`RecordReader`] and
//! [`RecordWriter`] implementations one at a time, so transforms such as
//! deduplication, reproducibility normalization, and signing compose as
//! wrappers without buffering whole archives.
//!
//! # Example
//!
//! ```rust
//! use bootpack::cpio::{newc, Archive, EofReader, Record, RecordWriter};
//!
//! let mut out = Vec::new();
//! let mut w = newc::Writer::new(&mut out);
//! w.write_record(Record::directory("etc", 0o755)).unwrap();
//! w.write_record(Record::static_file("etc/hostname", "bootpack\n", 0o644)).unwrap();
//! bootpack::cpio::write_trailer(&mut w).unwrap();
//!
//! let mut r = EofReader::new(newc::Reader::new(out.as_slice()));
//! let archive = Archive::read_from(&mut r).unwrap();
//! assert!(archive.has("etc/hostname"));
//! ```

pub mod archive;
pub mod content;
pub mod dedup;
pub mod filer;
pub mod format;
pub mod newc;
pub mod recorder;
pub mod reproducible;
pub mod stream;

use std::fmt;
use std::io;

use crate::error::Result;

pub use archive::Archive;
pub use content::{Content, LazyFile, ReadAt};
pub use dedup::{write_records_and_dirs, DedupWriter};
pub use filer::UnixFiler;
pub use format::{FormatRegistry, RecordFormat};
pub use recorder::Recorder;
pub use reproducible::{make_all_reproducible, make_reproducible, normalize};
pub use stream::{
    concat, for_each_record, passthrough, read_all_records, write_records, write_trailer,
    EofReader,
};

/// Name of the trailer record.
pub const TRAILER: &str = "TRAILER!!!";

// POSIX st_mode bits.
pub const S_IFMT: u64 = 0o170000;
pub const S_IFSOCK: u64 = 0o140000;
pub const S_IFLNK: u64 = 0o120000;
pub const S_IFREG: u64 = 0o100000;
pub const S_IFBLK: u64 = 0o060000;
pub const S_IFDIR: u64 = 0o040000;
pub const S_IFCHR: u64 = 0o020000;
pub const S_IFIFO: u64 = 0o010000;
pub const S_ISUID: u64 = 0o4000;
pub const S_ISGID: u64 = 0o2000;
pub const S_ISVTX: u64 = 0o1000;

/// Permission bits, including setuid/setgid/sticky.
pub const MODE_PERM_MASK: u64 = 0o7777;

/// Major number of a Linux `dev_t`.
pub fn dev_major(dev: u64) -> u64 {
    ((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfff)
}

/// Minor number of a Linux `dev_t`.
pub fn dev_minor(dev: u64) -> u64 {
    (dev & 0xff) | ((dev >> 12) & !0xff)
}

/// Compose a Linux `dev_t` from major and minor numbers.
pub fn makedev(major: u64, minor: u64) -> u64 {
    ((major & 0xffff_f000) << 32)
        | ((major & 0xfff) << 8)
        | ((minor & 0xffff_ff00) << 12)
        | (minor & 0xff)
}

/// File type encoded in the `S_IFMT` bits of a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Socket,
    Symlink,
    Regular,
    Block,
    Directory,
    Char,
    Fifo,
}

impl FileType {
    /// Decode the type bits of `mode`.
    pub fn from_mode(mode: u64) -> Option<Self> {
        match mode & S_IFMT {
            S_IFSOCK => Some(FileType::Socket),
            S_IFLNK => Some(FileType::Symlink),
            S_IFREG => Some(FileType::Regular),
            S_IFBLK => Some(FileType::Block),
            S_IFDIR => Some(FileType::Directory),
            S_IFCHR => Some(FileType::Char),
            S_IFIFO => Some(FileType::Fifo),
            _ => None,
        }
    }

    /// The `ls -l` type character.
    pub fn type_char(self) -> char {
        match self {
            FileType::Socket => 's',
            FileType::Symlink => 'l',
            FileType::Regular => '-',
            FileType::Block => 'b',
            FileType::Directory => 'd',
            FileType::Char => 'c',
            FileType::Fifo => 'p',
        }
    }
}

/// Metadata of one archive entry.
///
/// `name` is archive-relative and always uses `/` separators, whatever
/// the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Info {
    pub ino: u64,
    pub mode: u64,
    pub uid: u64,
    pub gid: u64,
    pub nlink: u64,
    pub mtime: u64,
    pub file_size: u64,
    pub dev: u64,
    pub major: u64,
    pub minor: u64,
    pub rmajor: u64,
    pub rminor: u64,
    pub name: String,
}

impl Info {
    pub fn file_type(&self) -> Option<FileType> {
        FileType::from_mode(self.mode)
    }

    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    /// Permission bits without the type.
    pub fn perm(&self) -> u64 {
        self.mode & MODE_PERM_MASK
    }
}

/// One archive entry: metadata plus lazily-read content.
///
/// Regular files carry their bytes, symlinks carry the link target.
/// Directories and device nodes have no content.
#[derive(Clone, Default)]
pub struct Record {
    pub info: Info,
    pub content: Option<Content>,
}

impl Record {
    pub fn new(info: Info, content: Option<Content>) -> Self {
        Self { info, content }
    }

    /// A record holding `contents`, with `file_size` set to match.
    pub fn static_record(contents: impl Into<Vec<u8>>, mut info: Info) -> Self {
        let contents = contents.into();
        info.file_size = contents.len() as u64;
        Self {
            info,
            content: Some(content::bytes(contents)),
        }
    }

    /// A regular file record.
    pub fn static_file(name: &str, contents: impl Into<Vec<u8>>, perm: u64) -> Self {
        Self::static_record(
            contents,
            Info {
                name: name.to_string(),
                mode: S_IFREG | (perm & MODE_PERM_MASK),
                ..Info::default()
            },
        )
    }

    /// A symlink record at `name` pointing to `target`.
    pub fn symlink(name: &str, target: &str) -> Self {
        Self::static_record(
            target.as_bytes(),
            Info {
                name: name.to_string(),
                mode: S_IFLNK | 0o777,
                ..Info::default()
            },
        )
    }

    /// A directory record.
    pub fn directory(name: &str, mode: u64) -> Self {
        Self {
            info: Info {
                name: name.to_string(),
                mode: S_IFDIR | (mode & !S_IFMT),
                ..Info::default()
            },
            content: None,
        }
    }

    /// A character device record.
    pub fn char_dev(name: &str, perm: u64, rmajor: u64, rminor: u64) -> Self {
        Self {
            info: Info {
                name: name.to_string(),
                mode: S_IFCHR | (perm & MODE_PERM_MASK),
                rmajor,
                rminor,
                ..Info::default()
            },
            content: None,
        }
    }

    /// The end-of-archive sentinel.
    pub fn trailer() -> Self {
        Self::static_record(
            Vec::new(),
            Info {
                name: TRAILER.to_string(),
                ..Info::default()
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn is_trailer(&self) -> bool {
        self.info.name == TRAILER
    }

    /// Sequential reader over the record's content.
    ///
    /// Records without content read as empty.
    pub fn reader(&self) -> content::ContentReader<'_> {
        match &self.content {
            Some(c) => content::ContentReader::new(c.as_ref(), self.info.file_size),
            None => content::ContentReader::new(&EMPTY, 0),
        }
    }

    /// Read the whole content into memory.
    pub fn read_all(&self) -> io::Result<Vec<u8>> {
        match &self.content {
            Some(c) => content::read_all(c.as_ref(), self.info.file_size),
            None => Ok(Vec::new()),
        }
    }

    /// Read the whole content as UTF-8 text.
    pub fn read_string(&self) -> io::Result<String> {
        String::from_utf8(self.read_all()?)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Compare metadata and content.
    pub fn equal(&self, other: &Record) -> io::Result<bool> {
        if self.info != other.info {
            return Ok(false);
        }
        match (&self.content, &other.content) {
            (None, None) => Ok(true),
            (Some(a), Some(b)) => content::content_equal(a.as_ref(), b.as_ref(), self.info.file_size),
            (Some(c), None) | (None, Some(c)) => {
                Ok(self.info.file_size == 0 || c.size()? == 0)
            }
        }
    }

    /// One `ls -l` style line, e.g. `-rw-r--r-- 0 0 5 etc/hostname`.
    pub fn long_listing(&self) -> String {
        let kind = self.info.file_type().map(FileType::type_char).unwrap_or('?');
        let mut line = format!(
            "{}{} {} {} {} {}",
            kind,
            perm_string(self.info.mode),
            self.info.uid,
            self.info.gid,
            match self.info.file_type() {
                Some(FileType::Block) | Some(FileType::Char) =>
                    format!("{}, {}", self.info.rmajor, self.info.rminor),
                _ => self.info.file_size.to_string(),
            },
            self.info.name
        );
        if self.info.is_symlink() {
            if let Ok(target) = self.read_string() {
                line.push_str(" -> ");
                line.push_str(&target);
            }
        }
        line
    }
}

static EMPTY: Vec<u8> = Vec::new();

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("info", &self.info)
            .field("has_content", &self.content.is_some())
            .finish()
    }
}

/// Compare two record sequences pairwise.
pub fn all_equal(a: &[Record], b: &[Record]) -> io::Result<bool> {
    if a.len() != b.len() {
        return Ok(false);
    }
    for (x, y) in a.iter().zip(b) {
        if !x.equal(y)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn perm_string(mode: u64) -> String {
    let mut s = String::with_capacity(9);
    for (shift, special, special_char) in [(6, S_ISUID, 's'), (3, S_ISGID, 's'), (0, S_ISVTX, 't')] {
        let bits = (mode >> shift) & 0o7;
        s.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        s.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        let exec = bits & 0o1 != 0;
        s.push(match (mode & special != 0, exec) {
            (true, true) => special_char,
            (true, false) => special_char.to_ascii_uppercase(),
            (false, true) => 'x',
            (false, false) => '-',
        });
    }
    s
}

/// Source of records in stream order.
pub trait RecordReader {
    /// Returns the next record, or `None` at end of stream.
    fn read_record(&mut self) -> Result<Option<Record>>;
}

/// Sink for records.
pub trait RecordWriter {
    fn write_record(&mut self, rec: Record) -> Result<()>;
}

impl<R: RecordReader + ?Sized> RecordReader for &mut R {
    fn read_record(&mut self) -> Result<Option<Record>> {
        (**self).read_record()
    }
}

impl<R: RecordReader + ?Sized> RecordReader for Box<R> {
    fn read_record(&mut self) -> Result<Option<Record>> {
        (**self).read_record()
    }
}

impl<W: RecordWriter + ?Sized> RecordWriter for &mut W {
    fn write_record(&mut self, rec: Record) -> Result<()> {
        (**self).write_record(rec)
    }
}

impl<W: RecordWriter + ?Sized> RecordWriter for Box<W> {
    fn write_record(&mut self, rec: Record) -> Result<()> {
        (**self).write_record(rec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_type_bits() {
        assert!(Record::static_file("a", "x", 0o644).info.is_regular());
        assert!(Record::directory("d", 0o755).info.is_dir());
        assert!(Record::symlink("l", "target").info.is_symlink());
        assert_eq!(
            Record::char_dev("dev/null", 0o666, 1, 3).info.file_type(),
            Some(FileType::Char)
        );
        assert!(Record::trailer().is_trailer());
    }

    #[test]
    fn directory_mode_strips_foreign_type_bits() {
        let rec = Record::directory("d", S_IFREG | 0o700);
        assert_eq!(rec.info.mode, S_IFDIR | 0o700);
    }

    #[test]
    fn static_record_sets_size() {
        let rec = Record::static_file("init", "#!/bin/sh\n", 0o755);
        assert_eq!(rec.info.file_size, 10);
        assert_eq!(rec.read_string().unwrap(), "#!/bin/sh\n");
    }

    #[test]
    fn equal_compares_content() {
        let a = Record::static_file("a", "one", 0o644);
        let b = Record::static_file("a", "two", 0o644);
        assert!(a.equal(&a.clone()).unwrap());
        assert!(!a.equal(&b).unwrap());
        assert!(all_equal(&[a.clone()], &[a]).unwrap());
    }

    #[test]
    fn device_numbers_roundtrip() {
        for (major, minor) in [(1, 3), (8, 17), (259, 70000), (4095, 255)] {
            let dev = makedev(major, minor);
            assert_eq!((dev_major(dev), dev_minor(dev)), (major, minor));
        }
        assert_eq!(makedev(8, 1), 0x801);
    }

    #[test]
    fn long_listing_shows_symlink_target_and_setuid() {
        let link = Record::symlink("bin/sh", "busybox");
        assert_eq!(link.long_listing(), "lrwxrwxrwx 0 0 7 bin/sh -> busybox");

        let su = Record::static_file("bin/su", "", 0o4755);
        assert!(su.long_listing().starts_with("-rwsr-xr-x"));

        let tty = Record::char_dev("dev/tty", 0o666, 5, 0);
        assert_eq!(tty.long_listing(), "crw-rw-rw- 0 0 5, 0 dev/tty");
    }
}

//! Reproducible-build normalization of records.
//!
//! Two builds from the same logical inputs must emit byte-identical
//! archives, whatever host, user, or clock produced them.

use super::Record;

/// Largest link count the newc header can carry.
pub const MAX_NLINK: u64 = u32::MAX as u64;

/// Normalize an archive path: strip leading `/`, then clean it lexically
/// with POSIX rules.
///
/// Host path semantics are never consulted, so a Windows build host
/// produces the same names as a Linux one.
///
/// ```
/// use bootpack::cpio::normalize;
///
/// assert_eq!(normalize("/foo/bar/../baz"), "foo/baz");
/// assert_eq!(normalize(""), ".");
/// ```
pub fn normalize(name: &str) -> String {
    clean(name.trim_start_matches('/'))
}

/// Lexical POSIX cleaning of a relative path: collapse separators, drop
/// `.`, resolve `..` against preceding components.
fn clean(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return ".".to_string();
    }
    parts.join("/")
}

/// Strip host-specific metadata from a record.
///
/// `ino` survives: a stable non-zero inode is what lets extraction rebuild
/// hard links. A link count above one is clamped to [`MAX_NLINK`] because
/// the true count is unknowable from a subset of the links.
pub fn make_reproducible(mut rec: Record) -> Record {
    rec.info.mtime = 0;
    rec.info.uid = 0;
    rec.info.gid = 0;
    rec.info.dev = 0;
    rec.info.major = 0;
    rec.info.minor = 0;
    rec.info.name = normalize(&rec.info.name);
    if rec.info.nlink > 1 {
        rec.info.nlink = MAX_NLINK;
    }
    rec
}

/// [`make_reproducible`] over a whole sequence.
pub fn make_all_reproducible(records: impl IntoIterator<Item = Record>) -> Vec<Record> {
    records.into_iter().map(make_reproducible).collect()
}

//! First-wins deduplication and parent directory synthesis.

use std::collections::HashSet;

use super::{normalize, Record, RecordWriter};
use crate::error::{Error, Result};

/// Mode given to directories synthesized for missing ancestors.
const SYNTHETIC_DIR_MODE: u64 = 0o777;

/// Drops records whose normalized name was already written.
///
/// Merging overlapping file sets from several sources is routine, so a
/// repeat is not an error: the first record for a name wins and later ones
/// are discarded silently.
pub struct DedupWriter<W> {
    inner: W,
    seen: HashSet<String>,
}

impl<W: RecordWriter> DedupWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            seen: HashSet::new(),
        }
    }

    /// Whether `name` (after normalization) has already been written.
    pub fn contains(&self, name: &str) -> bool {
        self.seen.contains(&normalize(name))
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: RecordWriter> RecordWriter for DedupWriter<W> {
    fn write_record(&mut self, mut rec: Record) -> Result<()> {
        let name = normalize(&rec.info.name);
        if self.seen.contains(&name) {
            tracing::debug!(name = %rec.info.name, "dropping duplicate record");
            return Ok(());
        }
        self.seen.insert(name.clone());
        rec.info.name = name;
        self.inner.write_record(rec)
    }
}

/// Write each record preceded by directory records for all of its
/// ancestors, outermost first.
///
/// Kernel initramfs unpacking does not create missing parents, so every
/// path must have its directories emitted before it. Ancestors already
/// written are skipped by the dedup set. A record whose own name was
/// already written fails with [`Error::AlreadyExists`].
pub fn write_records_and_dirs<W, I>(w: &mut DedupWriter<W>, records: I) -> Result<()>
where
    W: RecordWriter,
    I: IntoIterator<Item = Record>,
{
    for rec in records {
        let name = normalize(&rec.info.name);
        if w.seen.contains(&name) {
            return Err(Error::AlreadyExists(name));
        }
        for dir in ancestors(&name) {
            w.write_record(Record::directory(dir, SYNTHETIC_DIR_MODE))?;
        }
        w.write_record(rec)?;
    }
    Ok(())
}

/// Proper ancestors of a normalized relative path, outermost first.
fn ancestors(name: &str) -> impl Iterator<Item = &str> {
    name.match_indices('/').map(move |(i, _)| &name[..i])
}

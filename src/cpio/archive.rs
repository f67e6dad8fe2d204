//! In-memory archive: records in write order plus a name index.

use std::collections::HashMap;
use std::io;

use super::{for_each_record, normalize, write_trailer, Record, RecordReader, RecordWriter};
use crate::error::Result;

/// An ordered, name-indexed collection of records.
///
/// Names are normalized on insertion. Writing a record whose name is
/// already present replaces the earlier one in place, keeping its
/// position. Trailer records are never stored.
#[derive(Debug, Clone, Default)]
pub struct Archive {
    records: Vec<Record>,
    index: HashMap<String, usize>,
}

impl Archive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain a record stream into a new archive.
    pub fn read_from<R: RecordReader + ?Sized>(r: &mut R) -> Result<Self> {
        let mut archive = Self::new();
        for_each_record(r, |rec| {
            archive.insert(rec);
            Ok(())
        })?;
        Ok(archive)
    }

    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        let mut archive = Self::new();
        for rec in records {
            archive.insert(rec);
        }
        archive
    }

    fn insert(&mut self, mut rec: Record) {
        if rec.is_trailer() {
            return;
        }
        rec.info.name = normalize(&rec.info.name);
        match self.index.get(&rec.info.name) {
            Some(&i) => self.records[i] = rec,
            None => {
                self.index.insert(rec.info.name.clone(), self.records.len());
                self.records.push(rec);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Record> {
        self.index.get(&normalize(name)).map(|&i| &self.records[i])
    }

    pub fn has(&self, name: &str) -> bool {
        self.index.contains_key(&normalize(name))
    }

    /// Whether a record equal to `rec` in metadata and content is present.
    pub fn contains(&self, rec: &Record) -> io::Result<bool> {
        match self.get(&rec.info.name) {
            Some(ours) => ours.equal(rec),
            None => Ok(false),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Records strictly below directory `dir`, in archive order.
    pub fn files_under<'a>(&'a self, dir: &str) -> impl Iterator<Item = &'a Record> + 'a {
        let prefix = format!("{}/", normalize(dir));
        self.records
            .iter()
            .filter(move |r| r.info.name.starts_with(&prefix))
    }

    /// A record reader over this archive, in order, without a trailer.
    pub fn reader(&self) -> ArchiveReader<'_> {
        ArchiveReader {
            records: self.records.iter(),
        }
    }

    /// Serialize every record followed by a trailer.
    pub fn write_to<W: RecordWriter + ?Sized>(&self, w: &mut W) -> Result<()> {
        for rec in &self.records {
            w.write_record(rec.clone())?;
        }
        write_trailer(w)
    }
}

impl RecordWriter for Archive {
    fn write_record(&mut self, rec: Record) -> Result<()> {
        self.insert(rec);
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Archive {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Reads records back out of an [`Archive`].
pub struct ArchiveReader<'a> {
    records: std::slice::Iter<'a, Record>,
}

impl RecordReader for ArchiveReader<'_> {
    fn read_record(&mut self) -> Result<Option<Record>> {
        Ok(self.records.next().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpio::{newc, read_all_records, EofReader};

    fn sample() -> Archive {
        Archive::from_records(vec![
            Record::directory("metadata", 0o755),
            Record::static_file("metadata/name", "rescue", 0o644),
            Record::static_file("metadata/extra/deep", "x", 0o644),
            Record::static_file("metadataish", "no", 0o644),
            Record::static_file("package_type", "linux", 0o644),
        ])
    }

    #[test]
    fn lookup_normalizes_query() {
        let archive = sample();
        assert!(archive.has("/package_type"));
        assert!(archive.has("metadata//name"));
        assert!(!archive.has("missing"));
        assert_eq!(archive.len(), 5);
    }

    #[test]
    fn later_write_replaces_in_place() {
        let mut archive = sample();
        archive
            .write_record(Record::static_file("/metadata/name", "other", 0o644))
            .unwrap();
        assert_eq!(archive.len(), 5);
        assert_eq!(archive.records()[1].read_string().unwrap(), "other");
    }

    #[test]
    fn files_under_respects_component_boundary() {
        let archive = sample();
        let under: Vec<&str> = archive.files_under("metadata").map(|r| r.name()).collect();
        assert_eq!(under, vec!["metadata/name", "metadata/extra/deep"]);
    }

    #[test]
    fn contains_compares_content() {
        let archive = sample();
        assert!(archive
            .contains(&Record::static_file("package_type", "linux", 0o644))
            .unwrap());
        assert!(!archive
            .contains(&Record::static_file("package_type", "pe", 0o644))
            .unwrap());
    }

    #[test]
    fn write_to_then_read_from() {
        let archive = sample();
        let mut w = newc::Writer::new(Vec::new());
        archive.write_to(&mut w).unwrap();
        let bytes = w.into_inner();

        let back = Archive::read_from(&mut EofReader::new(newc::Reader::new(bytes.as_slice())))
            .unwrap();
        assert_eq!(back.len(), archive.len());
        for rec in &archive {
            assert!(back.contains(rec).unwrap());
        }
    }

    #[test]
    fn trailer_is_not_stored() {
        let mut archive = Archive::new();
        archive.write_record(Record::trailer()).unwrap();
        assert!(archive.is_empty());
        assert!(read_all_records(&mut archive.reader()).unwrap().is_empty());
    }
}

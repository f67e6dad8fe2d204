//! Named record formats.
//!
//! Command-line collaborators pick a wire format by name ("newc"). The
//! registry is an explicit value built once at startup and passed to
//! whoever needs it.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use super::{newc, Content, RecordReader, RecordWriter};
use crate::error::{Error, Result};

/// A wire format that can produce record readers and writers over byte
/// streams.
pub trait RecordFormat: Send + Sync {
    fn name(&self) -> &'static str;

    fn reader<'a>(&self, source: Box<dyn Read + 'a>) -> Box<dyn RecordReader + 'a>;

    /// A reader over a random-access source whose records borrow their
    /// content from `source` instead of copying it.
    fn reader_at(&self, source: Content) -> Box<dyn RecordReader>;

    fn writer<'a>(&self, sink: Box<dyn Write + 'a>) -> Box<dyn RecordWriter + 'a>;
}

/// The SVR4 newc format.
#[derive(Debug, Clone, Copy, Default)]
pub struct Newc;

impl RecordFormat for Newc {
    fn name(&self) -> &'static str {
        "newc"
    }

    fn reader<'a>(&self, source: Box<dyn Read + 'a>) -> Box<dyn RecordReader + 'a> {
        Box::new(newc::Reader::new(source))
    }

    fn reader_at(&self, source: Content) -> Box<dyn RecordReader> {
        Box::new(newc::ReaderAt::new(source))
    }

    fn writer<'a>(&self, sink: Box<dyn Write + 'a>) -> Box<dyn RecordWriter + 'a> {
        Box::new(newc::Writer::new(sink))
    }
}

/// Format name → implementation.
#[derive(Clone, Default)]
pub struct FormatRegistry {
    formats: BTreeMap<String, Arc<dyn RecordFormat>>,
}

impl FormatRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in format.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Newc));
        registry
    }

    /// Register `format` under its own name, replacing any previous entry.
    pub fn register(&mut self, format: Arc<dyn RecordFormat>) {
        self.formats.insert(format.name().to_string(), format);
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn RecordFormat>> {
        self.formats
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownFormat(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.formats.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpio::content::{bytes, read_all};
    use crate::cpio::{read_all_records, write_trailer, EofReader, Record};
    use crate::error::ErrorCategory;

    #[test]
    fn lookup_newc_roundtrips() {
        let registry = FormatRegistry::with_defaults();
        let format = registry.lookup("newc").unwrap();

        let mut out = Vec::new();
        {
            let mut w = format.writer(Box::new(&mut out));
            w.write_record(Record::static_file("init", "x", 0o755)).unwrap();
            write_trailer(&mut w).unwrap();
        }

        let mut r = EofReader::new(format.reader(Box::new(out.as_slice())));
        let records = read_all_records(&mut r).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name(), "init");
        drop(records);
        drop(r);

        let mut r = EofReader::new(format.reader_at(bytes(out)));
        let records = read_all_records(&mut r).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(read_all(records[0].content.as_deref().unwrap(), 1).unwrap(), b"x");
    }

    #[test]
    fn unknown_format_is_reported() {
        let err = FormatRegistry::with_defaults().lookup("odc").err().unwrap();
        assert!(matches!(&err, Error::UnknownFormat(name) if name == "odc"));
        assert_eq!(err.category(), ErrorCategory::Format);
    }

    #[test]
    fn empty_registry_knows_nothing() {
        let registry = FormatRegistry::new();
        assert!(registry.names().is_empty());
        assert!(registry.lookup("newc").is_err());
        assert_eq!(FormatRegistry::with_defaults().names(), vec!["newc"]);
    }
}

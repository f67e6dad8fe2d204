//! Record stream plumbing: trailer handling, bulk writes, and copying
//! between readers and writers one record at a time.

use super::{Record, RecordReader, RecordWriter};
use crate::error::{Error, Result};

/// Turns the trailer record into end of stream.
///
/// Byte-stream readers hand back `TRAILER!!!` like any other record;
/// callers that only want content records wrap them in this adapter.
pub struct EofReader<R> {
    inner: R,
    done: bool,
}

impl<R: RecordReader> EofReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, done: false }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: RecordReader> RecordReader for EofReader<R> {
    fn read_record(&mut self) -> Result<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        match self.inner.read_record()? {
            Some(rec) if rec.is_trailer() => {
                self.done = true;
                Ok(None)
            }
            other => Ok(other),
        }
    }
}

/// Write every record, stopping at the first failure.
///
/// The error names the record that failed.
pub fn write_records<W, I>(w: &mut W, records: I) -> Result<()>
where
    W: RecordWriter + ?Sized,
    I: IntoIterator<Item = Record>,
{
    for rec in records {
        let name = rec.info.name.clone();
        w.write_record(rec).map_err(|e| annotate(&name, e))?;
    }
    Ok(())
}

fn annotate(name: &str, err: Error) -> Error {
    match err {
        Error::Io(source) => Error::path(name, source),
        other => other,
    }
}

/// Append the trailer record.
pub fn write_trailer<W: RecordWriter + ?Sized>(w: &mut W) -> Result<()> {
    w.write_record(Record::trailer())
}

/// Copy every record from `r` to `w`, applying `transform` to each.
///
/// Holds one record at a time. Does not write a trailer.
pub fn concat<W, R>(
    w: &mut W,
    r: &mut R,
    transform: Option<&dyn Fn(Record) -> Record>,
) -> Result<()>
where
    W: RecordWriter + ?Sized,
    R: RecordReader + ?Sized,
{
    for_each_record(r, |rec| {
        let rec = match transform {
            Some(f) => f(rec),
            None => rec,
        };
        w.write_record(rec)
    })
}

/// [`concat`] followed by a trailer.
pub fn passthrough<R, W>(r: &mut R, w: &mut W) -> Result<()>
where
    R: RecordReader + ?Sized,
    W: RecordWriter + ?Sized,
{
    concat(w, r, None)?;
    write_trailer(w)
}

/// Drain `r` into a vector, in stream order.
pub fn read_all_records<R: RecordReader + ?Sized>(r: &mut R) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    for_each_record(r, |rec| {
        records.push(rec);
        Ok(())
    })?;
    Ok(records)
}

/// Apply `f` to every record until end of stream or the first error.
pub fn for_each_record<R, F>(r: &mut R, mut f: F) -> Result<()>
where
    R: RecordReader + ?Sized,
    F: FnMut(Record) -> Result<()>,
{
    while let Some(rec) = r.read_record()? {
        f(rec)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpio::newc;

    struct Failing {
        written: Vec<String>,
        fail_on: &'static str,
    }

    impl RecordWriter for Failing {
        fn write_record(&mut self, rec: Record) -> Result<()> {
            if rec.info.name == self.fail_on {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into());
            }
            self.written.push(rec.info.name);
            Ok(())
        }
    }

    #[test]
    fn eof_reader_hides_trailer() {
        let bytes = newc::encode_all(vec![Record::static_file("a", "1", 0o644)]).unwrap();
        let mut r = EofReader::new(newc::Reader::new(bytes.as_slice()));
        assert_eq!(r.read_record().unwrap().unwrap().name(), "a");
        assert!(r.read_record().unwrap().is_none());
        assert!(r.read_record().unwrap().is_none());
    }

    #[test]
    fn eof_reader_ignores_bytes_after_trailer() {
        let mut bytes = newc::encode_all(Vec::new()).unwrap();
        bytes.extend_from_slice(&[0u8; 512]);
        let mut r = EofReader::new(newc::Reader::new(bytes.as_slice()));
        assert!(r.read_record().unwrap().is_none());
    }

    #[test]
    fn write_records_stops_and_names_failure() {
        let mut w = Failing {
            written: Vec::new(),
            fail_on: "b",
        };
        let err = write_records(
            &mut w,
            vec![
                Record::static_file("a", "", 0o644),
                Record::static_file("b", "", 0o644),
                Record::static_file("c", "", 0o644),
            ],
        )
        .unwrap_err();
        assert_eq!(w.written, vec!["a".to_string()]);
        assert!(err.to_string().contains("'b'"));
    }

    #[test]
    fn concat_applies_transform() {
        let bytes = newc::encode_all(vec![
            Record::static_file("a", "1", 0o644),
            Record::static_file("b", "2", 0o644),
        ])
        .unwrap();
        let mut r = EofReader::new(newc::Reader::new(bytes.as_slice()));
        let mut out = crate::cpio::Archive::new();
        let relocate: &dyn Fn(Record) -> Record = &|mut rec: Record| {
            rec.info.name = format!("boot/{}", rec.info.name);
            rec
        };
        concat(&mut out, &mut r, Some(relocate)).unwrap();
        assert!(out.has("boot/a"));
        assert!(out.has("boot/b"));
        assert!(!out.has("a"));
    }

    #[test]
    fn passthrough_reencodes_identically() {
        let bytes = newc::encode_all(vec![
            Record::directory("etc", 0o755),
            Record::static_file("etc/issue", "hello\n", 0o644),
        ])
        .unwrap();
        let mut r = EofReader::new(newc::Reader::new(bytes.as_slice()));
        let mut w = newc::Writer::new(Vec::new());
        passthrough(&mut r, &mut w).unwrap();
        assert_eq!(w.into_inner(), bytes);
    }
}

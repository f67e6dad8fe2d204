//! The SVR4 "newc" cpio wire format.
//!
//! Every record is a 110-byte ASCII header followed by the NUL-terminated
//! name and the content, each padded to a 4-byte boundary:
//!
//! ```text
//! 070701 ino mode uid gid nlink mtime filesize major minor rmajor rminor namesize check
//! ^ magic  13 fields of 8 lowercase hex digits, check is always 00000000
//! ```
//!
//! This is the layout the Linux kernel unpacks as an initramfs, so the
//! writer output must stay bit-exact.

use std::io::{self, Read, Write};
use std::sync::Arc;

use super::content::{read_full, Content, ReadAt, Section, COPY_BUF_SIZE};
use super::{Info, Record, RecordReader, RecordWriter};
use crate::error::{Error, Result};

pub const MAGIC: &[u8; 6] = b"070701";
/// The "crc" variant; structurally identical, the check field is ignored.
pub const CRC_MAGIC: &[u8; 6] = b"070702";

const FIELD_LEN: usize = 8;
const FIELD_COUNT: usize = 13;
pub const HEADER_LEN: usize = MAGIC.len() + FIELD_LEN * FIELD_COUNT;

/// Refuse names longer than this when decoding.
const MAX_NAME_LEN: u64 = 4096;

fn pad_len(len: u64) -> usize {
    ((4 - (len % 4)) % 4) as usize
}

/// Streaming newc encoder.
pub struct Writer<W: Write> {
    inner: W,
    pos: u64,
}

impl<W: Write> Writer<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, pos: 0 }
    }

    /// Bytes written so far.
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn put(&mut self, buf: &[u8]) -> io::Result<()> {
        self.inner.write_all(buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn pad(&mut self) -> io::Result<()> {
        let n = pad_len(self.pos);
        if n > 0 {
            self.put(&[0u8; 4][..n])?;
        }
        Ok(())
    }
}

fn encode_header(info: &Info, file_size: u64) -> Result<Vec<u8>> {
    let namesize = info.name.len() as u64 + 1;
    let fields: [(&'static str, u64); FIELD_COUNT] = [
        ("ino", info.ino),
        ("mode", info.mode),
        ("uid", info.uid),
        ("gid", info.gid),
        ("nlink", info.nlink),
        ("mtime", info.mtime),
        ("filesize", file_size),
        ("major", info.major),
        ("minor", info.minor),
        ("rmajor", info.rmajor),
        ("rminor", info.rminor),
        ("namesize", namesize),
        ("check", 0),
    ];

    let mut hdr = Vec::with_capacity(HEADER_LEN);
    hdr.extend_from_slice(MAGIC);
    for (field, value) in fields {
        if value > u64::from(u32::MAX) {
            return Err(Error::FieldOverflow {
                name: info.name.clone(),
                field,
                value,
            });
        }
        hdr.extend_from_slice(format!("{:08x}", value).as_bytes());
    }
    Ok(hdr)
}

impl<W: Write> RecordWriter for Writer<W> {
    fn write_record(&mut self, rec: Record) -> Result<()> {
        let file_size = if rec.content.is_some() {
            rec.info.file_size
        } else {
            0
        };

        let hdr = encode_header(&rec.info, file_size)?;
        self.put(&hdr)?;
        self.put(rec.info.name.as_bytes())?;
        self.put(&[0])?;
        self.pad()?;

        if file_size > 0 {
            let mut src = rec.reader();
            let mut buf = vec![0u8; COPY_BUF_SIZE.min(file_size as usize)];
            let mut copied = 0u64;
            while copied < file_size {
                let want = buf.len().min((file_size - copied) as usize);
                let n = read_full(&mut src, &mut buf[..want])?;
                if n == 0 {
                    return Err(Error::ShortContent {
                        name: rec.info.name,
                        want: file_size,
                        got: copied,
                    });
                }
                self.put(&buf[..n])?;
                copied += n as u64;
            }
            self.pad()?;
        }
        Ok(())
    }
}

/// Streaming newc decoder.
///
/// Each record's content is read into memory as the record is decoded;
/// nothing beyond the current record is buffered. Prefer [`ReaderAt`]
/// when the archive is a seekable file. The trailer is returned
/// as an ordinary record: wrap in [`super::EofReader`] to stop there.
pub struct Reader<R: Read> {
    inner: R,
    pos: u64,
}

impl<R: Read> Reader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, pos: 0 }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn read_counted(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_exact(buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn skip_pad(&mut self) -> io::Result<()> {
        let n = pad_len(self.pos);
        if n > 0 {
            let mut pad = [0u8; 4];
            self.read_counted(&mut pad[..n])?;
        }
        Ok(())
    }
}

fn parse_field(raw: &[u8], field: &str) -> Result<u64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| u64::from_str_radix(s, 16).ok())
        .ok_or_else(|| {
            Error::MalformedHeader(format!(
                "field {field} is not hex: {:?}",
                String::from_utf8_lossy(raw)
            ))
        })
}

/// Fixed-size part of a decoded header.
struct Header {
    info: Info,
    namesize: u64,
}

fn parse_header(hdr: &[u8; HEADER_LEN]) -> Result<Header> {
    let magic = &hdr[..MAGIC.len()];
    if magic != MAGIC && magic != CRC_MAGIC {
        return Err(Error::MalformedHeader(format!(
            "bad magic {:?}",
            String::from_utf8_lossy(magic)
        )));
    }

    let mut fields = [0u64; FIELD_COUNT];
    for (i, chunk) in hdr[MAGIC.len()..].chunks(FIELD_LEN).enumerate() {
        fields[i] = parse_field(chunk, FIELD_NAMES[i])?;
    }
    let [ino, mode, uid, gid, nlink, mtime, file_size, major, minor, rmajor, rminor, namesize, _check] =
        fields;

    if namesize == 0 || namesize > MAX_NAME_LEN {
        return Err(Error::MalformedHeader(format!(
            "name size {namesize} out of range"
        )));
    }
    Ok(Header {
        info: Info {
            ino,
            mode,
            uid,
            gid,
            nlink,
            mtime,
            file_size,
            dev: 0,
            major,
            minor,
            rmajor,
            rminor,
            name: String::new(),
        },
        namesize,
    })
}

fn decode_name(mut raw: Vec<u8>) -> Result<String> {
    if raw.pop() != Some(0) {
        return Err(Error::MalformedHeader("name is not NUL-terminated".into()));
    }
    String::from_utf8(raw).map_err(|_| Error::MalformedHeader("name is not valid UTF-8".into()))
}

fn truncated_header(n: usize) -> Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("truncated cpio header: {n} of {HEADER_LEN} bytes"),
    )
    .into()
}

impl<R: Read> RecordReader for Reader<R> {
    fn read_record(&mut self) -> Result<Option<Record>> {
        let mut hdr = [0u8; HEADER_LEN];
        let n = read_full(&mut self.inner, &mut hdr)?;
        if n == 0 {
            return Ok(None);
        }
        if n < HEADER_LEN {
            return Err(truncated_header(n));
        }
        self.pos += HEADER_LEN as u64;
        let Header { mut info, namesize } = parse_header(&hdr)?;

        let mut name = vec![0u8; namesize as usize];
        self.read_counted(&mut name)?;
        info.name = decode_name(name)?;
        self.skip_pad()?;

        let file_size = info.file_size;
        let mut data = Vec::new();
        if file_size > 0 {
            let got = (&mut self.inner).take(file_size).read_to_end(&mut data)? as u64;
            self.pos += got;
            if got < file_size {
                return Err(Error::ShortContent {
                    name: info.name,
                    want: file_size,
                    got,
                });
            }
            self.skip_pad()?;
        }
        Ok(Some(Record::static_record(data, info)))
    }
}

/// Random-access newc decoder.
///
/// Only headers and names are read while decoding. Each record's content
/// is a [`Section`] of the shared source, read when the consumer asks for
/// it, so listing or verifying a large archive never holds a whole member
/// in memory.
pub struct ReaderAt {
    source: Content,
    pos: u64,
}

impl ReaderAt {
    pub fn new(source: Content) -> Self {
        Self { source, pos: 0 }
    }

    /// Offset of the next header.
    pub fn position(&self) -> u64 {
        self.pos
    }

    fn fill(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.source.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    fn align(&mut self) {
        self.pos += pad_len(self.pos) as u64;
    }
}

impl RecordReader for ReaderAt {
    fn read_record(&mut self) -> Result<Option<Record>> {
        let mut hdr = [0u8; HEADER_LEN];
        let n = self.fill(&mut hdr, self.pos)?;
        if n == 0 {
            return Ok(None);
        }
        if n < HEADER_LEN {
            return Err(truncated_header(n));
        }
        self.pos += HEADER_LEN as u64;
        let Header { mut info, namesize } = parse_header(&hdr)?;

        let mut name = vec![0u8; namesize as usize];
        if self.fill(&mut name, self.pos)? < name.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated cpio name").into());
        }
        self.pos += namesize;
        info.name = decode_name(name)?;
        self.align();

        let file_size = info.file_size;
        let available = self.source.size()?.saturating_sub(self.pos);
        if available < file_size {
            return Err(Error::ShortContent {
                name: info.name,
                want: file_size,
                got: available,
            });
        }
        let content: Content = Arc::new(Section::new(self.source.clone(), self.pos, file_size));
        self.pos += file_size;
        if file_size > 0 {
            self.align();
        }
        Ok(Some(Record::new(info, Some(content))))
    }
}

const FIELD_NAMES: [&str; FIELD_COUNT] = [
    "ino", "mode", "uid", "gid", "nlink", "mtime", "filesize", "major", "minor", "rmajor",
    "rminor", "namesize", "check",
];

/// Encode `records` followed by a trailer into a byte vector.
pub fn encode_all(records: impl IntoIterator<Item = Record>) -> Result<Vec<u8>> {
    let mut w = Writer::new(Vec::new());
    for rec in records {
        w.write_record(rec)?;
    }
    super::write_trailer(&mut w)?;
    Ok(w.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpio::{content, read_all_records, EofReader, S_IFREG};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn decode(bytes: &[u8]) -> Vec<Record> {
        read_all_records(&mut EofReader::new(Reader::new(bytes))).unwrap()
    }

    #[test]
    fn header_layout_is_bit_exact() {
        let rec = Record::static_record(
            b"hi".to_vec(),
            Info {
                ino: 2,
                mode: S_IFREG | 0o644,
                nlink: 1,
                name: "a".into(),
                ..Info::default()
            },
        );
        let mut w = Writer::new(Vec::new());
        w.write_record(rec).unwrap();
        let out = w.into_inner();

        let expected_hdr = concat!(
            "070701",
            "00000002", "000081a4", "00000000", "00000000", "00000001", "00000000",
            "00000002", "00000000", "00000000", "00000000", "00000000", "00000002",
            "00000000",
        );
        assert_eq!(&out[..HEADER_LEN], expected_hdr.as_bytes());
        // name "a\0" ends at 112, already aligned; content "hi" padded to 116
        assert_eq!(&out[HEADER_LEN..HEADER_LEN + 2], b"a\0");
        assert_eq!(&out[112..114], b"hi");
        assert_eq!(out.len(), 116);
        assert_eq!(&out[114..], &[0, 0]);
    }

    #[test]
    fn trailer_bytes() {
        let out = encode_all(Vec::new()).unwrap();
        assert!(out.starts_with(MAGIC));
        assert_eq!(&out[HEADER_LEN..HEADER_LEN + 11], b"TRAILER!!!\0");
        assert_eq!(out.len() % 4, 0);
    }

    #[test]
    fn roundtrip_preserves_metadata_and_content() {
        let records = vec![
            Record::directory("etc", 0o755),
            Record::static_file("etc/motd", "welcome\n", 0o644),
            Record::symlink("bin/sh", "busybox"),
            Record::char_dev("dev/console", 0o600, 5, 1),
            Record::static_record(
                b"x".repeat(70_000),
                Info {
                    ino: 9,
                    mode: S_IFREG | 0o755,
                    uid: 1000,
                    gid: 100,
                    nlink: 2,
                    mtime: 1_700_000_000,
                    major: 8,
                    minor: 1,
                    name: "usr/bin/big".into(),
                    ..Info::default()
                },
            ),
        ];
        let bytes = encode_all(records.clone()).unwrap();
        let back = decode(&bytes);
        assert_eq!(back.len(), records.len());
        for (orig, got) in records.iter().zip(&back) {
            assert!(orig.equal(got).unwrap(), "mismatch for {}", orig.name());
        }
    }

    #[test]
    fn reader_returns_trailer_without_eof_adapter() {
        let bytes = encode_all(vec![Record::static_file("a", "1", 0o644)]).unwrap();
        let mut r = Reader::new(bytes.as_slice());
        assert_eq!(r.read_record().unwrap().unwrap().name(), "a");
        assert!(r.read_record().unwrap().unwrap().is_trailer());
        assert!(r.read_record().unwrap().is_none());
    }

    #[test]
    fn bad_magic_is_malformed() {
        let mut bytes = encode_all(Vec::new()).unwrap();
        bytes[..6].copy_from_slice(b"070707");
        let err = Reader::new(bytes.as_slice()).read_record().unwrap_err();
        assert!(matches!(err, Error::MalformedHeader(_)));
    }

    #[test]
    fn non_hex_field_is_malformed() {
        let mut bytes = encode_all(Vec::new()).unwrap();
        bytes[6] = b'z';
        let err = Reader::new(bytes.as_slice()).read_record().unwrap_err();
        assert!(matches!(err, Error::MalformedHeader(_)));
    }

    #[test]
    fn truncated_content_is_short() {
        let bytes = encode_all(vec![Record::static_file("f", "0123456789", 0o644)]).unwrap();
        let cut = &bytes[..HEADER_LEN + 2 + 5];
        let err = Reader::new(cut).read_record().unwrap_err();
        assert!(matches!(err, Error::ShortContent { want: 10, got: 5, .. }));
    }

    #[test]
    fn truncated_header_is_unexpected_eof() {
        let bytes = encode_all(Vec::new()).unwrap();
        let err = Reader::new(&bytes[..50]).read_record().unwrap_err();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn oversized_field_is_rejected() {
        let rec = Record::static_record(
            Vec::new(),
            Info {
                uid: u64::from(u32::MAX) + 1,
                mode: S_IFREG,
                name: "f".into(),
                ..Info::default()
            },
        );
        let err = Writer::new(Vec::new()).write_record(rec).unwrap_err();
        assert!(matches!(err, Error::FieldOverflow { field: "uid", .. }));
    }

    #[test]
    fn record_without_content_is_written_empty() {
        let mut rec = Record::directory("d", 0o755);
        rec.info.file_size = 99;
        let bytes = encode_all(vec![rec]).unwrap();
        let back = decode(&bytes);
        assert_eq!(back[0].info.file_size, 0);
    }

    /// In-memory source that tallies every byte handed out.
    struct CountingSource {
        data: Vec<u8>,
        served: AtomicU64,
    }

    impl ReadAt for CountingSource {
        fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
            let n = self.data.read_at(buf, offset)?;
            self.served.fetch_add(n as u64, Ordering::Relaxed);
            Ok(n)
        }

        fn size(&self) -> io::Result<u64> {
            Ok(self.data.len() as u64)
        }
    }

    #[test]
    fn reader_at_leaves_content_in_place_until_read() {
        let big = vec![0x5au8; 4 * 1024 * 1024];
        let bytes = encode_all(vec![
            Record::static_file("boot/initrd", big.clone(), 0o644),
            Record::static_file("boot/cmdline", "quiet", 0o644),
        ])
        .unwrap();
        let source = Arc::new(CountingSource {
            data: bytes,
            served: AtomicU64::new(0),
        });

        let records = read_all_records(&mut EofReader::new(ReaderAt::new(source.clone()))).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].info.file_size, big.len() as u64);
        // three headers plus their names
        assert!(source.served.load(Ordering::Relaxed) < 1024);

        let mut content = Vec::new();
        records[0].reader().read_to_end(&mut content).unwrap();
        assert_eq!(content, big);
        let mut cmdline = String::new();
        records[1].reader().read_to_string(&mut cmdline).unwrap();
        assert_eq!(cmdline, "quiet");
    }

    #[test]
    fn reader_at_matches_streaming_reader() {
        let bytes = encode_all(vec![
            Record::directory("etc", 0o755),
            Record::static_file("etc/hostname", "box\n", 0o644),
            Record::symlink("bin/sh", "busybox"),
            Record::char_dev("dev/null", 0o666, 1, 3),
        ])
        .unwrap();
        let streamed = decode(&bytes);
        let random = read_all_records(&mut EofReader::new(ReaderAt::new(content::bytes(bytes))))
            .unwrap();
        assert_eq!(streamed.len(), random.len());
        for (a, b) in streamed.iter().zip(&random) {
            assert!(a.equal(b).unwrap(), "mismatch for {}", a.name());
        }
    }

    #[test]
    fn reader_at_truncated_content_is_short() {
        let bytes = encode_all(vec![Record::static_file("f", "0123456789", 0o644)]).unwrap();
        let cut = bytes[..HEADER_LEN + 2 + 5].to_vec();
        let err = ReaderAt::new(content::bytes(cut)).read_record().unwrap_err();
        assert!(matches!(err, Error::ShortContent { want: 10, got: 5, .. }));
    }

    #[test]
    fn short_content_source_fails_write() {
        let mut rec = Record::static_file("f", "abc", 0o644);
        rec.info.file_size = 10;
        let err = Writer::new(Vec::new()).write_record(rec).unwrap_err();
        assert!(matches!(err, Error::ShortContent { want: 10, got: 3, .. }));
    }
}

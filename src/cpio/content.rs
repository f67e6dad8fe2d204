//! Random-access content sources for records.
//!
//! Record content is never required to be resident in memory. A [`ReadAt`]
//! source is read in bounded chunks by the writer and by digesting wrappers,
//! so a multi-hundred-megabyte initrd costs one buffer, not its size.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Chunk size used when streaming content.
pub(crate) const COPY_BUF_SIZE: usize = 64 * 1024;

/// A random-access byte source.
pub trait ReadAt: Send + Sync {
    /// Read up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns 0 at end of content.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Total length of the content in bytes.
    fn size(&self) -> io::Result<u64>;
}

/// Shared handle to a content source.
pub type Content = Arc<dyn ReadAt>;

impl ReadAt for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.as_slice().read_at(buf, offset)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.len() as u64)
    }
}

impl ReadAt for [u8] {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= self.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.len() as u64)
    }
}

impl ReadAt for File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        FileExt::read_at(self, buf, offset)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

/// Wrap owned bytes as a content source.
pub fn bytes(data: impl Into<Vec<u8>>) -> Content {
    Arc::new(data.into())
}

/// A file that is opened on first read.
///
/// The handle is dropped again once a read reaches `limit`, so walking a
/// large tree does not hold one descriptor per recorded file.
pub struct LazyFile {
    path: PathBuf,
    limit: u64,
    file: Mutex<Option<File>>,
}

impl LazyFile {
    /// Create a lazy source for `path`, exposing at most `limit` bytes.
    pub fn new(path: impl Into<PathBuf>, limit: u64) -> Self {
        Self {
            path: path.into(),
            limit,
            file: Mutex::new(None),
        }
    }

    /// Create a lazy source whose limit is the file's current length.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let limit = std::fs::metadata(&path)?.len();
        Ok(Self::new(path, limit))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a descriptor is currently held.
    pub fn is_open(&self) -> bool {
        self.file.lock().map(|f| f.is_some()).unwrap_or(false)
    }
}

impl ReadAt for LazyFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.limit {
            return Ok(0);
        }
        let want = buf.len().min((self.limit - offset) as usize);

        let mut guard = self
            .file
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "lazy file lock poisoned"))?;
        if guard.is_none() {
            *guard = Some(File::open(&self.path)?);
        }
        let n = match guard.as_ref() {
            Some(f) => FileExt::read_at(f, &mut buf[..want], offset)?,
            None => 0,
        };
        if n == 0 || offset + n as u64 >= self.limit {
            *guard = None;
        }
        Ok(n)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.limit)
    }
}

impl fmt::Debug for LazyFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyFile")
            .field("path", &self.path)
            .field("limit", &self.limit)
            .finish()
    }
}

/// A fixed window into a shared source.
///
/// Reads past `len` return 0 even when the underlying source continues.
#[derive(Clone)]
pub struct Section {
    source: Content,
    offset: u64,
    len: u64,
}

impl Section {
    pub fn new(source: Content, offset: u64, len: u64) -> Self {
        Self {
            source,
            offset,
            len,
        }
    }

    /// Offset of the window within the source.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl ReadAt for Section {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        let want = buf.len().min((self.len - offset) as usize);
        self.source.read_at(&mut buf[..want], self.offset + offset)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.len)
    }
}

impl fmt::Debug for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Section")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// Sequential reader over a window of a [`ReadAt`] source.
pub struct ContentReader<'a> {
    source: &'a dyn ReadAt,
    offset: u64,
    end: u64,
}

impl<'a> ContentReader<'a> {
    /// Read `len` bytes starting at offset 0.
    pub fn new(source: &'a dyn ReadAt, len: u64) -> Self {
        Self {
            source,
            offset: 0,
            end: len,
        }
    }
}

impl Read for ContentReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.offset >= self.end {
            return Ok(0);
        }
        let want = buf.len().min((self.end - self.offset) as usize);
        let n = self.source.read_at(&mut buf[..want], self.offset)?;
        self.offset += n as u64;
        Ok(n)
    }
}

/// Read all `len` bytes of a source into memory.
pub fn read_all(source: &dyn ReadAt, len: u64) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len.min(COPY_BUF_SIZE as u64 * 16) as usize);
    ContentReader::new(source, len).read_to_end(&mut out)?;
    Ok(out)
}

/// Compare two sources byte for byte over their first `len` bytes.
pub fn content_equal(a: &dyn ReadAt, b: &dyn ReadAt, len: u64) -> io::Result<bool> {
    let mut ra = ContentReader::new(a, len);
    let mut rb = ContentReader::new(b, len);
    let mut ba = vec![0u8; COPY_BUF_SIZE];
    let mut bb = vec![0u8; COPY_BUF_SIZE];
    loop {
        let na = read_full(&mut ra, &mut ba)?;
        let nb = read_full(&mut rb, &mut bb)?;
        if na != nb || ba[..na] != bb[..nb] {
            return Ok(false);
        }
        if na == 0 {
            return Ok(true);
        }
    }
}

/// Fill `buf` as far as possible, stopping early only at end of input.
pub(crate) fn read_full(r: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

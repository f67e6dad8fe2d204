//! Compressed EFI zboot images.
//!
//! A zboot image is a small PE stub whose DOS header carries a descriptor
//! of the compressed payload it wraps:
//!
//! ```text
//! offset  size  field
//!      0     4  magic        "MZ\0\0"
//!      4     4  type         "zimg"
//!      8     4  payload offset (LE)
//!     12     4  payload size   (LE)
//!     16     8  reserved
//!     24     4  compression  "zstd", NUL padded
//! ```

use tracing::debug;

use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 28;
pub const MAGIC: u32 = 0x5a4d;
pub const ZIMG_TYPE: [u8; 4] = *b"zimg";

/// The parsed zboot descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub kind: [u8; 4],
    pub offset: u32,
    pub size: u32,
    pub compression: [u8; 4],
}

fn le_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn array4(data: &[u8], at: usize) -> [u8; 4] {
    [data[at], data[at + 1], data[at + 2], data[at + 3]]
}

impl Header {
    /// Decode and validate the descriptor at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::InvalidImage {
                kind: "zboot",
                reason: format!("{} bytes is shorter than the header", data.len()),
            });
        }
        let hdr = Header {
            magic: le_u32(data, 0),
            kind: array4(data, 4),
            offset: le_u32(data, 8),
            size: le_u32(data, 12),
            compression: array4(data, 24),
        };
        if hdr.magic != MAGIC {
            return Err(Error::MagicMismatch(hdr.magic));
        }
        if hdr.kind != ZIMG_TYPE {
            return Err(Error::NotZImage(hdr.kind));
        }
        Ok(hdr)
    }

    /// Compression name without NUL padding.
    pub fn compression_name(&self) -> String {
        String::from_utf8_lossy(&self.compression)
            .trim_end_matches('\0')
            .to_string()
    }
}

/// Whether `data` starts with a zboot descriptor.
pub fn is_zimage(data: &[u8]) -> bool {
    Header::parse(data).is_ok()
}

/// Decompress the payload of a zboot image.
///
/// A truncated or corrupt payload surfaces the decompressor's error, which
/// for a cut-off stream is an `UnexpectedEof` I/O error.
pub fn extract(data: &[u8]) -> Result<Vec<u8>> {
    let hdr = Header::parse(data)?;
    let start = hdr.offset as usize;
    let end = start
        .checked_add(hdr.size as usize)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| Error::InvalidImage {
            kind: "zboot",
            reason: format!(
                "payload [{:#x}, +{:#x}) exceeds {} byte image",
                hdr.offset,
                hdr.size,
                data.len()
            ),
        })?;

    let compression = hdr.compression_name();
    debug!(offset = hdr.offset, size = hdr.size, %compression, "extracting zboot payload");
    match compression.as_str() {
        "zstd" => Ok(zstd::stream::decode_all(&data[start..end])?),
        _ => Err(Error::UnsupportedCompression(compression)),
    }
}

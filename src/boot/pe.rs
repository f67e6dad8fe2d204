//! PE/COFF images (EFI stubs, zboot kernels).
//!
//! Execution maps the PE headers and each section to physical memory at a
//! fixed base and jumps to the entry point. Packing is not supported.

use std::fmt;

use tracing::debug;

use super::kexec::{KexecLoader, Segment, KEXEC_ARCH_DEFAULT};
use super::{pez, OsImage};
use crate::cpio::content::read_all;
use crate::cpio::{Content, RecordWriter};
use crate::error::{Error, Result};

/// Physical address the image headers are loaded at.
pub const LOAD_BASE: u64 = 0x0100_0000;

const PE_SIGNATURE: &[u8; 4] = b"PE\0\0";
const PE32_MAGIC: u16 = 0x10b;
const PE32_PLUS_MAGIC: u16 = 0x20b;
const COFF_HEADER_LEN: usize = 20;
const SECTION_HEADER_LEN: usize = 40;

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidImage {
        kind: "PE",
        reason: reason.into(),
    }
}

fn read_u16(data: &[u8], at: usize) -> Result<u16> {
    data.get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| invalid(format!("truncated at {at:#x}")))
}

fn read_u32(data: &[u8], at: usize) -> Result<u32> {
    data.get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| invalid(format!("truncated at {at:#x}")))
}

/// One entry of the section table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub raw_size: u32,
    pub raw_offset: u32,
}

/// Where the image lands in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadPlan {
    pub entry: u64,
    pub segments: Vec<Segment>,
}

/// Parse `data` as PE and lay it out at [`LOAD_BASE`].
///
/// Segment 0 holds the headers, everything before the first section's
/// file data. Each section follows at `LOAD_BASE + VirtualAddress`.
pub fn plan(data: &[u8]) -> Result<LoadPlan> {
    if data.get(..2) != Some(b"MZ".as_slice()) {
        return Err(invalid("missing MZ header"));
    }
    let pe = read_u32(data, 0x3c)? as usize;
    if data.get(pe..pe + 4) != Some(PE_SIGNATURE.as_slice()) {
        return Err(invalid(format!("missing PE signature at {pe:#x}")));
    }

    let coff = pe + 4;
    let nsections = read_u16(data, coff + 2)? as usize;
    let opt_len = read_u16(data, coff + 16)? as usize;
    let opt = coff + COFF_HEADER_LEN;

    let entry_rva = match read_u16(data, opt)? {
        PE32_MAGIC | PE32_PLUS_MAGIC => read_u32(data, opt + 16)?,
        other => return Err(invalid(format!("unknown optional header magic {other:#x}"))),
    };

    let table = opt + opt_len;
    let sections = (0..nsections)
        .map(|i| {
            let at = table + i * SECTION_HEADER_LEN;
            Ok(Section {
                virtual_size: read_u32(data, at + 8)?,
                virtual_address: read_u32(data, at + 12)?,
                raw_size: read_u32(data, at + 16)?,
                raw_offset: read_u32(data, at + 20)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let first = sections.first().ok_or_else(|| invalid("no sections"))?;

    let header_len = first.raw_offset as usize;
    let header = data
        .get(..header_len)
        .ok_or_else(|| invalid("first section starts past end of file"))?;
    let mut segments = vec![Segment::new(header.to_vec(), LOAD_BASE, header_len as u64)];

    for s in &sections {
        let start = s.raw_offset as usize;
        let raw = data
            .get(start..start + s.raw_size as usize)
            .ok_or_else(|| invalid(format!("section data at {start:#x} exceeds file")))?;
        // kexec_load rejects a buffer larger than its memory range
        let len = raw.len().min(s.virtual_size as usize);
        segments.push(Segment::new(
            raw[..len].to_vec(),
            LOAD_BASE + u64::from(s.virtual_address),
            u64::from(s.virtual_size),
        ));
    }

    let entry = LOAD_BASE + u64::from(entry_rva);
    debug!(entry = format_args!("{entry:#x}"), segments = segments.len(), "planned PE load");
    Ok(LoadPlan { entry, segments })
}

/// A PE kernel, optionally zboot-compressed.
#[derive(Clone)]
pub struct PeImage {
    pub name: Option<String>,
    pub kernel: Content,
}

impl PeImage {
    pub fn new(kernel: Content) -> Self {
        Self { name: None, kernel }
    }

    /// Read the kernel, decompressing a zboot wrapper if present.
    pub fn image_bytes(&self) -> Result<Vec<u8>> {
        let data = read_all(self.kernel.as_ref(), self.kernel.size()?)?;
        if pez::is_zimage(&data) {
            return pez::extract(&data);
        }
        Ok(data)
    }
}

impl OsImage for PeImage {
    fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => match self.kernel.size() {
                Ok(n) => format!("PE(kernel={n} bytes)"),
                Err(_) => "PE".to_string(),
            },
        }
    }

    fn execution_info(&self) -> Result<()> {
        Err(Error::Unsupported("PE execution info".into()))
    }

    fn execute(&self, loader: &mut dyn KexecLoader) -> Result<()> {
        let plan = plan(&self.image_bytes()?)?;
        if !plan.segments.iter().any(|s| s.contains(plan.entry)) {
            return Err(invalid(format!(
                "entry point {:#x} is outside every segment",
                plan.entry
            )));
        }
        loader.load(plan.entry, &plan.segments, KEXEC_ARCH_DEFAULT)?;
        loader.reboot()
    }

    fn pack(&self, _w: &mut dyn RecordWriter) -> Result<()> {
        Err(Error::Unsupported("packing PE images".into()))
    }
}

impl fmt::Debug for PeImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeImage")
            .field("name", &self.name)
            .field("kernel_len", &self.kernel.size().ok())
            .finish()
    }
}

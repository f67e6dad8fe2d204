//! The kexec boundary.
//!
//! Loading a kernel and jumping into it is the job of an external loader.
//! Images describe what to load; a [`KexecLoader`] does it.

use std::fmt;
use std::fs::File;

use tracing::info;

use crate::error::Result;

/// `KEXEC_ARCH_DEFAULT`: load for the running architecture.
pub const KEXEC_ARCH_DEFAULT: u64 = 0;

/// One buffer to be placed at a physical address.
///
/// `size` is the size of the physical range and may exceed `buf.len()`;
/// the loader zero-fills the rest.
#[derive(Clone, PartialEq, Eq)]
pub struct Segment {
    pub buf: Vec<u8>,
    pub phys: u64,
    pub size: u64,
}

impl Segment {
    pub fn new(buf: Vec<u8>, phys: u64, size: u64) -> Self {
        Self { buf, phys, size }
    }

    /// Whether `addr` falls inside the physical range.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.phys && addr - self.phys < self.size
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Segment(phys: [{:#x}, {:#x}), buffer: {:#x} bytes)",
            self.phys,
            self.phys + self.size,
            self.buf.len()
        )
    }
}

/// Loads the next kernel and hands control to it.
pub trait KexecLoader {
    /// Load raw segments with an entry point (`kexec_load`).
    fn load(&mut self, entry: u64, segments: &[Segment], flags: u64) -> Result<()>;

    /// Load a Linux kernel, optional initramfs, and command line
    /// (`kexec_file_load`).
    fn file_load(&mut self, kernel: &File, initrd: Option<&File>, cmdline: &str) -> Result<()>;

    /// Jump into the loaded kernel. Returns only on failure.
    fn reboot(&mut self) -> Result<()>;
}

/// A loader that only logs what it was asked to do.
#[derive(Debug, Default)]
pub struct DryRunLoader;

impl KexecLoader for DryRunLoader {
    fn load(&mut self, entry: u64, segments: &[Segment], flags: u64) -> Result<()> {
        info!(entry = format_args!("{entry:#x}"), flags, "kexec_load (dry run)");
        for seg in segments {
            info!(segment = ?seg, "  segment");
        }
        Ok(())
    }

    fn file_load(&mut self, kernel: &File, initrd: Option<&File>, cmdline: &str) -> Result<()> {
        let kernel_len = kernel.metadata()?.len();
        let initrd_len = match initrd {
            Some(f) => Some(f.metadata()?.len()),
            None => None,
        };
        info!(kernel_len, ?initrd_len, cmdline, "kexec_file_load (dry run)");
        Ok(())
    }

    fn reboot(&mut self) -> Result<()> {
        info!("reboot into loaded kernel (dry run)");
        Ok(())
    }
}

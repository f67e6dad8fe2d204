//! Bootable OS images.
//!
//! Every image variant answers the same three questions: what would it
//! boot ([`OsImage::execution_info`]), boot it ([`OsImage::execute`]), and
//! serialize it into a package archive ([`OsImage::pack`]). [`BootImage`]
//! is the closed set of variants this crate knows about.
//!
//! # Example
//!
//! ```rust,ignore
//! use bootpack::boot::{kexec::DryRunLoader, BootImage, LinuxImage, OsImage};
//! use bootpack::cpio::content;
//!
//! let image = BootImage::Linux(LinuxImage::new(content::bytes(kernel), None, "console=ttyS0"));
//! image.execution_info()?;
//! image.execute(&mut DryRunLoader)?;
//! ```

pub mod kexec;
pub mod linux;
pub mod multiboot;
pub mod pe;
pub mod pez;

use crate::cpio::RecordWriter;
use crate::error::Result;

pub use kexec::{KexecLoader, Segment};
pub use linux::LinuxImage;
pub use multiboot::MultibootImage;
pub use pe::PeImage;

/// Contract shared by all bootable image variants.
pub trait OsImage {
    /// Short human-readable name for menus and logs.
    fn label(&self) -> String;

    /// Log a description of what [`OsImage::execute`] would boot.
    fn execution_info(&self) -> Result<()>;

    /// Load the image and hand control to it.
    ///
    /// On success the loader does not return control; an `Ok` here only
    /// comes back from loaders that do not actually reboot.
    fn execute(&self, loader: &mut dyn KexecLoader) -> Result<()>;

    /// Write the image into well-known archive paths.
    fn pack(&self, w: &mut dyn RecordWriter) -> Result<()>;
}

/// One of the supported image variants.
#[derive(Debug, Clone)]
pub enum BootImage {
    Linux(LinuxImage),
    Multiboot(MultibootImage),
    Pe(PeImage),
}

impl BootImage {
    fn inner(&self) -> &dyn OsImage {
        match self {
            BootImage::Linux(img) => img,
            BootImage::Multiboot(img) => img,
            BootImage::Pe(img) => img,
        }
    }

    pub fn as_linux(&self) -> Option<&LinuxImage> {
        match self {
            BootImage::Linux(img) => Some(img),
            _ => None,
        }
    }
}

impl OsImage for BootImage {
    fn label(&self) -> String {
        self.inner().label()
    }

    fn execution_info(&self) -> Result<()> {
        self.inner().execution_info()
    }

    fn execute(&self, loader: &mut dyn KexecLoader) -> Result<()> {
        self.inner().execute(loader)
    }

    fn pack(&self, w: &mut dyn RecordWriter) -> Result<()> {
        self.inner().pack(w)
    }
}

impl From<LinuxImage> for BootImage {
    fn from(img: LinuxImage) -> Self {
        BootImage::Linux(img)
    }
}

impl From<MultibootImage> for BootImage {
    fn from(img: MultibootImage) -> Self {
        BootImage::Multiboot(img)
    }
}

impl From<PeImage> for BootImage {
    fn from(img: PeImage) -> Self {
        BootImage::Pe(img)
    }
}

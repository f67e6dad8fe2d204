//! Linux kernel + initramfs images.

use std::fmt;
use std::fs::File;
use std::io::{self, Seek, SeekFrom};

use tracing::info;

use super::kexec::KexecLoader;
use super::OsImage;
use crate::cpio::content::ContentReader;
use crate::cpio::{Archive, Content, Info, Record, RecordWriter, S_IFREG};
use crate::error::{Error, Result};

/// Package type string for Linux images.
pub const PACKAGE_TYPE: &str = "linux";

pub const KERNEL_PATH: &str = "modules/kernel/content";
pub const PARAMS_PATH: &str = "modules/kernel/params";
pub const INITRD_PATH: &str = "modules/initrd/content";

/// Mode of every directory and file a Linux image packs.
const PACK_MODE: u64 = 0o700;

/// A Linux kernel with optional initramfs and command line.
#[derive(Clone, Default)]
pub struct LinuxImage {
    pub name: Option<String>,
    pub kernel: Option<Content>,
    pub initrd: Option<Content>,
    pub cmdline: String,
}

impl LinuxImage {
    pub fn new(kernel: Content, initrd: Option<Content>, cmdline: impl Into<String>) -> Self {
        Self {
            name: None,
            kernel: Some(kernel),
            initrd,
            cmdline: cmdline.into(),
        }
    }

    /// Rebuild an image from a package archive.
    ///
    /// The kernel is mandatory; params and initrd are optional.
    pub fn from_archive(archive: &Archive) -> Result<Self> {
        let kernel = archive.get(KERNEL_PATH).ok_or(Error::KernelMissing)?;
        let cmdline = match archive.get(PARAMS_PATH) {
            Some(rec) => rec.read_string()?,
            None => String::new(),
        };
        Ok(Self {
            name: None,
            kernel: Some(content_of(kernel)),
            initrd: archive.get(INITRD_PATH).map(content_of),
            cmdline,
        })
    }

    fn kernel(&self) -> Result<&Content> {
        self.kernel.as_ref().ok_or(Error::KernelMissing)
    }
}

fn content_of(rec: &Record) -> Content {
    rec.content
        .clone()
        .unwrap_or_else(|| crate::cpio::content::bytes(Vec::new()))
}

fn content_record(name: &str, content: &Content) -> Result<Record> {
    let info = Info {
        name: name.to_string(),
        mode: S_IFREG | PACK_MODE,
        file_size: content.size()?,
        ..Info::default()
    };
    Ok(Record::new(info, Some(content.clone())))
}

/// Copy `content` into an anonymous temporary file, rewound.
fn spill(content: &Content) -> Result<File> {
    let mut file = tempfile::tempfile()?;
    io::copy(&mut ContentReader::new(content.as_ref(), content.size()?), &mut file)?;
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}

fn size_label(content: &Content) -> String {
    match content.size() {
        Ok(n) => format!("{n} bytes"),
        Err(_) => "unreadable".to_string(),
    }
}

impl OsImage for LinuxImage {
    fn label(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        let mut parts = Vec::new();
        match &self.kernel {
            Some(k) => parts.push(format!("kernel={}", size_label(k))),
            None => parts.push("kernel=none".to_string()),
        }
        if let Some(i) = &self.initrd {
            parts.push(format!("initrd={}", size_label(i)));
        }
        format!("Linux({})", parts.join(" "))
    }

    fn execution_info(&self) -> Result<()> {
        let kernel = self.kernel.as_ref().map(size_label);
        let initrd = self.initrd.as_ref().map(size_label);
        info!(?kernel, ?initrd, cmdline = %self.cmdline, "linux image");
        Ok(())
    }

    fn execute(&self, loader: &mut dyn KexecLoader) -> Result<()> {
        let kernel = spill(self.kernel()?)?;
        let initrd = match &self.initrd {
            Some(i) => Some(spill(i)?),
            None => None,
        };
        loader.file_load(&kernel, initrd.as_ref(), &self.cmdline)?;
        loader.reboot()
    }

    fn pack(&self, w: &mut dyn RecordWriter) -> Result<()> {
        let kernel = self.kernel()?;
        w.write_record(Record::directory("modules", PACK_MODE))?;
        w.write_record(Record::directory("modules/kernel", PACK_MODE))?;
        w.write_record(content_record(KERNEL_PATH, kernel)?)?;
        w.write_record(Record::static_file(
            PARAMS_PATH,
            self.cmdline.as_bytes(),
            PACK_MODE,
        ))?;
        if let Some(initrd) = &self.initrd {
            w.write_record(Record::directory("modules/initrd", PACK_MODE))?;
            w.write_record(content_record(INITRD_PATH, initrd)?)?;
        }
        w.write_record(Record::static_file("package_type", PACKAGE_TYPE, PACK_MODE))
    }
}

impl fmt::Debug for LinuxImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinuxImage")
            .field("name", &self.name)
            .field("kernel", &self.kernel.as_ref().map(size_label))
            .field("initrd", &self.initrd.as_ref().map(size_label))
            .field("cmdline", &self.cmdline)
            .finish()
    }
}

//! Multiboot images.
//!
//! Loading multiboot kernels is not supported yet. The variant exists so
//! that packages and menus can name it, and every operation fails with
//! [`Error::Unimplemented`] rather than silently doing nothing.

use std::fmt;

use super::kexec::KexecLoader;
use super::OsImage;
use crate::cpio::{Content, RecordWriter};
use crate::error::{Error, Result};

/// A boot module passed to a multiboot kernel.
#[derive(Clone)]
pub struct Module {
    pub content: Content,
    pub cmdline: String,
}

impl Module {
    /// First word of the command line, if any.
    pub fn name(&self) -> &str {
        self.cmdline.split_whitespace().next().unwrap_or("")
    }
}

#[derive(Clone, Default)]
pub struct MultibootImage {
    pub name: Option<String>,
    pub kernel: Option<Content>,
    pub cmdline: String,
    pub modules: Vec<Module>,
}

impl OsImage for MultibootImage {
    fn label(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        let modules: Vec<&str> = self.modules.iter().map(Module::name).collect();
        format!("Multiboot(cmdline={:?} modules=[{}])", self.cmdline, modules.join(" "))
    }

    fn execution_info(&self) -> Result<()> {
        Err(Error::Unimplemented("multiboot execution info".into()))
    }

    fn execute(&self, _loader: &mut dyn KexecLoader) -> Result<()> {
        Err(Error::Unimplemented("multiboot execute".into()))
    }

    fn pack(&self, _w: &mut dyn RecordWriter) -> Result<()> {
        Err(Error::Unimplemented("multiboot pack".into()))
    }
}

impl fmt::Debug for MultibootImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultibootImage")
            .field("name", &self.name)
            .field("cmdline", &self.cmdline)
            .field("modules", &self.modules.len())
            .finish()
    }
}

//! Signed boot packages.
//!
//! A package is a cpio archive holding one OS image under well-known
//! paths, a `package_type` marker naming the image variant, optional
//! `metadata/<key>` files, and an optional trailing `signature`.
//!
//! # Example
//!
//! ```rust,ignore
//! use bootpack::package::{Package, PackageRegistry};
//!
//! let mut w = newc::Writer::new(File::create("boot.cpio")?);
//! package.pack(&mut w, Some(&signer))?;
//! write_trailer(&mut w)?;
//!
//! let mut loaded = Package::default();
//! let mut r = EofReader::new(newc::Reader::new(File::open("boot.cpio")?));
//! loaded.unpack(&mut r, Some(&verifier), &PackageRegistry::with_defaults())?;
//! ```

pub mod signing;

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, info};

use crate::boot::{linux, BootImage, LinuxImage, OsImage};
use crate::cpio::{Archive, Record, RecordReader, RecordWriter};
use crate::error::{Error, Result};

pub use signing::{
    MeasuringReader, PcrExtender, RsaSigner, RsaVerifier, Signer, SigningWriter, Verifier,
};

pub const PACKAGE_TYPE_PATH: &str = "package_type";
pub const METADATA_DIR: &str = "metadata";

const METADATA_MODE: u64 = 0o700;

/// Builds an image from a package archive.
pub type ImageConstructor = fn(&Archive) -> Result<BootImage>;

/// Package type → image constructor.
#[derive(Clone, Default)]
pub struct PackageRegistry {
    constructors: BTreeMap<String, ImageConstructor>,
}

impl fmt::Debug for PackageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.constructors.keys()).finish()
    }
}

fn linux_from_archive(archive: &Archive) -> Result<BootImage> {
    LinuxImage::from_archive(archive).map(BootImage::Linux)
}

impl PackageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every package type this crate can unpack.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(linux::PACKAGE_TYPE, linux_from_archive);
        registry
    }

    pub fn register(&mut self, package_type: &str, constructor: ImageConstructor) {
        self.constructors
            .insert(package_type.to_string(), constructor);
    }

    pub fn lookup(&self, package_type: &str) -> Result<ImageConstructor> {
        self.constructors
            .get(package_type)
            .copied()
            .ok_or_else(|| Error::UnknownPackageType(package_type.to_string()))
    }

    pub fn contains(&self, package_type: &str) -> bool {
        self.constructors.contains_key(package_type)
    }
}

/// An OS image with metadata.
#[derive(Debug, Clone, Default)]
pub struct Package {
    pub image: Option<BootImage>,
    pub metadata: BTreeMap<String, String>,
}

impl Package {
    pub fn new(image: impl Into<BootImage>) -> Self {
        Self {
            image: Some(image.into()),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Write the package records, signed if `signer` is given.
    ///
    /// The trailer is left to the caller. On failure `w` holds a partial
    /// package and must be discarded.
    pub fn pack(&self, w: &mut dyn RecordWriter, signer: Option<&dyn Signer>) -> Result<()> {
        let image = self.image.as_ref().ok_or(Error::KernelMissing)?;
        let mut sw = SigningWriter::new(w);

        if !self.metadata.is_empty() {
            sw.write_record(Record::directory(METADATA_DIR, METADATA_MODE))?;
            for (key, value) in &self.metadata {
                sw.write_record(Record::static_file(
                    &format!("{METADATA_DIR}/{key}"),
                    value.as_bytes(),
                    METADATA_MODE,
                ))?;
            }
        }

        image.pack(&mut sw)?;
        info!(image = %image.label(), signed = signer.is_some(), "packed boot package");
        if let Some(signer) = signer {
            sw.write_signature(signer)?;
        }
        Ok(())
    }

    /// Replace `self` with the package read from `r`.
    ///
    /// Any failure, including a signature mismatch when `verifier` is
    /// given, leaves `self` empty.
    pub fn unpack(
        &mut self,
        r: &mut dyn RecordReader,
        verifier: Option<&dyn Verifier>,
        registry: &PackageRegistry,
    ) -> Result<()> {
        *self = Package::default();

        let mut mr = MeasuringReader::new(r);
        let archive = Archive::read_from(&mut mr)?;
        if let Some(verifier) = verifier {
            mr.verify(verifier)?;
            debug!("package signature verified");
        }

        let mut metadata = BTreeMap::new();
        for rec in archive.files_under(METADATA_DIR) {
            if !rec.info.is_regular() {
                continue;
            }
            let key = &rec.name()[METADATA_DIR.len() + 1..];
            metadata.insert(key.to_string(), rec.read_string()?);
        }

        let package_type = archive
            .get(PACKAGE_TYPE_PATH)
            .ok_or(Error::PackageTypeMissing)?
            .read_string()?;
        let constructor = registry.lookup(package_type.trim())?;
        let image = constructor(&archive)?;

        info!(package_type = package_type.trim(), image = %image.label(), "unpacked boot package");
        self.image = Some(image);
        self.metadata = metadata;
        Ok(())
    }
}

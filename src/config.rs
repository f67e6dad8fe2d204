//! Package manifests.
//!
//! A manifest names the kernel, initramfs, and command line of a boot
//! package, plus optional metadata and a signing key:
//!
//! ```toml
//! [package]
//! type = "linux"
//! kernel = "vmlinuz"
//! initrd = "initramfs.cpio"
//! cmdline = "console=ttyS0"
//!
//! [metadata]
//! name = "rescue"
//!
//! [signing]
//! private_key = "key.pem"
//! ```
//!
//! Relative paths resolve against the manifest's directory.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::boot::{linux, LinuxImage};
use crate::cpio::{Content, LazyFile};
use crate::package::{Package, RsaSigner};

#[derive(Debug, Clone)]
pub struct PackageManifest {
    pub package_type: String,
    pub kernel: PathBuf,
    pub initrd: Option<PathBuf>,
    pub cmdline: String,
    pub metadata: BTreeMap<String, String>,
    pub private_key: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestToml {
    package: PackageToml,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    signing: Option<SigningToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PackageToml {
    #[serde(rename = "type")]
    package_type: String,
    kernel: String,
    initrd: Option<String>,
    cmdline: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SigningToml {
    private_key: String,
}

fn resolve(base: &Path, value: &str) -> PathBuf {
    let path = Path::new(value.trim());
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Read and validate the manifest at `path`.
pub fn load_manifest(path: &Path) -> Result<PackageManifest> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading package manifest '{}'", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    parse_manifest(&text, base)
        .with_context(|| format!("parsing package manifest '{}'", path.display()))
}

/// Parse manifest text, resolving relative paths against `base`.
pub fn parse_manifest(text: &str, base: &Path) -> Result<PackageManifest> {
    let parsed: ManifestToml = toml::from_str(text)?;

    let package_type = parsed.package.package_type.trim().to_ascii_lowercase();
    if package_type != linux::PACKAGE_TYPE {
        bail!(
            "unsupported package type '{}' (only '{}' can be packed)",
            package_type,
            linux::PACKAGE_TYPE
        );
    }
    if parsed.package.kernel.trim().is_empty() {
        bail!("package.kernel must not be empty");
    }
    if let Some(key) = parsed.metadata.keys().find(|k| k.is_empty() || k.starts_with('/')) {
        bail!("invalid metadata key '{}'", key);
    }

    Ok(PackageManifest {
        package_type,
        kernel: resolve(base, &parsed.package.kernel),
        initrd: parsed.package.initrd.as_deref().map(|p| resolve(base, p)),
        cmdline: parsed.package.cmdline.unwrap_or_default(),
        metadata: parsed.metadata,
        private_key: parsed.signing.map(|s| resolve(base, &s.private_key)),
    })
}

impl PackageManifest {
    /// A package whose kernel and initrd are read lazily from disk.
    pub fn build_package(&self) -> Result<Package> {
        let kernel = LazyFile::open(&self.kernel)
            .with_context(|| format!("opening kernel '{}'", self.kernel.display()))?;
        let initrd = match &self.initrd {
            Some(path) => Some(
                LazyFile::open(path)
                    .with_context(|| format!("opening initrd '{}'", path.display()))?,
            ),
            None => None,
        };

        let image = LinuxImage::new(
            Arc::new(kernel),
            initrd.map(|i| Arc::new(i) as Content),
            self.cmdline.clone(),
        );
        let mut package = Package::new(image);
        package.metadata = self.metadata.clone();
        Ok(package)
    }

    /// The signing key, if the manifest names one.
    pub fn signer(&self) -> Result<Option<RsaSigner>> {
        match &self.private_key {
            Some(path) => RsaSigner::load(path)
                .map(Some)
                .with_context(|| format!("loading signing key '{}'", path.display())),
            None => Ok(None),
        }
    }
}

//! Reproducible cpio archives and signed kexec boot packages.
//!
//! This crate covers the path from a directory tree or a kernel on disk to
//! a verified image handed to kexec:
//!
//! - **cpio** - Record model, newc codec, stream transforms, dedup,
//!   reproducibility normalization, tree recording, and extraction
//! - **boot** - Linux, Multiboot, and PE image variants behind one
//!   [`boot::OsImage`] contract, plus the compressed PE extractor
//! - **package** - The boot package container with SHA-256 signing and
//!   measurement
//! - **config** - TOML package manifests for the `bootpack` binary
//!
//! # Architecture
//!
//! ```text
//! Recorder ──► Record stream ──► DedupWriter ──► SigningWriter ──► newc::Writer
//!                                                                     │
//!                                                                 package.cpio
//!                                                                     │
//! UnixFiler ◄── Archive ◄── MeasuringReader ◄── EofReader ◄── newc::Reader
//!                  │
//!          PackageRegistry ──► BootImage ──► KexecLoader
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use bootpack::boot::LinuxImage;
//! use bootpack::cpio::{content::bytes, newc, write_trailer};
//! use bootpack::package::Package;
//!
//! let package = Package::new(LinuxImage::new(bytes(kernel), None, "console=ttyS0"));
//! let mut w = newc::Writer::new(File::create("boot.cpio")?);
//! package.pack(&mut w, None)?;
//! write_trailer(&mut w)?;
//! ```

pub mod boot;
pub mod config;
pub mod cpio;
pub mod error;
pub mod package;

pub use error::{Error, ErrorCategory, Result};

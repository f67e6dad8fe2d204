//! Error types for archive encoding and boot packaging.

use std::fmt;
use std::path::PathBuf;

/// Result type alias for archive and boot package operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while encoding, decoding, extracting, or booting
/// archives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Format Errors
    // =========================================================================
    /// No record format registered under the requested name.
    #[error("unknown archive format '{0}'")]
    UnknownFormat(String),

    /// A record header could not be decoded.
    #[error("malformed record header: {0}")]
    MalformedHeader(String),

    /// A record's content was shorter than its declared size.
    #[error("record '{name}': content ended after {got} of {want} bytes")]
    ShortContent { name: String, want: u64, got: u64 },

    /// A metadata value does not fit the fixed-width header field.
    #[error("record '{name}': {field} value {value:#x} does not fit the header")]
    FieldOverflow {
        name: String,
        field: &'static str,
        value: u64,
    },

    /// A boot image has an invalid binary layout.
    #[error("invalid {kind} image: {reason}")]
    InvalidImage { kind: &'static str, reason: String },

    /// Compressed image header magic is not "MZ".
    #[error("compressed image magic mismatch: got {0:#x}")]
    MagicMismatch(u32),

    /// Compressed image header type is not "zimg".
    #[error("not a compressed zimg image: type {0:?}")]
    NotZImage([u8; 4]),

    /// Compressed image uses a compression we cannot decode.
    #[error("unsupported image compression '{0}'")]
    UnsupportedCompression(String),

    // =========================================================================
    // Structural Errors
    // =========================================================================
    /// The image has no kernel.
    #[error("kernel image is empty, nothing to pack or execute")]
    KernelMissing,

    /// The package carries no `package_type` file.
    #[error("package has no package_type file")]
    PackageTypeMissing,

    /// The package type is not registered.
    #[error("unknown package type '{0}'")]
    UnknownPackageType(String),

    /// Attempt to write a record under a name reserved for signing.
    #[error("record name '{0}' is reserved")]
    ReservedName(String),

    /// A record with the same path was already written.
    #[error("'{0}' is already in the archive")]
    AlreadyExists(String),

    // =========================================================================
    // Unsupported Errors
    // =========================================================================
    /// The operation is intentionally not supported by this variant.
    #[error("{0} is not supported")]
    Unsupported(String),

    /// The operation is not implemented yet.
    #[error("{0} is not implemented")]
    Unimplemented(String),

    // =========================================================================
    // Integrity Errors
    // =========================================================================
    /// Verification was requested but the package has no signature.
    #[error("package has no signature")]
    SignatureMissing,

    /// The signature does not match the measured content.
    #[error("signature verification failed: {0}")]
    SignatureMismatch(String),

    /// A signing or verification key could not be loaded or used.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O error on a specific filesystem path.
    #[error("I/O error on '{}': {source}", path.display())]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Collected failures from a best-effort pass.
    #[error("{} operations failed: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<Error>),
}

/// Coarse classification of [`Error`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Unknown format names, malformed headers, length mismatches.
    Format,
    /// Missing mandatory files, reserved-name writes.
    Structural,
    /// Operations a variant deliberately does not provide.
    Unsupported,
    /// Signature and digest failures.
    Integrity,
    /// Propagated read/write/stat/mknod failures.
    Io,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Format => write!(f, "format"),
            ErrorCategory::Structural => write!(f, "structural"),
            ErrorCategory::Unsupported => write!(f, "unsupported"),
            ErrorCategory::Integrity => write!(f, "integrity"),
            ErrorCategory::Io => write!(f, "io"),
        }
    }
}

impl Error {
    /// Wrap an I/O error with the path it happened on.
    pub fn path(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Path {
            path: path.into(),
            source,
        }
    }

    /// Returns the taxonomy category of this error.
    ///
    /// An aggregate takes the category of its first failure.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::UnknownFormat(_)
            | Error::MalformedHeader(_)
            | Error::ShortContent { .. }
            | Error::FieldOverflow { .. }
            | Error::InvalidImage { .. }
            | Error::MagicMismatch(_)
            | Error::NotZImage(_)
            | Error::UnsupportedCompression(_) => ErrorCategory::Format,

            Error::KernelMissing
            | Error::PackageTypeMissing
            | Error::UnknownPackageType(_)
            | Error::ReservedName(_)
            | Error::AlreadyExists(_) => ErrorCategory::Structural,

            Error::Unsupported(_) | Error::Unimplemented(_) => ErrorCategory::Unsupported,

            Error::SignatureMissing | Error::SignatureMismatch(_) | Error::InvalidKey(_) => {
                ErrorCategory::Integrity
            }

            Error::Io(_) | Error::Path { .. } => ErrorCategory::Io,

            Error::Aggregate(errors) => errors
                .first()
                .map(Error::category)
                .unwrap_or(ErrorCategory::Io),
        }
    }

    /// Returns the underlying `io::ErrorKind`, if this is an I/O error.
    pub fn io_kind(&self) -> Option<std::io::ErrorKind> {
        match self {
            Error::Io(e) => Some(e.kind()),
            Error::Path { source, .. } => Some(source.kind()),
            _ => None,
        }
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn categories_follow_taxonomy() {
        assert_eq!(
            Error::UnknownFormat("odc".into()).category(),
            ErrorCategory::Format
        );
        assert_eq!(Error::KernelMissing.category(), ErrorCategory::Structural);
        assert_eq!(
            Error::Unimplemented("multiboot pack".into()).category(),
            ErrorCategory::Unsupported
        );
        assert_eq!(Error::SignatureMissing.category(), ErrorCategory::Integrity);
        assert_eq!(
            Error::from(io::Error::new(io::ErrorKind::Other, "boom")).category(),
            ErrorCategory::Io
        );
    }

    #[test]
    fn aggregate_reports_every_failure() {
        let err = Error::Aggregate(vec![
            Error::path("/a", io::Error::new(io::ErrorKind::PermissionDenied, "denied")),
            Error::ReservedName("signature".into()),
        ]);
        let msg = err.to_string();
        assert!(msg.starts_with("2 operations failed"));
        assert!(msg.contains("/a"));
        assert!(msg.contains("signature"));
        assert_eq!(err.category(), ErrorCategory::Io);
    }

    #[test]
    fn io_kind_sees_through_path_errors() {
        let err = Error::path("/x", io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.io_kind(), Some(io::ErrorKind::NotFound));
        assert_eq!(Error::KernelMissing.io_kind(), None);
    }
}

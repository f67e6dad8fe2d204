//! Signing and measurement of package archives.
//!
//! Both sides digest the same byte sequence: for every regular file, its
//! name followed by its content, in stream order, with no separators. The
//! writer signs the SHA-256 of that sequence into a final `signature`
//! record; the reader recomputes it and checks the signature, and can also
//! extend a TPM PCR with the SHA-1 of the same bytes.
//!
//! A writer or reader covers exactly one archive pass. Both are consumed
//! or borrowed for that pass and cannot be reset.

use std::fs;
use std::io::Read;
use std::path::Path;

use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::cpio::content::COPY_BUF_SIZE;
use crate::cpio::{make_reproducible, Record, RecordReader, RecordWriter};
use crate::error::{Error, Result};

pub const SIGNATURE: &str = "signature";
pub const SIGNATURE_ALGO: &str = "signature_algo";

const SIGNATURE_MODE: u64 = 0o700;

fn is_reserved(name: &str) -> bool {
    name == SIGNATURE || name == SIGNATURE_ALGO
}

/// Produces a signature over a SHA-256 digest.
pub trait Signer {
    fn sign(&self, digest: &[u8]) -> Result<Vec<u8>>;
}

/// Checks a signature over a SHA-256 digest.
pub trait Verifier {
    fn verify(&self, digest: &[u8], signature: &[u8]) -> Result<()>;
}

/// The TPM boundary: extend a PCR with a SHA-1 measurement.
pub trait PcrExtender {
    fn extend(&mut self, pcr: u32, digest: &[u8; 20]) -> Result<()>;
}

/// RSASSA-PKCS1-v1_5 over SHA-256.
#[derive(Debug, Clone)]
pub struct RsaSigner {
    key: RsaPrivateKey,
}

impl RsaSigner {
    pub fn new(key: RsaPrivateKey) -> Self {
        Self { key }
    }

    /// Parse a PKCS#8 PEM private key.
    pub fn from_pem(pem: &str) -> Result<Self> {
        RsaPrivateKey::from_pkcs8_pem(pem)
            .map(Self::new)
            .map_err(|e| Error::InvalidKey(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let pem = fs::read_to_string(path).map_err(|e| Error::path(path, e))?;
        Self::from_pem(&pem)
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.key.to_public_key()
    }
}

impl Signer for RsaSigner {
    fn sign(&self, digest: &[u8]) -> Result<Vec<u8>> {
        self.key
            .sign(Pkcs1v15Sign::new::<Sha256>(), digest)
            .map_err(|e| Error::InvalidKey(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct RsaVerifier {
    key: RsaPublicKey,
}

impl RsaVerifier {
    pub fn new(key: RsaPublicKey) -> Self {
        Self { key }
    }

    /// Parse a SubjectPublicKeyInfo PEM public key.
    pub fn from_pem(pem: &str) -> Result<Self> {
        RsaPublicKey::from_public_key_pem(pem)
            .map(Self::new)
            .map_err(|e| Error::InvalidKey(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let pem = fs::read_to_string(path).map_err(|e| Error::path(path, e))?;
        Self::from_pem(&pem)
    }
}

impl Verifier for RsaVerifier {
    fn verify(&self, digest: &[u8], signature: &[u8]) -> Result<()> {
        self.key
            .verify(Pkcs1v15Sign::new::<Sha256>(), digest, signature)
            .map_err(|e| Error::SignatureMismatch(e.to_string()))
    }
}

/// Feed `name || content` of a regular file into `update`.
fn digest_record(rec: &Record, mut update: impl FnMut(&[u8])) -> Result<()> {
    update(rec.info.name.as_bytes());
    let mut src = rec.reader();
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        update(&buf[..n]);
    }
}

/// Normalizes, digests, and forwards records; appends a signature last.
pub struct SigningWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: RecordWriter> SigningWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// SHA-256 of everything digested so far.
    pub fn digest(&self) -> [u8; 32] {
        self.hasher.clone().finalize().into()
    }

    /// Finish without signing.
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Sign the digest and write it as the `signature` record.
    ///
    /// Consumes the writer: nothing may follow the signature except the
    /// trailer, which remains the caller's job.
    pub fn write_signature(mut self, signer: &dyn Signer) -> Result<W> {
        let digest = self.digest();
        let signature = signer.sign(&digest)?;
        debug!(len = signature.len(), "writing package signature");
        self.inner
            .write_record(Record::static_file(SIGNATURE, signature, SIGNATURE_MODE))?;
        Ok(self.inner)
    }
}

impl<W: RecordWriter> RecordWriter for SigningWriter<W> {
    fn write_record(&mut self, rec: Record) -> Result<()> {
        let rec = make_reproducible(rec);
        if is_reserved(&rec.info.name) {
            return Err(Error::ReservedName(rec.info.name));
        }
        if rec.info.is_regular() {
            let hasher = &mut self.hasher;
            digest_record(&rec, |chunk| hasher.update(chunk))?;
        }
        self.inner.write_record(rec)
    }
}

/// Digests records as they are read and captures the signature.
///
/// The `signature` and `signature_algo` records are consumed here and never
/// returned. [`MeasuringReader::verify`] is only meaningful once the
/// stream has been drained.
pub struct MeasuringReader<R> {
    inner: R,
    sha256: Sha256,
    sha1: Sha1,
    signature: Option<Vec<u8>>,
    signature_algo: Option<Vec<u8>>,
}

impl<R: RecordReader> MeasuringReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            sha256: Sha256::new(),
            sha1: Sha1::new(),
            signature: None,
            signature_algo: None,
        }
    }

    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    pub fn signature_algo(&self) -> Option<&[u8]> {
        self.signature_algo.as_deref()
    }

    /// SHA-256 of everything measured so far.
    pub fn digest(&self) -> [u8; 32] {
        self.sha256.clone().finalize().into()
    }

    /// SHA-1 of everything measured so far, as extended into a PCR.
    pub fn sha1_digest(&self) -> [u8; 20] {
        self.sha1.clone().finalize().into()
    }

    /// Check the captured signature against the measured digest.
    pub fn verify(&self, verifier: &dyn Verifier) -> Result<()> {
        let signature = self.signature.as_deref().ok_or(Error::SignatureMissing)?;
        verifier.verify(&self.digest(), signature)
    }

    /// Extend `pcr` with the SHA-1 measurement.
    pub fn extend_tpm(&self, tpm: &mut dyn PcrExtender, pcr: u32) -> Result<()> {
        let digest = self.sha1_digest();
        debug!(pcr, "extending PCR with package measurement");
        tpm.extend(pcr, &digest)
    }
}

impl<R: RecordReader> RecordReader for MeasuringReader<R> {
    fn read_record(&mut self) -> Result<Option<Record>> {
        while let Some(rec) = self.inner.read_record()? {
            match rec.info.name.as_str() {
                SIGNATURE => self.signature = Some(rec.read_all()?),
                SIGNATURE_ALGO => self.signature_algo = Some(rec.read_all()?),
                _ => {
                    if rec.info.is_regular() {
                        let (sha256, sha1) = (&mut self.sha256, &mut self.sha1);
                        digest_record(&rec, |chunk| {
                            sha256.update(chunk);
                            sha1.update(chunk);
                        })?;
                    }
                    return Ok(Some(rec));
                }
            }
        }
        Ok(None)
    }
}

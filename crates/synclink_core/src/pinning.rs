//! Certificate pinning.
//!
//! A [`CertificateValidator`] loads the pinned certificate file configured
//! for a host. DER support is mandatory; PEM is an optional capability.
//! Every certificate must parse as X.509 before it is accepted. The loaded
//! [`PinnedCertificate`] keeps SHA-256 fingerprints and is handed to the
//! transport, which checks the peer chain against it during TLS.

use std::fmt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use x509_parser::parse_x509_certificate;

use crate::error::{SyncError, SyncResult};

/// Encoding of a certificate file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertificateFormat {
    /// Binary DER (`.cer`). Always supported.
    Der,
    /// Base64 PEM armor. Optional.
    Pem,
}

impl CertificateFormat {
    /// Guesses the format of a certificate file from its contents.
    ///
    /// PEM is recognized by its armor line. Anything else counts as DER only
    /// if it parses as a single X.509 certificate.
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        if is_pem(bytes) {
            Some(CertificateFormat::Pem)
        } else if parse_der(bytes).is_ok() {
            Some(CertificateFormat::Der)
        } else {
            None
        }
    }
}

impl fmt::Display for CertificateFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateFormat::Der => f.write_str("DER"),
            CertificateFormat::Pem => f.write_str("PEM"),
        }
    }
}

/// SHA-256 fingerprint of a DER certificate.
pub type Fingerprint = [u8; 32];

/// Computes the fingerprint of a DER certificate.
pub fn fingerprint(der: &[u8]) -> Fingerprint {
    Sha256::digest(der).into()
}

/// A loaded pinned certificate set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedCertificate {
    /// File the certificates were read from.
    pub path: PathBuf,
    /// Format of the file.
    pub format: CertificateFormat,
    /// Fingerprints of every certificate in the file.
    pub fingerprints: Vec<Fingerprint>,
    /// Subject names, in file order.
    pub subjects: Vec<String>,
}

impl PinnedCertificate {
    /// Returns true if any certificate of the peer chain is pinned.
    ///
    /// Pinning a CA certificate accepts every leaf the chain carries it for;
    /// signature verification itself stays with the TLS implementation.
    pub fn matches<'a, I>(&self, peer_chain: I) -> bool
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        peer_chain
            .into_iter()
            .any(|der| self.fingerprints.contains(&fingerprint(der)))
    }
}

/// Loads pinned certificate files.
pub trait CertificateValidator: Send + Sync {
    /// Returns true if this validator can read the given format.
    fn supports(&self, format: CertificateFormat) -> bool;

    /// Reads and parses a pinned certificate file.
    fn load_pinned(&self, path: &Path) -> SyncResult<PinnedCertificate> {
        let bytes = std::fs::read(path).map_err(|e| {
            SyncError::Configuration(format!(
                "cannot read pinned certificate {}: {}",
                path.display(),
                e
            ))
        })?;
        self.parse_pinned(path, &bytes)
    }

    /// Parses pinned certificate bytes read from `path`.
    fn parse_pinned(&self, path: &Path, bytes: &[u8]) -> SyncResult<PinnedCertificate> {
        let invalid =
            |reason: String| SyncError::Configuration(format!("{}: {}", path.display(), reason));

        let format = if is_pem(bytes) {
            CertificateFormat::Pem
        } else {
            CertificateFormat::Der
        };

        if !self.supports(format) {
            return Err(SyncError::Configuration(format!(
                "{} certificates are not supported on this platform ({})",
                format,
                path.display()
            )));
        }

        let certificates = match format {
            CertificateFormat::Der => vec![bytes.to_vec()],
            CertificateFormat::Pem => split_pem(bytes).map_err(invalid)?,
        };

        let mut fingerprints = Vec::with_capacity(certificates.len());
        let mut subjects = Vec::with_capacity(certificates.len());
        for der in &certificates {
            subjects.push(parse_der(der).map_err(invalid)?);
            fingerprints.push(fingerprint(der));
        }

        Ok(PinnedCertificate {
            path: path.to_path_buf(),
            format,
            fingerprints,
            subjects,
        })
    }
}

/// Validator accepting only DER files, the minimum every platform supports.
#[derive(Debug, Default, Clone, Copy)]
pub struct DerValidator;

impl CertificateValidator for DerValidator {
    fn supports(&self, format: CertificateFormat) -> bool {
        format == CertificateFormat::Der
    }
}

/// Validator accepting DER and PEM files.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtendedValidator;

impl CertificateValidator for ExtendedValidator {
    fn supports(&self, _format: CertificateFormat) -> bool {
        true
    }
}

fn is_pem(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .is_some_and(|start| bytes[start..].starts_with(b"-----BEGIN"))
}

/// Splits a PEM file into its DER certificate blocks.
fn split_pem(bytes: &[u8]) -> Result<Vec<Vec<u8>>, String> {
    let certificates = rustls_pemfile::certs(&mut &bytes[..])
        .map_err(|e| format!("failed to parse PEM certificates: {e}"))?;
    if certificates.is_empty() {
        return Err("no CERTIFICATE block found".into());
    }
    Ok(certificates)
}

/// Parses one DER certificate and returns its subject.
fn parse_der(der: &[u8]) -> Result<String, String> {
    let (rest, certificate) = parse_x509_certificate(der)
        .map_err(|e| format!("not a valid X.509 certificate: {e:?}"))?;
    if !rest.is_empty() {
        return Err(format!(
            "{} trailing bytes after the certificate",
            rest.len()
        ));
    }
    Ok(certificate.subject().to_string())
}

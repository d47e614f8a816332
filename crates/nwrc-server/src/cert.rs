//! Certificate material for TLS.
//!
//! PEM files are parsed with `rustls-pemfile`; development certificates are
//! generated with `rcgen`.

use std::{
    fs::File,
    io::{self, BufReader},
    path::{Path, PathBuf},
};

use rustls::{
    RootCertStore,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
};
use thiserror::Error;

/// Failures while loading or generating certificates.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// File could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        /// File being read
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// PEM file contained no certificate
    #[error("no certificate found in {0}")]
    NoCertificates(PathBuf),

    /// PEM file contained no private key
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    /// Certificate rejected by the trust store
    #[error("invalid certificate: {0}")]
    Invalid(String),

    /// Self-signed generation failed
    #[error("failed to generate certificate: {0}")]
    Generate(#[from] rcgen::Error),
}

/// A certificate chain with its private key.
#[derive(Debug)]
pub struct Identity {
    /// Leaf first
    pub certs: Vec<CertificateDer<'static>>,
    /// Key matching the leaf
    pub key: PrivateKeyDer<'static>,
}

fn open(path: &Path) -> Result<BufReader<File>, CertificateError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| CertificateError::Io { path: path.to_path_buf(), source })
}

/// Read every certificate in a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertificateError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<io::Result<Vec<_>>>()
        .map_err(|source| CertificateError::Io { path: path.to_path_buf(), source })?;

    if certs.is_empty() {
        return Err(CertificateError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

/// Read the first private key in a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, CertificateError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| CertificateError::Io { path: path.to_path_buf(), source })?
        .ok_or_else(|| CertificateError::NoPrivateKey(path.to_path_buf()))
}

/// Load a certificate chain and key from two PEM files.
pub fn load_identity(cert: &Path, key: &Path) -> Result<Identity, CertificateError> {
    Ok(Identity { certs: load_certs(cert)?, key: load_private_key(key)? })
}

/// Trust store holding exactly `certs`.
pub fn root_store(certs: &[CertificateDer<'static>]) -> Result<RootCertStore, CertificateError> {
    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots.add(cert.clone()).map_err(|e| CertificateError::Invalid(e.to_string()))?;
    }
    Ok(roots)
}

/// Generate a self-signed certificate valid for `names`.
pub fn self_signed(names: &[String]) -> Result<Identity, CertificateError> {
    let certified = rcgen::generate_simple_self_signed(names.to_vec())?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
    Ok(Identity { certs: vec![certified.cert.der().clone()], key })
}

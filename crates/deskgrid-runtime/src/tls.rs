//! mTLS material for daemons that require client certificates.
//!
//! Three PEM files are needed: the daemon's CA, and the client certificate
//! and private key presented to the daemon. They come either from a
//! `cert_dir` (`ca.pem`, `cert.pem`, `key.pem`) or from explicit paths.

use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use tracing::debug;

use deskgrid_state::TlsFiles;

use crate::error::{RuntimeError, RuntimeResult};

/// Validated PEM material for one server.
#[derive(Clone)]
pub struct TlsBundle {
    ca_path: PathBuf,
    cert_path: PathBuf,
    ca_pem: Vec<u8>,
    identity_pem: Vec<u8>,
}

impl std::fmt::Debug for TlsBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsBundle")
            .field("ca_path", &self.ca_path)
            .field("cert_path", &self.cert_path)
            .finish_non_exhaustive()
    }
}

impl TlsBundle {
    /// Resolve `files` and load them.
    pub fn from_files(files: &TlsFiles) -> RuntimeResult<Self> {
        Self::load(&files.ca_path(), &files.cert_path(), &files.key_path())
    }

    /// Read and validate the CA, client certificate and client key.
    pub fn load(ca_path: &Path, cert_path: &Path, key_path: &Path) -> RuntimeResult<Self> {
        let ca_pem = read_pem(ca_path)?;
        let cert_pem = read_pem(cert_path)?;
        let key_pem = read_pem(key_path)?;

        let ca_count = count_certs(&ca_pem, ca_path)?;
        count_certs(&cert_pem, cert_path)?;

        let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_slice()))
            .map_err(|e| invalid(key_path, e))?;
        if key.is_none() {
            return Err(invalid(key_path, "no private key found"));
        }

        let mut identity_pem = cert_pem;
        if !identity_pem.ends_with(b"\n") {
            identity_pem.push(b'\n');
        }
        identity_pem.extend_from_slice(&key_pem);

        debug!(ca = %ca_path.display(), cert = %cert_path.display(), ca_count, "loaded mTLS bundle");
        Ok(Self {
            ca_path: ca_path.to_path_buf(),
            cert_path: cert_path.to_path_buf(),
            ca_pem,
            identity_pem,
        })
    }

    pub fn root_certificate(&self) -> RuntimeResult<reqwest::Certificate> {
        reqwest::Certificate::from_pem(&self.ca_pem).map_err(|e| invalid(&self.ca_path, e))
    }

    /// Client certificate chain followed by its private key.
    pub fn identity(&self) -> RuntimeResult<reqwest::Identity> {
        reqwest::Identity::from_pem(&self.identity_pem).map_err(|e| invalid(&self.cert_path, e))
    }
}

fn read_pem(path: &Path) -> RuntimeResult<Vec<u8>> {
    fs::read(path).map_err(|e| {
        RuntimeError::Configuration(format!("cannot read {}: {e}", path.display()))
    })
}

fn count_certs(pem: &[u8], path: &Path) -> RuntimeResult<usize> {
    let mut count = 0;
    for cert in rustls_pemfile::certs(&mut BufReader::new(pem)) {
        cert.map_err(|e| invalid(path, e))?;
        count += 1;
    }
    if count == 0 {
        return Err(invalid(path, "no certificates found"));
    }
    Ok(count)
}

fn invalid(path: &Path, cause: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::Configuration(format!("invalid {}: {cause}", path.display()))
}

#[cfg(test)]
pub(crate) mod test_certs {
    use std::path::Path;

    use deskgrid_state::{CA_FILE, CERT_FILE, KEY_FILE};
    use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};

    /// Write a CA plus a client certificate signed by it into `dir`.
    pub fn write_bundle(dir: &Path) {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::default();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "deskgrid");
        dn.push(DnType::CommonName, "deskgrid test CA");
        ca_params.distinguished_name = dn;
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let client_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["orchestrator.deskgrid.local".to_string()])
            .unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "deskgrid orchestrator");
        params.distinguished_name = dn;
        let client_cert = params.signed_by(&client_key, &ca_cert, &ca_key).unwrap();

        std::fs::write(dir.join(CA_FILE), ca_cert.pem()).unwrap();
        std::fs::write(dir.join(CERT_FILE), client_cert.pem()).unwrap();
        std::fs::write(dir.join(KEY_FILE), client_key.serialize_pem()).unwrap();
    }
}

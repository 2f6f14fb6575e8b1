//! Local TLS identity: a self-signed certificate and private key.
//!
//! Both are persisted as DER under the per-user configuration directory and
//! regenerated when absent or unreadable; losing the identity only resets
//! what peers have pinned, so regeneration is never fatal.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};
use thiserror::Error;

const CERT_FILE: &str = "local_cert.der";
const KEY_FILE: &str = "local_key.der";

/// Errors while loading or generating the local identity.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Filesystem failure under the certs directory
    #[error("identity I/O error: {0}")]
    Io(#[from] io::Error),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),
}

/// SHA-256 fingerprint of a certificate's DER encoding, lowercase hex.
#[must_use]
pub fn fingerprint_hex(cert_der: &[u8]) -> String {
    hex::encode(Sha256::digest(cert_der))
}

/// The local device's TLS credential.
pub struct DeviceIdentity {
    cert: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
    fingerprint: String,
}

impl DeviceIdentity {
    /// Load the identity from `certs_dir`, generating and persisting a fresh
    /// self-signed credential if either file is missing or unreadable.
    ///
    /// # Errors
    ///
    /// Returns an error only if generation or persistence fails; a corrupt
    /// existing identity is replaced, not reported.
    pub fn load_or_generate(certs_dir: &Path) -> Result<Self, IdentityError> {
        fs::create_dir_all(certs_dir)?;
        let cert_path = certs_dir.join(CERT_FILE);
        let key_path = certs_dir.join(KEY_FILE);

        if let Some(identity) = Self::load(&cert_path, &key_path) {
            tracing::debug!("loaded local identity {}", identity.fingerprint);
            return Ok(identity);
        }

        tracing::info!("generating new local identity in {}", certs_dir.display());
        let generated = rcgen::generate_simple_self_signed(vec!["airlift".to_string()])?;
        let cert_der = generated.cert.der().as_ref().to_vec();
        let key_der = generated.key_pair.serialize_der();

        fs::write(&cert_path, &cert_der)?;
        fs::write(&key_path, &key_der)?;

        let fingerprint = fingerprint_hex(&cert_der);
        Ok(Self {
            cert: CertificateDer::from(cert_der),
            key: PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_der)),
            fingerprint,
        })
    }

    fn load(cert_path: &PathBuf, key_path: &PathBuf) -> Option<Self> {
        let cert_der = fs::read(cert_path).ok()?;
        let key_der = fs::read(key_path).ok()?;
        if cert_der.is_empty() || key_der.is_empty() {
            tracing::warn!("empty identity files, regenerating");
            return None;
        }
        let fingerprint = fingerprint_hex(&cert_der);
        Some(Self {
            cert: CertificateDer::from(cert_der),
            key: PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_der)),
            fingerprint,
        })
    }

    /// The certificate in DER form.
    #[must_use]
    pub fn certificate(&self) -> CertificateDer<'static> {
        self.cert.clone()
    }

    /// The private key in DER form.
    #[must_use]
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }

    /// Fingerprint of the local certificate.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn generates_then_reloads_same_identity() {
        let tmp = TempDir::new().unwrap();
        let first = DeviceIdentity::load_or_generate(tmp.path()).unwrap();
        let second = DeviceIdentity::load_or_generate(tmp.path()).unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(first.certificate(), second.certificate());
    }

    #[test]
    fn corrupt_identity_is_regenerated() {
        let tmp = TempDir::new().unwrap();
        let first = DeviceIdentity::load_or_generate(tmp.path()).unwrap();

        fs::write(tmp.path().join(KEY_FILE), b"").unwrap();
        let second = DeviceIdentity::load_or_generate(tmp.path()).unwrap();
        assert_ne!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let fp = fingerprint_hex(b"anything");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

//! TLS configuration for transfer connections.
//!
//! Both ends present self-signed identity certificates and neither validates
//! the other at the transport layer; the trust decision belongs to the
//! application-layer trust store, which compares pinned fingerprints after
//! the handshake. The server requests a client certificate so the receiving
//! side can fingerprint the peer too.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};

use airlift_trust::DeviceIdentity;

use crate::error::TransferError;

fn supported_schemes() -> Vec<SignatureScheme> {
    ring::default_provider()
        .signature_verification_algorithms
        .supported_schemes()
}

/// Accepts any server certificate; pin comparison happens after the
/// handshake.
#[derive(Debug)]
struct TofuServerVerifier;

impl ServerCertVerifier for TofuServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        supported_schemes()
    }
}

/// Requires a client certificate but accepts any; the receiver fingerprints
/// it against the trust store.
#[derive(Debug)]
struct TofuClientVerifier {
    roots: Vec<DistinguishedName>,
}

impl ClientCertVerifier for TofuClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &self.roots
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        supported_schemes()
    }
}

/// Server-side TLS configuration presenting the local identity.
///
/// # Errors
///
/// Returns an error if the identity key is rejected.
pub fn server_config(identity: &DeviceIdentity) -> Result<ServerConfig, TransferError> {
    ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(TofuClientVerifier { roots: Vec::new() }))
        .with_single_cert(vec![identity.certificate()], identity.private_key())
        .map_err(|e| TransferError::Connection(format!("TLS server config: {e}")))
}

/// Client-side TLS configuration presenting the local identity.
///
/// # Errors
///
/// Returns an error if the identity key is rejected.
pub fn client_config(identity: &DeviceIdentity) -> Result<ClientConfig, TransferError> {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(TofuServerVerifier))
        .with_client_auth_cert(vec![identity.certificate()], identity.private_key())
        .map_err(|e| TransferError::Connection(format!("TLS client config: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn configs_build_from_generated_identity() {
        let tmp = TempDir::new().unwrap();
        let identity = DeviceIdentity::load_or_generate(tmp.path()).unwrap();

        assert!(server_config(&identity).is_ok());
        assert!(client_config(&identity).is_ok());
    }
}

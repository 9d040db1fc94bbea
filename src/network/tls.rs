//! TLS configuration for the audio data channel
//!
//! The receiver presents a fresh self-signed certificate on every start and
//! the sender accepts any certificate: the channel is encrypted against
//! passive listeners on the LAN, not authenticated.

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, ServerConfig};
use std::sync::Arc;

use crate::error::NetworkError;

/// Subject names placed in the generated certificate
const CERT_SUBJECTS: [&str; 2] = ["localhost", "lan-audio-relay.local"];

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_err(context: &str, e: impl std::fmt::Display) -> NetworkError {
    NetworkError::Tls(format!("{context}: {e}"))
}

/// Build a server config around a newly generated self-signed certificate
pub fn self_signed_server_config() -> Result<Arc<ServerConfig>, NetworkError> {
    let subjects: Vec<String> = CERT_SUBJECTS.iter().map(|s| s.to_string()).collect();
    let certified = rcgen::generate_simple_self_signed(subjects)
        .map_err(|e| tls_err("failed to generate self-signed certificate", e))?;

    let cert_der = CertificateDer::from(certified.cert.der().to_vec());
    let key_der =
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_err("unsupported protocol versions", e))?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .map_err(|e| tls_err("failed to build server config", e))?;

    Ok(Arc::new(config))
}

/// Client config that accepts whatever certificate the receiver presents
pub fn insecure_client_config() -> Result<Arc<ClientConfig>, NetworkError> {
    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_err("unsupported protocol versions", e))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider())))
        .with_no_client_auth();

    Ok(Arc::new(config))
}

#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_builds_with_fresh_certificate() {
        assert!(self_signed_server_config().is_ok());
    }

    #[test]
    fn test_insecure_client_config_builds() {
        assert!(insecure_client_config().is_ok());
    }
}

//! TLS setup for the signaling connection

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::Connector;
use tracing::{info, warn};

use super::error::TransportError;

/// TLS options for `wss://` signaling servers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Skip server certificate verification.
    ///
    /// Matches the deployed signaling server, which presents a certificate the
    /// robots cannot verify. Not recommended.
    #[serde(default)]
    pub insecure: bool,

    /// Trust only this PEM certificate (pinning) instead of the platform roots
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
}

/// Build the connector for a `wss://` connection.
///
/// `None` lets tokio-tungstenite verify against the platform roots.
pub(crate) fn connector(options: &TlsOptions) -> Result<Option<Connector>, TransportError> {
    if options.insecure {
        warn!("TLS certificate verification is DISABLED for the signaling connection");
        let provider = crypto_provider();
        let config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification(provider)))
            .with_no_client_auth();
        return Ok(Some(Connector::Rustls(Arc::new(config))));
    }

    if let Some(path) = &options.ca_cert {
        let roots = load_pinned_roots(path)?;
        let config = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        return Ok(Some(Connector::Rustls(Arc::new(config))));
    }

    Ok(None)
}

fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Load a PEM bundle into a root store
fn load_pinned_roots(path: &PathBuf) -> Result<RootCertStore, TransportError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| TransportError::Tls(format!("{}: {}", path.display(), e)))?;
    }

    if roots.is_empty() {
        return Err(TransportError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    info!("Pinned signaling server certificate from {}", path.display());
    Ok(roots)
}

/// Accepts any server certificate but still checks handshake signatures
#[derive(Debug)]
struct NoCertificateVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoCertificateVerification {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_use_platform_roots() {
        let connector = connector(&TlsOptions::default()).unwrap();
        assert!(connector.is_none());
    }

    #[test]
    fn test_missing_ca_cert_is_error() {
        let options = TlsOptions {
            insecure: false,
            ca_cert: Some(PathBuf::from("/nonexistent/robolink-ca.pem")),
        };
        assert!(matches!(connector(&options), Err(TransportError::Io(_))));
    }

    #[test]
    fn test_empty_ca_bundle_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        std::fs::write(&path, "").unwrap();

        let options = TlsOptions {
            insecure: false,
            ca_cert: Some(path),
        };
        assert!(matches!(connector(&options), Err(TransportError::Tls(_))));
    }
}

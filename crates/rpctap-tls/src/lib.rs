use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use thiserror::Error;

mod ca;
mod detect;
mod keylog;

pub use ca::{CaStore, CaStoreConfig, LeafCredential};
pub use detect::{client_hello_record_len, extract_sni, is_tls_client_hello, MAX_CLIENT_HELLO_PEEK};
pub use keylog::KeyLogSink;

pub const ALPN_HTTP_11: &[u8] = b"http/1.1";

#[derive(Debug, Error)]
pub enum CaError {
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(#[from] rcgen::Error),
    #[error("TLS config build failed: {0}")]
    ConfigBuild(#[from] rustls::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid certificate authority material: {0}")]
    InvalidMaterial(String),
    #[error("certificate store lock poisoned")]
    LockPoisoned,
}

/// Client config for the upstream leg of an interception. Verification of the
/// real server certificate is intentionally skipped and ALPN is pinned to
/// HTTP/1.1 so request/response pairing stays linear on the wire.
pub fn build_upstream_client_config(key_log: Arc<KeyLogSink>) -> Arc<ClientConfig> {
    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_HTTP_11.to_vec()];
    config.key_log = key_log;
    Arc::new(config)
}

/// Server config for the client-facing leg, presenting a minted leaf. ALPN is
/// pinned to HTTP/1.1; any client attempting h2 falls back during negotiation.
pub fn build_leaf_server_config(
    leaf: &LeafCredential,
    key_log: Arc<KeyLogSink>,
) -> Result<Arc<ServerConfig>, CaError> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(leaf.chain.clone(), leaf.key.clone_key())?;
    config.alpn_protocols = vec![ALPN_HTTP_11.to_vec()];
    config.key_log = key_log;
    Ok(Arc::new(config))
}

#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
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
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}

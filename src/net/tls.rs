//! TLS configuration and certificate loading.
//!
//! # Responsibilities
//! - Load PEM certificate chains and private keys
//! - Present per-SNI certificates to intercepted clients
//! - Build the permissive client profiles used for outbound dials
//!
//! # Design Decisions
//! - Certificate generation is external; only `CertificateSource` is consumed
//! - Outbound connections never verify the server certificate
//! - `alt_tls` selects a TLS 1.2-only profile

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use thiserror::Error;

/// ALPN identifier for HTTP/2.
pub const ALPN_H2: &[u8] = b"h2";
/// ALPN identifier for HTTP/1.1.
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Error type for TLS setup.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("No certificates found in {0}")]
    NoCertificates(String),
    #[error("No private key found in {0}")]
    NoPrivateKey(String),
    #[error("TLS configuration error: {0}")]
    Rustls(#[from] rustls::Error),
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Load a certificate chain and private key into a signing-ready key.
pub fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<Arc<CertifiedKey>, TlsError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    certified_key(certs, key)
}

/// Build a [`CertifiedKey`] from already-parsed DER material.
pub fn certified_key(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<CertifiedKey>, TlsError> {
    let signing_key = provider().key_provider.load_private_key(key)?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let display = path.display().to_string();
    let file = File::open(path).map_err(|source| TlsError::Io {
        path: display.clone(),
        source,
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: display.clone(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(display));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let display = path.display().to_string();
    let file = File::open(path).map_err(|source| TlsError::Io {
        path: display.clone(),
        source,
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|source| TlsError::Io {
            path: display.clone(),
            source,
        })?
        .ok_or(TlsError::NoPrivateKey(display))
}

/// Supplies the certificate presented to an intercepted client.
///
/// `server_name` is the SNI the client sent, if any.
pub trait CertificateSource: Send + Sync + fmt::Debug {
    fn certificate_for(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>>;
}

/// One certificate for every host.
#[derive(Debug, Clone)]
pub struct StaticCertificate {
    key: Arc<CertifiedKey>,
}

impl StaticCertificate {
    pub fn new(key: Arc<CertifiedKey>) -> Self {
        Self { key }
    }

    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        Ok(Self::new(load_certified_key(cert_path, key_path)?))
    }
}

impl CertificateSource for StaticCertificate {
    fn certificate_for(&self, _server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.key))
    }
}

type Generator = dyn Fn(&str) -> Option<Arc<CertifiedKey>> + Send + Sync;

/// Per-SNI certificates from an external generator, memoized per host name.
///
/// Clients without SNI get the fallback certificate.
pub struct PerHostCertificates {
    generate: Box<Generator>,
    issued: DashMap<String, Arc<CertifiedKey>>,
    fallback: Option<Arc<CertifiedKey>>,
}

impl PerHostCertificates {
    pub fn new<F>(generate: F, fallback: Option<Arc<CertifiedKey>>) -> Self
    where
        F: Fn(&str) -> Option<Arc<CertifiedKey>> + Send + Sync + 'static,
    {
        Self {
            generate: Box::new(generate),
            issued: DashMap::new(),
            fallback,
        }
    }

    pub fn issued_count(&self) -> usize {
        self.issued.len()
    }
}

impl fmt::Debug for PerHostCertificates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerHostCertificates")
            .field("issued", &self.issued.len())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl CertificateSource for PerHostCertificates {
    fn certificate_for(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let Some(name) = server_name else {
            return self.fallback.clone();
        };
        let name = name.to_ascii_lowercase();
        if let Some(key) = self.issued.get(&name) {
            return Some(Arc::clone(key.value()));
        }
        match (self.generate)(&name) {
            Some(key) => {
                self.issued.insert(name, Arc::clone(&key));
                Some(key)
            }
            None => self.fallback.clone(),
        }
    }
}

/// Adapts a [`CertificateSource`] to rustls' SNI callback.
#[derive(Debug)]
struct SniResolver {
    source: Arc<dyn CertificateSource>,
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name();
        let key = self.source.certificate_for(name);
        if key.is_none() {
            tracing::debug!(sni = ?name, "No certificate available for client");
        }
        key
    }
}

/// Server-side configuration for terminating intercepted TLS.
pub fn server_config(source: Arc<dyn CertificateSource>) -> Result<Arc<ServerConfig>, TlsError> {
    let mut config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniResolver { source }));
    config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
    Ok(Arc::new(config))
}

/// Accepts any server certificate.
#[derive(Debug)]
struct NoVerifier {
    schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for NoVerifier {
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
        self.schemes.clone()
    }
}

/// Outbound client profiles, built once and shared.
#[derive(Debug, Clone)]
pub struct ClientProfiles {
    http1: Arc<ClientConfig>,
    h2: Arc<ClientConfig>,
    alt_http1: Arc<ClientConfig>,
    alt_h2: Arc<ClientConfig>,
}

impl ClientProfiles {
    pub fn new() -> Result<Self, TlsError> {
        Ok(Self {
            http1: client_config(false, &[ALPN_HTTP11])?,
            h2: client_config(false, &[ALPN_H2, ALPN_HTTP11])?,
            alt_http1: client_config(true, &[ALPN_HTTP11])?,
            alt_h2: client_config(true, &[ALPN_H2, ALPN_HTTP11])?,
        })
    }

    /// Pick the profile for a dial.
    pub fn select(&self, alt_tls: bool, offer_h2: bool) -> Arc<ClientConfig> {
        let config = match (alt_tls, offer_h2) {
            (false, false) => &self.http1,
            (false, true) => &self.h2,
            (true, false) => &self.alt_http1,
            (true, true) => &self.alt_h2,
        };
        Arc::clone(config)
    }
}

fn client_config(alt_tls: bool, alpn: &[&[u8]]) -> Result<Arc<ClientConfig>, TlsError> {
    let provider = provider();
    let schemes = provider
        .signature_verification_algorithms
        .supported_schemes();
    let builder = ClientConfig::builder_with_provider(provider);
    let builder = if alt_tls {
        builder.with_protocol_versions(&[&rustls::version::TLS12])?
    } else {
        builder.with_safe_default_protocol_versions()?
    };
    let mut config = builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier { schemes }))
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_offer_expected_alpn() {
        let profiles = ClientProfiles::new().unwrap();
        assert_eq!(profiles.select(false, false).alpn_protocols, vec![b"http/1.1".to_vec()]);
        assert_eq!(
            profiles.select(true, true).alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn missing_pem_file_is_an_io_error() {
        let result = load_certified_key(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"));
        assert!(matches!(result, Err(TlsError::Io { .. })));
    }

    #[test]
    fn per_host_falls_back_without_sni() {
        let source = PerHostCertificates::new(|_| None, None);
        assert!(source.certificate_for(None).is_none());
        assert!(source.certificate_for(Some("example.com")).is_none());
        assert_eq!(source.issued_count(), 0);
    }
}

//! TLS configuration plumbing. Relays terminate and initiate TLS with
//! rustls; private-key operations are delegated to the CA process via
//! the signing key installed by `ca::RemoteKey`.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::WebPkiSupportedAlgorithms,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    server::{ClientHello, ResolvesServerCert},
    sign::{CertifiedKey, SigningKey},
    ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
};

use crate::config::KeyAlgo;

pub fn load_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::io::Result<_>>()
        .context("bad certificate PEM")?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates in PEM"));
    }
    Ok(certs)
}

pub fn load_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])
        .context("bad private key PEM")?
        .ok_or_else(|| anyhow!("no private key in PEM"))
}

/// Signature schemes a relay may offer for a key it cannot read. The CA
/// side makes the final choice against the real key.
pub fn schemes_for(algo: KeyAlgo) -> &'static [SignatureScheme] {
    match algo {
        KeyAlgo::Rsa => &[
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
        ],
        KeyAlgo::Ecdsa => &[
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP256_SHA256,
        ],
        KeyAlgo::Ed25519 => &[SignatureScheme::ED25519],
    }
}

#[derive(Debug)]
struct StaticResolver {
    key: Arc<CertifiedKey>,
}

impl ResolvesServerCert for StaticResolver {
    fn resolve(&self, _hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.key.clone())
    }
}

/// Server-side config for a terminating relay: real certificate chain,
/// remote signing key.
pub fn server_config(cert_pem: &[u8], key: Arc<dyn SigningKey>) -> Result<Arc<ServerConfig>> {
    let chain = load_certs(cert_pem)?;
    let certified = Arc::new(CertifiedKey::new(chain, key));
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(StaticResolver { key: certified }));
    Ok(Arc::new(config))
}

/// Client-side config for an initiating relay. With a configured CA the
/// backend certificate is verified against it; without one the backend
/// is accepted as-is.
pub fn client_config(ca_pem: Option<&[u8]>) -> Result<Arc<ClientConfig>> {
    let config = match ca_pem {
        Some(pem) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(pem)? {
                roots.add(cert).context("bad CA certificate")?;
            }
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
        None => ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new()))
            .with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// Backend server name for the client handshake.
pub fn backend_server_name(addr: std::net::SocketAddr) -> ServerName<'static> {
    ServerName::IpAddress(addr.ip().into())
}

/// Verifier that accepts any backend certificate while still checking
/// handshake signatures.
#[derive(Debug)]
pub struct AcceptAnyCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyCert {
    pub fn new() -> AcceptAnyCert {
        AcceptAnyCert {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AcceptAnyCert {
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
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

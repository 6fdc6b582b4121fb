//! TLS configuration for courier connections.
//!
//! Services accept with their own certificate and key; clients connect with
//! a permissive verifier and identify peers by certificate fingerprint
//! rather than web-PKI chains. Operators who want chain validation can run
//! a private CA and substitute their own `rustls` configs.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::PrivateKeyDer;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

/// Errors building TLS configuration.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// A certificate or key file could not be read.
    #[error("failed to read `{path}`: {source}")]
    Io {
        /// The offending path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// PEM material failed to parse.
    #[error("invalid pem material: {0}")]
    InvalidPem(#[source] std::io::Error),

    /// The certificate material parsed to zero certificates.
    #[error("no certificates found in identity")]
    NoCertificates,

    /// The key material parsed to no private key.
    #[error("no private key found in identity")]
    NoPrivateKey,

    /// rustls rejected the certificate/key pair.
    #[error("invalid tls identity: {0}")]
    Identity(#[from] rustls::Error),
}

/// TLS acceptor/connector pair for one service or client.
#[derive(Clone)]
pub struct TlsConfig {
    acceptor: Option<TlsAcceptor>,
    connector: TlsConnector,
}

impl TlsConfig {
    /// Builds a config from in-memory PEM certificate chain and private
    /// key. The result can both accept and dial.
    ///
    /// # Errors
    ///
    /// Returns a [`TlsError`] if either blob is empty of material or
    /// rejected by rustls.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsError> {
        let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<_, _>>()
            .map_err(TlsError::InvalidPem)?;
        if certs.is_empty() {
            return Err(TlsError::NoCertificates);
        }

        let key: PrivateKeyDer = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(TlsError::InvalidPem)?
            .ok_or(TlsError::NoPrivateKey)?;

        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(Self {
            acceptor: Some(TlsAcceptor::from(Arc::new(server_config))),
            connector: permissive_connector(),
        })
    }

    /// Builds a config from a PEM certificate chain and private key on
    /// disk.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::Io`] if either file is unreadable, otherwise as
    /// [`TlsConfig::from_pem`].
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        let read = |path: &Path| {
            std::fs::read(path).map_err(|source| TlsError::Io {
                path: path.display().to_string(),
                source,
            })
        };
        Self::from_pem(&read(cert_path)?, &read(key_path)?)
    }

    /// Builds a dial-only config with no local identity.
    #[must_use]
    pub fn client_only() -> Self {
        Self {
            acceptor: None,
            connector: permissive_connector(),
        }
    }

    /// The acceptor for incoming connections, if this config carries a
    /// local identity.
    #[must_use]
    pub fn acceptor(&self) -> Option<TlsAcceptor> {
        self.acceptor.clone()
    }

    /// The connector for outgoing connections.
    #[must_use]
    pub fn connector(&self) -> TlsConnector {
        self.connector.clone()
    }
}

/// SHA-1 fingerprint of the peer certificate on an established stream,
/// when the peer presented exactly one certificate.
#[must_use]
pub fn peer_fingerprint(stream: &TlsStream<TcpStream>) -> Option<String> {
    let (_, state) = stream.get_ref();
    let certs = state.peer_certificates()?;
    if certs.len() == 1 {
        Some(courier_core::crypto::sha1_fingerprint(certs[0].as_ref()))
    } else {
        None
    }
}

fn permissive_connector() -> TlsConnector {
    let client_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(FingerprintTrustVerifier))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(client_config))
}

/// Certificate verifier that accepts any peer certificate.
///
/// Peers are identified by the SHA-1 fingerprint exposed on the
/// connection, not by chain validation.
#[derive(Debug)]
struct FingerprintTrustVerifier;

impl rustls::client::danger::ServerCertVerifier for FingerprintTrustVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

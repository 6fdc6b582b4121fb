//! Signing, verification, and fingerprint helpers for discovery records.
//!
//! Discovery records are signed with the service's RSA key: a PKCS#1 v1.5
//! SHA-256 signature over the raw class-record JSON, carried base64-encoded
//! and wrapped at [`SIGNATURE_WRAP_WIDTH`] columns. Verification extracts
//! the public key from the first PEM certificate of the record block.

use std::fmt::Write as _;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use x509_parser::pem::parse_x509_pem;

/// Column width at which base64 signatures are wrapped on write.
///
/// Fixed for wire compatibility; readers accept any width.
pub const SIGNATURE_WRAP_WIDTH: usize = 76;

/// The key type services sign their discovery records with.
pub type RecordSigningKey = SigningKey<Sha256>;

/// Errors from record signing and verification.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The certificate blob does not parse as a PEM X.509 certificate.
    #[error("invalid certificate: {reason}")]
    InvalidCertificate {
        /// What failed to parse.
        reason: String,
    },

    /// The certificate's public key is not an RSA key.
    #[error("unsupported public key algorithm in certificate")]
    UnsupportedKeyAlgorithm,

    /// The private key blob does not parse as PKCS#8 or PKCS#1 PEM.
    #[error("invalid private key: {reason}")]
    InvalidPrivateKey {
        /// What failed to parse.
        reason: String,
    },

    /// The signature is not valid base64.
    #[error("invalid signature encoding: {0}")]
    SignatureEncoding(#[from] base64::DecodeError),

    /// The signature does not verify over the signed payload.
    #[error("signature verification failed")]
    SignatureInvalid,
}

/// Loads an RSA signing key from PEM, accepting PKCS#8 (`PRIVATE KEY`) or
/// PKCS#1 (`RSA PRIVATE KEY`) encodings.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidPrivateKey`] if neither encoding parses.
pub fn load_signing_key(pem: &str) -> Result<RecordSigningKey, CryptoError> {
    let key = RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| CryptoError::InvalidPrivateKey {
            reason: e.to_string(),
        })?;
    Ok(SigningKey::new(key))
}

/// Signs `payload` with PKCS#1 v1.5 SHA-256, returning the base64 signature
/// (unwrapped; callers wrap for the cache file).
#[must_use]
pub fn sign_sha256(key: &RecordSigningKey, payload: &[u8]) -> String {
    let signature = key.sign(payload);
    STANDARD.encode(signature.to_bytes())
}

/// Verifies a base64 PKCS#1 v1.5 SHA-256 signature over `payload` against
/// the public key of the first certificate in `cert_pem`.
///
/// The signature may contain embedded line breaks; all ASCII whitespace is
/// stripped before decoding.
///
/// # Errors
///
/// Returns an error if the certificate or signature fails to parse, the
/// certificate does not carry an RSA key, or the signature does not verify.
pub fn verify_sha256(cert_pem: &[u8], payload: &[u8], signature_b64: &[u8]) -> Result<(), CryptoError> {
    let (_, pem) = parse_x509_pem(cert_pem).map_err(|e| CryptoError::InvalidCertificate {
        reason: e.to_string(),
    })?;
    let certificate = pem.parse_x509().map_err(|e| CryptoError::InvalidCertificate {
        reason: e.to_string(),
    })?;

    let public_key = RsaPublicKey::from_public_key_der(certificate.public_key().raw)
        .map_err(|_| CryptoError::UnsupportedKeyAlgorithm)?;

    let stripped: Vec<u8> = signature_b64
        .iter()
        .copied()
        .filter(|byte| !byte.is_ascii_whitespace())
        .collect();
    let signature_bytes = STANDARD.decode(&stripped)?;
    let signature =
        Signature::try_from(signature_bytes.as_slice()).map_err(|_| CryptoError::SignatureInvalid)?;

    VerifyingKey::<Sha256>::new(public_key)
        .verify(payload, &signature)
        .map_err(|_| CryptoError::SignatureInvalid)
}

/// SHA-1 fingerprint of a DER certificate, formatted as colon-separated
/// uppercase hex octets.
#[must_use]
pub fn sha1_fingerprint(der: &[u8]) -> String {
    let digest = Sha1::digest(der);
    let mut out = String::with_capacity(digest.len() * 3);
    for (index, byte) in digest.iter().enumerate() {
        if index > 0 {
            out.push(':');
        }
        let _ = write!(out, "{byte:02X}");
    }
    out
}

/// Splits a base64 signature into rows of [`SIGNATURE_WRAP_WIDTH`] columns.
///
/// The final row carries the remainder; an input at or under the width is
/// returned as a single row.
#[must_use]
pub fn split_signature_rows(input: &str) -> Vec<&str> {
    let mut rows = Vec::with_capacity(input.len().div_ceil(SIGNATURE_WRAP_WIDTH).max(1));
    let mut rest = input;
    while rest.len() > SIGNATURE_WRAP_WIDTH {
        let (row, tail) = rest.split_at(SIGNATURE_WRAP_WIDTH);
        rows.push(row);
        rest = tail;
    }
    rows.push(rest);
    rows
}

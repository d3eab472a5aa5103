//! Signing adapter: private keys, holder credentials and digest signatures.
//!
//! Two key families are accepted, each with a fixed signature encoding:
//! - ECDSA (P-256 or P-384): IEEE P1363, the big-endian `r || s` pair padded to
//!   the curve's field width.
//! - RSA: PSS with SHA-256 and a 32-byte salt.
pub mod xml;

use base64ct::{Base64, Encoding};
use const_oid::ObjectIdentifier;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, PrivateKeyInfo, SecretDocument};
use rand::rngs::OsRng;
use rsa::{Pss, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use x509_cert::{
    der::{Decode, DecodePem, Encode},
    Certificate,
};

const ID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const SECP256R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");
const SECP384R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");
const RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");

/// Salt length the Registry expects in RSA-PSS signatures.
pub const PSS_SALT_LEN: usize = 32;

/// Errors produced while loading keys or producing signatures.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("unsupported key algorithm: {0}")]
    UnsupportedKeyAlgorithm(String),
    #[error("certificate private key is not RSA; the configured signature backend only supports RSA")]
    PrivateKeyNotRsa,
    #[error("failed to parse private key: {0}")]
    KeyParse(String),
    #[error("failed to parse certificate: {0}")]
    CertificateParse(String),
    #[error("private key does not match the certificate public key")]
    KeyCertificateMismatch,
    #[error("signing failed: {0}")]
    Signature(String),
    #[error("failed to assemble signed document: {0}")]
    Document(String),
}

/// Key algorithm tag, used where only the kind of key matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    EcdsaP256,
    EcdsaP384,
    Rsa,
}

/// Capability shared by every key the Registry accepts: sign a SHA-256 digest in
/// the algorithm's fixed wire encoding.
pub trait DigestSigner {
    fn algorithm(&self) -> KeyAlgorithm;
    fn sign_digest(&self, digest: &[u8; 32]) -> Result<Vec<u8>, SigningError>;
}

/// A private key of one of the supported algorithms.
#[derive(Clone)]
pub enum SigningKey {
    EcdsaP256(p256::ecdsa::SigningKey),
    EcdsaP384(p384::ecdsa::SigningKey),
    Rsa(RsaPrivateKey),
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SigningKey").field(&self.algorithm()).finish()
    }
}

impl From<p256::ecdsa::SigningKey> for SigningKey {
    fn from(key: p256::ecdsa::SigningKey) -> Self {
        SigningKey::EcdsaP256(key)
    }
}

impl From<p384::ecdsa::SigningKey> for SigningKey {
    fn from(key: p384::ecdsa::SigningKey) -> Self {
        SigningKey::EcdsaP384(key)
    }
}

impl From<RsaPrivateKey> for SigningKey {
    fn from(key: RsaPrivateKey) -> Self {
        SigningKey::Rsa(key)
    }
}

impl DigestSigner for SigningKey {
    fn algorithm(&self) -> KeyAlgorithm {
        match self {
            SigningKey::EcdsaP256(_) => KeyAlgorithm::EcdsaP256,
            SigningKey::EcdsaP384(_) => KeyAlgorithm::EcdsaP384,
            SigningKey::Rsa(_) => KeyAlgorithm::Rsa,
        }
    }

    fn sign_digest(&self, digest: &[u8; 32]) -> Result<Vec<u8>, SigningError> {
        match self {
            SigningKey::EcdsaP256(key) => {
                let signature: p256::ecdsa::Signature = key
                    .sign_prehash(digest)
                    .map_err(|e| SigningError::Signature(format!("ECDSA: {e}")))?;
                Ok(signature.to_bytes().to_vec())
            }
            SigningKey::EcdsaP384(key) => {
                let signature: p384::ecdsa::Signature = key
                    .sign_prehash(digest)
                    .map_err(|e| SigningError::Signature(format!("ECDSA: {e}")))?;
                Ok(signature.to_bytes().to_vec())
            }
            SigningKey::Rsa(key) => key
                .sign_with_rng(
                    &mut OsRng,
                    Pss::new_with_salt::<Sha256>(PSS_SALT_LEN),
                    digest,
                )
                .map_err(|e| SigningError::Signature(format!("RSA-PSS: {e}"))),
        }
    }
}

impl SigningKey {
    /// Parse an unencrypted PKCS#8 private key, dispatching on its algorithm OID.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, SigningError> {
        let info = PrivateKeyInfo::try_from(der)
            .map_err(|e| SigningError::KeyParse(format!("PKCS#8: {e}")))?;
        let oid = info.algorithm.oid;
        if oid == ID_EC_PUBLIC_KEY {
            let curve = info
                .algorithm
                .parameters_oid()
                .map_err(|e| SigningError::KeyParse(format!("EC curve parameters: {e}")))?;
            return match curve {
                SECP256R1 => p256::ecdsa::SigningKey::from_pkcs8_der(der)
                    .map(SigningKey::EcdsaP256)
                    .map_err(|e| SigningError::KeyParse(format!("P-256: {e}"))),
                SECP384R1 => p384::ecdsa::SigningKey::from_pkcs8_der(der)
                    .map(SigningKey::EcdsaP384)
                    .map_err(|e| SigningError::KeyParse(format!("P-384: {e}"))),
                other => Err(SigningError::UnsupportedKeyAlgorithm(format!(
                    "ECDSA curve {other}"
                ))),
            };
        }
        if oid == RSA_ENCRYPTION {
            let key = RsaPrivateKey::from_pkcs8_der(der)
                .map_err(|e| SigningError::KeyParse(format!("RSA: {e}")))?;
            return Ok(SigningKey::Rsa(key));
        }
        Err(SigningError::UnsupportedKeyAlgorithm(oid.to_string()))
    }

    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, SigningError> {
        let (label, doc) = SecretDocument::from_pem(pem)
            .map_err(|e| SigningError::KeyParse(format!("PEM: {e}")))?;
        if label != "PRIVATE KEY" {
            return Err(SigningError::KeyParse(format!(
                "expected a PRIVATE KEY block, got {label}"
            )));
        }
        Self::from_pkcs8_der(doc.as_bytes())
    }

    pub fn to_pkcs8_der(&self) -> Result<SecretDocument, SigningError> {
        match self {
            SigningKey::EcdsaP256(key) => key.to_pkcs8_der(),
            SigningKey::EcdsaP384(key) => key.to_pkcs8_der(),
            SigningKey::Rsa(key) => key.to_pkcs8_der(),
        }
        .map_err(|e| SigningError::KeyParse(format!("PKCS#8 encoding: {e}")))
    }

    /// DER-encoded SubjectPublicKeyInfo of the matching public key.
    pub fn public_key_der(&self) -> Result<Vec<u8>, SigningError> {
        let doc = match self {
            SigningKey::EcdsaP256(key) => key.verifying_key().to_public_key_der(),
            SigningKey::EcdsaP384(key) => key.verifying_key().to_public_key_der(),
            SigningKey::Rsa(key) => RsaPublicKey::from(key).to_public_key_der(),
        }
        .map_err(|e| SigningError::KeyParse(format!("public key encoding: {e}")))?;
        Ok(doc.as_bytes().to_vec())
    }
}

/// Certificate and matching private key of the identity the client acts for.
#[derive(Debug, Clone)]
pub struct HolderCredentials {
    certificate: Certificate,
    key: SigningKey,
}

impl HolderCredentials {
    /// Pair a certificate with its private key; fails if the key does not belong to
    /// the certificate.
    pub fn new(certificate: Certificate, key: SigningKey) -> Result<Self, SigningError> {
        let cert_spki = certificate
            .tbs_certificate
            .subject_public_key_info
            .to_der()
            .map_err(|e| SigningError::CertificateParse(format!("public key: {e}")))?;
        if cert_spki != key.public_key_der()? {
            return Err(SigningError::KeyCertificateMismatch);
        }
        Ok(Self { certificate, key })
    }

    pub fn from_der(cert_der: &[u8], private_key_der: &[u8]) -> Result<Self, SigningError> {
        let certificate = Certificate::from_der(cert_der)
            .map_err(|e| SigningError::CertificateParse(e.to_string()))?;
        let key = SigningKey::from_pkcs8_der(private_key_der)?;
        Self::new(certificate, key)
    }

    pub fn from_pem(cert_pem: &str, private_key_pem: &str) -> Result<Self, SigningError> {
        let certificate = Certificate::from_pem(cert_pem.as_bytes())
            .map_err(|e| SigningError::CertificateParse(e.to_string()))?;
        let key = SigningKey::from_pkcs8_pem(private_key_pem)?;
        Self::new(certificate, key)
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn key(&self) -> &SigningKey {
        &self.key
    }

    pub fn certificate_der(&self) -> Result<Vec<u8>, SigningError> {
        self.certificate
            .to_der()
            .map_err(|e| SigningError::CertificateParse(format!("DER encoding: {e}")))
    }

    pub fn certificate_base64(&self) -> Result<String, SigningError> {
        Ok(Base64::encode_string(&self.certificate_der()?))
    }

    /// Uppercase hex SHA-256 of the certificate DER, the form the Registry shows.
    pub fn certificate_fingerprint(&self) -> Result<String, SigningError> {
        let digest = Sha256::digest(self.certificate_der()?);
        Ok(digest.iter().map(|b| format!("{b:02X}")).collect())
    }
}

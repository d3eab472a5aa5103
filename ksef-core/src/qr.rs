//! Verification URLs printed as QR codes on invoices.
//!
//! Two codes exist: an invoice code any reader can check against the Registry,
//! and a certificate code (offline invoices) whose URL is signed with the
//! issuer's certificate key.
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::EnvironmentType;
use crate::sign::{DigestSigner, SigningError};

#[derive(Debug, Error)]
pub enum QrError {
    #[error("invalid input: {0} must not be empty")]
    InvalidInput(&'static str),
    #[error("unsupported key algorithm for verification URL signing: {0}")]
    UnsupportedKeyAlgorithm(String),
    #[error(transparent)]
    Signing(SigningError),
}

impl From<SigningError> for QrError {
    fn from(err: SigningError) -> Self {
        match err {
            SigningError::UnsupportedKeyAlgorithm(alg) => QrError::UnsupportedKeyAlgorithm(alg),
            other => QrError::Signing(other),
        }
    }
}

fn required(value: &str, field: &'static str) -> Result<(), QrError> {
    if value.trim().is_empty() {
        return Err(QrError::InvalidInput(field));
    }
    Ok(())
}

/// URL for the invoice code, e.g.
/// `https://qr.ksef.mf.gov.pl/invoice/1234567890/25-10-2023/<hash>`.
pub fn invoice_verification_url(
    env: EnvironmentType,
    seller_tax_id: &str,
    issue_date: NaiveDate,
    invoice_hash: &[u8],
) -> Result<String, QrError> {
    required(seller_tax_id, "seller tax id")?;
    Ok(format!(
        "https://{}/invoice/{}/{}/{}",
        env.qr_host(),
        seller_tax_id,
        issue_date.format("%d-%m-%Y"),
        Base64UrlUnpadded::encode_string(invoice_hash)
    ))
}

/// Certificate code URL before signing. Carries no scheme: the signature covers
/// `host/path` only.
pub fn unsigned_certificate_verification_url(
    env: EnvironmentType,
    context_tax_id: &str,
    seller_tax_id: &str,
    certificate_serial: &str,
    invoice_hash: &[u8],
) -> Result<String, QrError> {
    required(context_tax_id, "context tax id")?;
    required(seller_tax_id, "seller tax id")?;
    required(certificate_serial, "certificate serial")?;
    if invoice_hash.is_empty() {
        return Err(QrError::InvalidInput("invoice hash"));
    }
    Ok(format!(
        "{}/certificate/Nip/{}/{}/{}/{}",
        env.qr_host(),
        context_tax_id,
        seller_tax_id,
        certificate_serial,
        Base64UrlUnpadded::encode_string(invoice_hash)
    ))
}

/// Sign an unsigned certificate URL and return the full `https://` URL with the
/// base64url signature appended as the last path segment.
pub fn sign_certificate_verification_url(
    unsigned_url: &str,
    key: &impl DigestSigner,
) -> Result<String, QrError> {
    required(unsigned_url, "unsigned url")?;
    let digest: [u8; 32] = Sha256::digest(unsigned_url.as_bytes()).into();
    let signature = key.sign_digest(&digest)?;
    Ok(format!(
        "https://{}/{}",
        unsigned_url,
        Base64UrlUnpadded::encode_string(&signature)
    ))
}

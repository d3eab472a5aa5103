//! CSR generation from Registry-provided enrollment data.
use base64ct::{Base64, Encoding};
use const_oid::ObjectIdentifier;
use p256::ecdsa::DerSignature;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x509_cert::{
    attr::AttributeTypeAndValue,
    builder::{Builder, RequestBuilder},
    der::{
        asn1::SetOfVec,
        Any, Encode, Error as DerError, Tag,
    },
    name::{Name, RdnSequence, RelativeDistinguishedName},
    request::CertReq,
};

use crate::sign::SigningKey;

/// Errors that can occur while generating CSRs.
#[derive(Debug, Error)]
pub enum CsrError {
    #[error("missing required enrollment field '{0}'")]
    MissingRequiredField(&'static str),

    #[error("unsupported key type for certificate enrollment: {0} (only ECDSA P-256 is accepted)")]
    UnsupportedKeyType(&'static str),

    #[error("invalid subject distinguished name constructed from provided fields: {message}")]
    InvalidSubject { message: String },

    #[error("failed to construct CSR request: {message}")]
    RequestBuild { message: String },

    #[error("failed to build CSR: {message}")]
    CsrBuild { message: String },

    #[error("failed DER encoding for {context}: {source}")]
    DerEncode {
        context: &'static str,
        #[source]
        source: DerError,
    },
}

pub const COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
pub const SURNAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.4");
pub const SERIAL_NUMBER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.5");
pub const COUNTRY_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.6");
pub const ORGANIZATION_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.10");
pub const GIVEN_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.42");
pub const UNIQUE_IDENTIFIER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.45");
pub const ORGANIZATION_IDENTIFIER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.97");

/// Subject attributes the Registry requires in an enrollment CSR, as returned by
/// `GET /certificates/enrollments/data`.
///
/// # Examples
/// ```rust
/// use ksef_core::csr::CertificateEnrollmentData;
/// use rand::rngs::OsRng;
///
/// let data = CertificateEnrollmentData {
///     common_name: "Jan Kowalski".into(),
///     country_name: "PL".into(),
///     unique_identifier: "a1b2c3".into(),
///     ..Default::default()
/// };
/// let key = p256::ecdsa::SigningKey::random(&mut OsRng);
/// let csr = data.generate_csr(&key)?;
/// assert!(!csr.is_empty());
/// # Ok::<(), ksef_core::csr::CsrError>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CertificateEnrollmentData {
    pub common_name: String,
    pub country_name: String,
    pub unique_identifier: String,
    pub organization_name: String,
    pub organization_identifier: String,
    pub serial_number: String,
    pub surname: String,
    pub given_name: String,
}

/// Characters of the ASN.1 PrintableString alphabet.
fn is_printable(value: &str) -> bool {
    value.chars().all(|c| {
        c.is_ascii_alphanumeric()
            || matches!(c, ' ' | '\'' | '(' | ')' | '+' | ',' | '-' | '.' | '/' | ':' | '=' | '?')
    })
}

fn rdn(oid: ObjectIdentifier, tag: Tag, value: &str) -> Result<RelativeDistinguishedName, CsrError> {
    let value = Any::new(tag, value.as_bytes()).map_err(|e| CsrError::InvalidSubject {
        message: format!("{oid}: {e}"),
    })?;
    let set = SetOfVec::try_from(vec![AttributeTypeAndValue { oid, value }]).map_err(|e| {
        CsrError::InvalidSubject {
            message: format!("{oid}: {e}"),
        }
    })?;
    Ok(RelativeDistinguishedName(set))
}

fn directory_string(value: &str) -> Tag {
    if is_printable(value) {
        Tag::PrintableString
    } else {
        Tag::Utf8String
    }
}

impl CertificateEnrollmentData {
    fn validate(&self) -> Result<(), CsrError> {
        if self.common_name.trim().is_empty() {
            return Err(CsrError::MissingRequiredField("commonName"));
        }
        if self.country_name.trim().is_empty() {
            return Err(CsrError::MissingRequiredField("countryName"));
        }
        if self.unique_identifier.trim().is_empty() {
            return Err(CsrError::MissingRequiredField("uniqueIdentifier"));
        }
        let country = self.country_name.as_bytes();
        if country.len() != 2 || !country.iter().all(u8::is_ascii_alphabetic) {
            return Err(CsrError::InvalidSubject {
                message: format!(
                    "countryName must be a two-letter code, got {:?}",
                    self.country_name
                ),
            });
        }
        if !is_printable(&self.serial_number) {
            return Err(CsrError::InvalidSubject {
                message: format!(
                    "serialNumber {:?} is outside the PrintableString alphabet",
                    self.serial_number
                ),
            });
        }
        Ok(())
    }

    /// Subject in the attribute order the Registry issues certificates with.
    pub fn generate_subject(&self) -> Result<Name, CsrError> {
        self.validate()?;
        let mut rdns = vec![rdn(COUNTRY_NAME, Tag::PrintableString, &self.country_name)?];
        if !self.organization_name.is_empty() {
            rdns.push(rdn(ORGANIZATION_NAME, Tag::Utf8String, &self.organization_name)?);
        }
        rdns.push(rdn(COMMON_NAME, Tag::Utf8String, &self.common_name)?);

        let optional = [
            (SERIAL_NUMBER, &self.serial_number),
            (SURNAME, &self.surname),
            (GIVEN_NAME, &self.given_name),
            (ORGANIZATION_IDENTIFIER, &self.organization_identifier),
        ];
        for (oid, value) in optional {
            if value.is_empty() {
                continue;
            }
            let tag = if oid == SERIAL_NUMBER {
                Tag::PrintableString
            } else {
                Tag::Utf8String
            };
            rdns.push(rdn(oid, tag, value)?);
        }
        rdns.push(rdn(
            UNIQUE_IDENTIFIER,
            directory_string(&self.unique_identifier),
            &self.unique_identifier,
        )?);
        Ok(RdnSequence(rdns))
    }

    pub fn build(&self, signer: &p256::ecdsa::SigningKey) -> Result<CertReq, CsrError> {
        let subject = self.generate_subject()?;
        let builder = RequestBuilder::new(subject, signer).map_err(|e| CsrError::RequestBuild {
            message: e.to_string(),
        })?;
        builder
            .build::<DerSignature>()
            .map_err(|e| CsrError::CsrBuild {
                message: e.to_string(),
            })
    }

    /// Signed CSR as base64 of its DER encoding.
    pub fn generate_csr(&self, signer: &p256::ecdsa::SigningKey) -> Result<String, CsrError> {
        self.build(signer)?.to_base64_string()
    }

    /// Same as [`generate_csr`](Self::generate_csr) for a key held by the signing
    /// adapter; the Registry only enrolls P-256 keys.
    pub fn generate_csr_with_key(&self, key: &SigningKey) -> Result<String, CsrError> {
        match key {
            SigningKey::EcdsaP256(signer) => self.generate_csr(signer),
            SigningKey::EcdsaP384(_) => Err(CsrError::UnsupportedKeyType("ECDSA P-384")),
            SigningKey::Rsa(_) => Err(CsrError::UnsupportedKeyType("RSA")),
        }
    }
}

/// Encode to base64 string.
pub trait ToBase64String {
    fn to_base64_string(&self) -> Result<String, CsrError>;
}

impl ToBase64String for CertReq {
    fn to_base64_string(&self) -> Result<String, CsrError> {
        let der_bytes = self.to_der().map_err(|e| CsrError::DerEncode {
            context: "certificate request",
            source: e,
        })?;
        Ok(Base64::encode_string(&der_bytes))
    }
}

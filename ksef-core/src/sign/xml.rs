//! Enveloped XML signatures over authorization requests.
//!
//! Documents handed to an [`XmlSigner`] are already in exclusive canonical form:
//! no XML declaration, double-quoted attributes, explicit end tags and minimal
//! text escaping. The signer can therefore digest the bytes as given.
use base64ct::{Base64, Encoding};
use sha2::{Digest, Sha256};

use super::{DigestSigner, HolderCredentials, KeyAlgorithm, SigningError};

pub const XMLDSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
pub const SHA256_DIGEST: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
pub const ECDSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256";
pub const RSA_PSS_SHA256: &str = "http://www.w3.org/2007/05/xmldsig-more#sha256-rsa-MGF1";

/// Detached `ds:Signature` element, ready to be placed inside the signed root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureEnvelope {
    xml: String,
}

impl SignatureEnvelope {
    pub fn as_str(&self) -> &str {
        &self.xml
    }

    pub fn into_string(self) -> String {
        self.xml
    }
}

/// XML signature backend. Implementations receive the canonical root element
/// and return the signature element to append to it.
pub trait XmlSigner: Send + Sync + std::fmt::Debug {
    fn sign(
        &self,
        document: &[u8],
        credentials: &HolderCredentials,
    ) -> Result<SignatureEnvelope, SigningError>;
}

/// Default backend producing an enveloped XMLDSig signature.
///
/// `rsa_only()` mirrors Registry tooling that only handles RSA keys; it fails
/// with [`SigningError::PrivateKeyNotRsa`] for any other key.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopedSigner {
    rsa_only: bool,
}

impl EnvelopedSigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rsa_only() -> Self {
        Self { rsa_only: true }
    }
}

fn signature_method(algorithm: KeyAlgorithm) -> &'static str {
    match algorithm {
        KeyAlgorithm::EcdsaP256 | KeyAlgorithm::EcdsaP384 => ECDSA_SHA256,
        KeyAlgorithm::Rsa => RSA_PSS_SHA256,
    }
}

/// SignedInfo in its canonical serialization, which is also the signed octets.
fn signed_info(method: &str, digest_b64: &str) -> String {
    format!(
        concat!(
            r#"<ds:SignedInfo xmlns:ds="{ns}">"#,
            r#"<ds:CanonicalizationMethod Algorithm="{c14n}"></ds:CanonicalizationMethod>"#,
            r#"<ds:SignatureMethod Algorithm="{method}"></ds:SignatureMethod>"#,
            r#"<ds:Reference URI="">"#,
            r#"<ds:Transforms>"#,
            r#"<ds:Transform Algorithm="{enveloped}"></ds:Transform>"#,
            r#"<ds:Transform Algorithm="{c14n}"></ds:Transform>"#,
            r#"</ds:Transforms>"#,
            r#"<ds:DigestMethod Algorithm="{digest}"></ds:DigestMethod>"#,
            r#"<ds:DigestValue>{value}</ds:DigestValue>"#,
            r#"</ds:Reference>"#,
            r#"</ds:SignedInfo>"#,
        ),
        ns = XMLDSIG_NS,
        c14n = EXC_C14N,
        method = method,
        enveloped = ENVELOPED_SIGNATURE,
        digest = SHA256_DIGEST,
        value = digest_b64,
    )
}

impl XmlSigner for EnvelopedSigner {
    fn sign(
        &self,
        document: &[u8],
        credentials: &HolderCredentials,
    ) -> Result<SignatureEnvelope, SigningError> {
        let key = credentials.key();
        if self.rsa_only && key.algorithm() != KeyAlgorithm::Rsa {
            return Err(SigningError::PrivateKeyNotRsa);
        }

        let document_digest = Base64::encode_string(&Sha256::digest(document));
        let signed_info = signed_info(signature_method(key.algorithm()), &document_digest);
        let signed_info_digest: [u8; 32] = Sha256::digest(signed_info.as_bytes()).into();
        let signature_value = Base64::encode_string(&key.sign_digest(&signed_info_digest)?);
        let certificate = credentials.certificate_base64()?;

        // SignedInfo is nested as-is; its own xmlns:ds declaration is redundant
        // inside ds:Signature but keeps the signed octets byte-identical.
        let xml = format!(
            concat!(
                r#"<ds:Signature xmlns:ds="{ns}">"#,
                "{signed_info}",
                "<ds:SignatureValue>{value}</ds:SignatureValue>",
                "<ds:KeyInfo><ds:X509Data><ds:X509Certificate>{cert}</ds:X509Certificate></ds:X509Data></ds:KeyInfo>",
                "</ds:Signature>",
            ),
            ns = XMLDSIG_NS,
            signed_info = signed_info,
            value = signature_value,
            cert = certificate,
        );
        Ok(SignatureEnvelope { xml })
    }
}

/// Append `envelope` as the last child of the document's root element.
pub fn append_to_root(document: &str, envelope: &SignatureEnvelope) -> Result<String, SigningError> {
    let trimmed = document.trim_end();
    if !trimmed.ends_with('>') {
        return Err(SigningError::Document("document does not end with a closing tag".into()));
    }
    let close = trimmed
        .rfind("</")
        .ok_or_else(|| SigningError::Document("root element has no closing tag".into()))?;
    let mut out = String::with_capacity(trimmed.len() + envelope.as_str().len());
    out.push_str(&trimmed[..close]);
    out.push_str(envelope.as_str());
    out.push_str(&trimmed[close..]);
    Ok(out)
}

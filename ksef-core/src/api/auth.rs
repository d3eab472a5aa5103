//! Challenge / signed-request / token handshake.
use chrono::{DateTime, Utc};
use quick_xml::{
    escape::partial_escape,
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
    Writer,
};
use serde::Deserialize;
use std::fmt;
use tracing::{debug, info};

use super::{ContextIdentifier, KsefClient, KsefError};
use crate::sign::{
    xml::{append_to_root, XmlSigner},
    HolderCredentials, SigningError,
};

pub const AUTH_TOKEN_NS: &str = "http://ksef.mf.gov.pl/auth/token/2.0";

/// One-time challenge issued by `GET /auth/challenge`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthChallenge {
    challenge: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

impl AuthChallenge {
    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }
}

/// Access token attached to every call after authentication.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BearerToken {
    token: String,
    #[serde(default)]
    valid_until: Option<DateTime<Utc>>,
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("token", &"[redacted]")
            .field("valid_until", &self.valid_until)
            .finish()
    }
}

impl BearerToken {
    pub fn as_str(&self) -> &str {
        &self.token
    }

    pub fn valid_until(&self) -> Option<DateTime<Utc>> {
        self.valid_until
    }
}

/// How the Registry matches the signing certificate to the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectIdentifierType {
    CertificateSubject,
    CertificateFingerprint,
}

impl SubjectIdentifierType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectIdentifierType::CertificateSubject => "certificateSubject",
            SubjectIdentifierType::CertificateFingerprint => "certificateFingerprint",
        }
    }

    /// EU VAT contexts are bound by certificate fingerprint, everything else by
    /// certificate subject.
    pub fn for_context(context: &ContextIdentifier) -> Self {
        match context {
            ContextIdentifier::NipVatUe(_) => SubjectIdentifierType::CertificateFingerprint,
            _ => SubjectIdentifierType::CertificateSubject,
        }
    }
}

fn xml_error(err: impl fmt::Display) -> SigningError {
    SigningError::Document(err.to_string())
}

fn write_text_element<W: std::io::Write>(
    writer: &mut Writer<W>,
    name: &str,
    text: &str,
) -> Result<(), SigningError> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Text(BytesText::from_escaped(partial_escape(text))))
        .map_err(xml_error)?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(xml_error)?;
    Ok(())
}

/// Unsigned `AuthTokenRequest` root element in canonical form, without an XML
/// declaration.
pub fn authorization_request_xml(
    challenge: &str,
    context: &ContextIdentifier,
) -> Result<String, SigningError> {
    let mut writer = Writer::new(Vec::new());
    writer
        .write_event(Event::Start(
            BytesStart::new("AuthTokenRequest").with_attributes([("xmlns", AUTH_TOKEN_NS)]),
        ))
        .map_err(xml_error)?;
    write_text_element(&mut writer, "Challenge", challenge)?;
    writer
        .write_event(Event::Start(BytesStart::new("ContextIdentifier")))
        .map_err(xml_error)?;
    write_text_element(&mut writer, context.element_name(), context.value())?;
    writer
        .write_event(Event::End(BytesEnd::new("ContextIdentifier")))
        .map_err(xml_error)?;
    write_text_element(
        &mut writer,
        "SubjectIdentifierType",
        SubjectIdentifierType::for_context(context).as_str(),
    )?;
    writer
        .write_event(Event::End(BytesEnd::new("AuthTokenRequest")))
        .map_err(xml_error)?;
    String::from_utf8(writer.into_inner()).map_err(xml_error)
}

/// Complete signed request body: XML declaration, request, and the signature as
/// the last child of the root.
pub fn signed_authorization_request(
    challenge: &str,
    context: &ContextIdentifier,
    credentials: &HolderCredentials,
    signer: &dyn XmlSigner,
) -> Result<String, SigningError> {
    let document = authorization_request_xml(challenge, context)?;
    let envelope = signer.sign(document.as_bytes(), credentials)?;
    let signed = append_to_root(&document, &envelope)?;

    let mut writer = Writer::new(Vec::new());
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_error)?;
    let mut out = String::from_utf8(writer.into_inner()).map_err(xml_error)?;
    out.push_str(&signed);
    Ok(out)
}

impl KsefClient {
    /// Request a fresh authorization challenge. Needs no token.
    pub async fn authorization_challenge(&self) -> Result<AuthChallenge, KsefError> {
        let url = self.build_endpoint(&["auth", "challenge"])?;
        self.exchange(self.client.get(url)).await
    }

    /// Run the full handshake and store the issued token on the client.
    ///
    /// # Errors
    /// [`KsefError::ChallengeUnavailable`] if no challenge could be obtained,
    /// [`KsefError::Signing`] if the request could not be signed, and
    /// [`KsefError::TokenExchangeRejected`] if the Registry refused the signed
    /// request. No step is retried.
    pub async fn authenticate(&mut self) -> Result<&BearerToken, KsefError> {
        let challenge = self
            .authorization_challenge()
            .await
            .map_err(|err| match err {
                KsefError::Cancelled => KsefError::Cancelled,
                other => KsefError::ChallengeUnavailable(Box::new(other)),
            })?;
        debug!("authorization challenge received");

        let body = signed_authorization_request(
            challenge.challenge(),
            self.identity.context(),
            self.identity.credentials(),
            self.xml_signer.as_ref(),
        )?;

        let url = self.build_endpoint(&["auth", "token"])?;
        let request = self
            .client
            .post(url)
            .header("Content-Type", "application/xml")
            .body(body);
        let token: BearerToken = self.exchange(request).await.map_err(|err| match err {
            KsefError::Cancelled => KsefError::Cancelled,
            other => KsefError::TokenExchangeRejected(Box::new(other)),
        })?;

        info!(
            context = self.identity.context().element_name(),
            valid_until = ?token.valid_until(),
            "authenticated with KSeF"
        );
        Ok(self.token.insert(token))
    }
}

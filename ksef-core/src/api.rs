//! KSeF HTTP API client and response types.
pub mod auth;
pub mod enrollment;
pub mod invoices;
pub mod session;

use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    config::Config,
    csr::CsrError,
    encryption::EncryptionError,
    poll::PollError,
    sign::{
        xml::{EnvelopedSigner, XmlSigner},
        HolderCredentials, SigningError,
    },
};

use self::{auth::BearerToken, session::SessionState};

/// Input rejected before anything was sent to the Registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingRequiredField(&'static str),
    #[error("invalid certificate type: {0}")]
    InvalidCertificateType(String),
    #[error("certificate signing request is empty")]
    MissingCsr,
    #[error("invoice of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("date range ends before it starts")]
    InvalidDateRange,
}

/// Errors returned by the KSeF API client.
#[derive(Error, Debug)]
pub enum KsefError {
    #[error("HTTP client error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Unauthorized: {0}")]
    Unauthorized(ServerRejection),
    #[error("Request rejected by KSeF: {0}")]
    ServerRejected(ServerRejection),
    #[error("Invalid response from KSeF: {0}")]
    InvalidResponse(String),
    #[error("invalid API base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("not authenticated; call authenticate() first")]
    Unauthenticated,
    #[error("authorization challenge unavailable: {0}")]
    ChallengeUnavailable(#[source] Box<KsefError>),
    #[error("token exchange rejected: {0}")]
    TokenExchangeRejected(#[source] Box<KsefError>),
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error(transparent)]
    Csr(#[from] CsrError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Encryption(#[from] EncryptionError),
    #[error("no terminal status after {attempts} polling attempts")]
    PollingExhausted { attempts: u32 },
    #[error("KSeF reported terminal failure {code}: {description}")]
    TerminalFailure { code: i32, description: String },
    #[error("expected exactly one certificate, found {found}")]
    AmbiguousOrMissingCertificate { found: usize },
    #[error("upload session is {0}, not open")]
    SessionNotOpen(SessionState),
    #[error("upload session is {0}; close it before checking processing status")]
    SessionNotClosed(SessionState),
    #[error("upload session is {0}; results are available once processing is resolved")]
    SessionNotResolved(SessionState),
    #[error("upload session {reference_number} expired at {valid_until}")]
    SessionExpired {
        reference_number: String,
        valid_until: DateTime<Utc>,
    },
    #[error("operation cancelled")]
    Cancelled,
}

impl From<PollError<KsefError>> for KsefError {
    fn from(err: PollError<KsefError>) -> Self {
        match err {
            PollError::Exhausted { attempts } => KsefError::PollingExhausted { attempts },
            PollError::Cancelled => KsefError::Cancelled,
            PollError::Attempt(inner) => inner,
        }
    }
}

/// Non-success reply from the Registry, parsed from its exception body when possible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRejection {
    status: u16,
    code: Option<i64>,
    description: String,
    details: Vec<String>,
}

impl ServerRejection {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn code(&self) -> Option<i64> {
        self.code
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn details(&self) -> &[String] {
        &self.details
    }

    fn from_body(status: StatusCode, body: &str) -> Self {
        let detail = serde_json::from_str::<ExceptionResponse>(body)
            .ok()
            .and_then(|parsed| parsed.exception.exception_detail_list.into_iter().next());
        match detail {
            Some(detail) => ServerRejection {
                status: status.as_u16(),
                code: detail.exception_code,
                description: detail
                    .exception_description
                    .unwrap_or_else(|| status.to_string()),
                details: detail.details,
            },
            None => ServerRejection {
                status: status.as_u16(),
                code: None,
                description: if body.trim().is_empty() {
                    status.to_string()
                } else {
                    body.to_string()
                },
                details: Vec::new(),
            },
        }
    }
}

impl fmt::Display for ServerRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status {}", self.status)?;
        if let Some(code) = self.code {
            write!(f, ", code {code}")?;
        }
        write!(f, ": {}", self.description)?;
        if !self.details.is_empty() {
            write!(f, " ({})", self.details.join("; "))?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExceptionResponse {
    exception: ExceptionBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExceptionBody {
    #[serde(default)]
    exception_detail_list: Vec<ExceptionDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExceptionDetail {
    exception_code: Option<i64>,
    exception_description: Option<String>,
    #[serde(default)]
    details: Vec<String>,
}

/// Processing status shared by enrollment and session responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    code: i32,
    #[serde(default)]
    description: String,
    #[serde(default)]
    details: Vec<String>,
}

impl StatusInfo {
    pub fn new(code: i32, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: Vec::new(),
        }
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn details(&self) -> &[String] {
        &self.details
    }
}

/// Taxpayer context the client acts for. Exactly one identifier kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContextIdentifier {
    /// Polish tax identification number.
    Nip(String),
    /// NIP paired with an EU VAT number; authenticated by certificate fingerprint.
    NipVatUe(String),
    InternalId(String),
    PeppolId(String),
}

impl ContextIdentifier {
    /// Element name used in the authorization request.
    pub fn element_name(&self) -> &'static str {
        match self {
            ContextIdentifier::Nip(_) => "Nip",
            ContextIdentifier::NipVatUe(_) => "NipVatUe",
            ContextIdentifier::InternalId(_) => "InternalId",
            ContextIdentifier::PeppolId(_) => "PeppolId",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            ContextIdentifier::Nip(value)
            | ContextIdentifier::NipVatUe(value)
            | ContextIdentifier::InternalId(value)
            | ContextIdentifier::PeppolId(value) => value,
        }
    }
}

/// Who the client is: the taxpayer context plus the certificate and key that
/// prove it.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    context: ContextIdentifier,
    credentials: HolderCredentials,
}

impl ClientIdentity {
    pub fn new(
        context: ContextIdentifier,
        credentials: HolderCredentials,
    ) -> Result<Self, KsefError> {
        if context.value().trim().is_empty() {
            return Err(ValidationError::MissingRequiredField("contextIdentifier").into());
        }
        Ok(Self {
            context,
            credentials,
        })
    }

    pub fn context(&self) -> &ContextIdentifier {
        &self.context
    }

    pub fn credentials(&self) -> &HolderCredentials {
        &self.credentials
    }
}

/// KSeF API client.
///
/// One client per identity. Operations are `async` and awaited one at a time by
/// the caller; the client spawns no tasks. Cancelling the token passed to
/// [`with_cancellation`](Self::with_cancellation) aborts the in-flight request or
/// polling delay with [`KsefError::Cancelled`].
///
/// # Examples
/// ```rust,no_run
/// use ksef_core::api::{ClientIdentity, ContextIdentifier, KsefClient};
/// use ksef_core::config::Config;
/// use ksef_core::sign::HolderCredentials;
///
/// # async fn run(cert_pem: &str, key_pem: &str) -> Result<(), ksef_core::Error> {
/// let credentials = HolderCredentials::from_pem(cert_pem, key_pem)?;
/// let identity = ClientIdentity::new(ContextIdentifier::Nip("1234567890".into()), credentials)?;
/// let mut client = KsefClient::new(Config::default(), identity)?;
/// client.authenticate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct KsefClient {
    config: Config,
    client: Client,
    base_url: Url,
    identity: ClientIdentity,
    xml_signer: Box<dyn XmlSigner>,
    token: Option<BearerToken>,
    cancel: CancellationToken,
}

impl KsefClient {
    pub fn new(config: Config, identity: ClientIdentity) -> Result<Self, KsefError> {
        let base_url = Url::parse(config.base_url())
            .map_err(|e| KsefError::InvalidBaseUrl(format!("{}: {e}", config.base_url())))?;
        if base_url.cannot_be_a_base() {
            return Err(KsefError::InvalidBaseUrl(config.base_url().to_string()));
        }
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            config,
            client,
            base_url,
            identity,
            xml_signer: Box::new(EnvelopedSigner::new()),
            token: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Replace the XML signature backend used during authentication.
    pub fn with_xml_signer(mut self, signer: impl XmlSigner + 'static) -> Self {
        self.xml_signer = Box::new(signer);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn token(&self) -> Option<&BearerToken> {
        self.token.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }
}

// Private API
impl KsefClient {
    /// Base URL joined with `segments`, each percent-encoded as one path segment.
    fn build_endpoint(&self, segments: &[&str]) -> Result<Url, KsefError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| KsefError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn bearer(&self) -> Result<&str, KsefError> {
        self.token
            .as_ref()
            .map(BearerToken::as_str)
            .ok_or(KsefError::Unauthenticated)
    }

    /// Send the request and read the whole body, racing the cancellation token.
    async fn execute(&self, request: RequestBuilder) -> Result<(StatusCode, String), KsefError> {
        let request = request.build()?;
        let traced = self
            .config
            .debug()
            .then(|| (request.method().clone(), request.url().clone()));
        if let Some((method, url)) = &traced {
            let body = request
                .body()
                .and_then(|body| body.as_bytes())
                .map(|bytes| redact(&String::from_utf8_lossy(bytes)))
                .unwrap_or_default();
            debug!(target: "ksef_core::http", %method, %url, body = %body, "request");
        }
        let exchange = async {
            let response = self.client.execute(request).await?;
            let status = response.status();
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, body))
        };
        let (status, body) = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(KsefError::Cancelled),
            result = exchange => result?,
        };
        if let Some((method, url)) = &traced {
            debug!(
                target: "ksef_core::http",
                %method,
                %url,
                status = status.as_u16(),
                body = %redact(&body),
                "response"
            );
        }
        Ok((status, body))
    }

    fn reject(status: StatusCode, body: &str) -> KsefError {
        let rejection = ServerRejection::from_body(status, body);
        if status == StatusCode::UNAUTHORIZED {
            KsefError::Unauthorized(rejection)
        } else {
            KsefError::ServerRejected(rejection)
        }
    }

    async fn exchange<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, KsefError> {
        let (status, body) = self.execute(request.header("Accept", "application/json")).await?;
        if status.is_success() {
            return serde_json::from_str::<T>(&body)
                .map_err(|e| KsefError::InvalidResponse(format!("status {status}: {e}")));
        }
        Err(Self::reject(status, &body))
    }

    /// Like [`exchange`](Self::exchange) for endpoints whose success body carries
    /// nothing the caller needs.
    async fn exchange_empty(&self, request: RequestBuilder) -> Result<(), KsefError> {
        let (status, body) = self.execute(request).await?;
        if status.is_success() {
            return Ok(());
        }
        Err(Self::reject(status, &body))
    }
}

/// Body text for traces, with every JSON string under a `*token*` key masked.
fn redact(body: &str) -> String {
    fn mask(value: &mut serde_json::Value) {
        match value {
            serde_json::Value::Object(map) => {
                for (key, value) in map.iter_mut() {
                    if key.to_ascii_lowercase().contains("token") && value.is_string() {
                        *value = serde_json::Value::from("***");
                    } else {
                        mask(value);
                    }
                }
            }
            serde_json::Value::Array(items) => items.iter_mut().for_each(mask),
            _ => {}
        }
    }
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(mut json) => {
            mask(&mut json);
            json.to_string()
        }
        Err(_) => body.to_string(),
    }
}

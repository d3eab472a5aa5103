//! Encrypted batch-upload sessions.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info, warn};

use super::{KsefClient, KsefError, StatusInfo, ValidationError};
use crate::{
    config::FormCode,
    encryption::{sha256_base64, EncryptionError, SessionKey},
    poll::PollOutcome,
};
use base64ct::{Base64, Encoding};

/// Lifecycle of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Accepting invoices.
    Open,
    /// Closed by the caller; the Registry is processing the batch.
    Closed,
    /// The Registry reported a terminal batch status.
    Resolved,
    /// Given up on, e.g. because the session expired before resolving.
    Abandoned,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Open => "open",
            SessionState::Closed => "closed",
            SessionState::Resolved => "resolved",
            SessionState::Abandoned => "abandoned",
        })
    }
}

/// Client-side handle of a Registry upload session. Holds the session key, which
/// never leaves the process.
#[derive(Debug)]
pub struct UploadSession {
    reference_number: String,
    valid_until: DateTime<Utc>,
    key: SessionKey,
    state: SessionState,
    uploaded: u32,
    ordinals_used: u32,
}

impl UploadSession {
    pub fn reference_number(&self) -> &str {
        &self.reference_number
    }

    pub fn valid_until(&self) -> DateTime<Utc> {
        self.valid_until
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of invoices the Registry accepted so far.
    pub fn uploaded(&self) -> u32 {
        self.uploaded
    }

    /// Ordinal given to the most recent upload attempt, accepted or not. Each
    /// attempt takes a fresh ordinal so no nonce is ever reused under the key.
    pub fn last_ordinal(&self) -> u32 {
        self.ordinals_used
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.valid_until
    }

    fn take_ordinal(&mut self) -> Result<u32, KsefError> {
        let ordinal = self
            .ordinals_used
            .checked_add(1)
            .ok_or(EncryptionError::OrdinalsExhausted)?;
        self.ordinals_used = ordinal;
        Ok(ordinal)
    }

    fn expired(&self) -> KsefError {
        KsefError::SessionExpired {
            reference_number: self.reference_number.clone(),
            valid_until: self.valid_until,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OpenSessionRequest<'a> {
    form_code: &'a FormCode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenSessionResponse {
    reference_number: String,
    valid_until: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendInvoiceRequest {
    ordinal_number: u32,
    invoice_hash: String,
    invoice_size: usize,
    encrypted_invoice_hash: String,
    encrypted_invoice_size: usize,
    encrypted_invoice_content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendInvoiceResponse {
    reference_number: String,
}

/// Batch processing status of a session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatus {
    status: StatusInfo,
    #[serde(default)]
    invoice_count: u32,
    #[serde(default)]
    successful_invoice_count: u32,
    #[serde(default)]
    failed_invoice_count: u32,
}

impl BatchStatus {
    pub fn status(&self) -> &StatusInfo {
        &self.status
    }

    pub fn invoice_count(&self) -> u32 {
        self.invoice_count
    }

    pub fn successful_count(&self) -> u32 {
        self.successful_invoice_count
    }

    pub fn failed_count(&self) -> u32 {
        self.failed_invoice_count
    }

    /// 200 means processed, 400 and above means processing failed for good.
    pub fn is_terminal(&self) -> bool {
        let code = self.status.code();
        code == 200 || code >= 400
    }
}

/// Per-invoice processing result.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedInvoiceRecord {
    ordinal_number: u32,
    reference_number: String,
    #[serde(default)]
    ksef_number: Option<String>,
    #[serde(default)]
    invoice_hash: Option<String>,
    #[serde(default)]
    invoicing_date: Option<DateTime<Utc>>,
    status: StatusInfo,
}

impl UploadedInvoiceRecord {
    pub fn ordinal_number(&self) -> u32 {
        self.ordinal_number
    }

    pub fn reference_number(&self) -> &str {
        &self.reference_number
    }

    pub fn ksef_number(&self) -> Option<&str> {
        self.ksef_number.as_deref()
    }

    pub fn invoice_hash(&self) -> Option<&str> {
        self.invoice_hash.as_deref()
    }

    pub fn invoicing_date(&self) -> Option<DateTime<Utc>> {
        self.invoicing_date
    }

    pub fn status(&self) -> &StatusInfo {
        &self.status
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvoicePage {
    #[serde(default)]
    invoices: Vec<UploadedInvoiceRecord>,
    #[serde(default)]
    continuation_token: Option<String>,
}

const CONTINUATION_HEADER: &str = "x-continuation-token";

impl KsefClient {
    /// Open a new upload session with a freshly generated session key.
    pub async fn create_session(&self) -> Result<UploadSession, KsefError> {
        let token = self.bearer()?;
        let payload = OpenSessionRequest {
            form_code: self.config.form_code(),
        };
        let url = self.build_endpoint(&["sessions"])?;
        let response: OpenSessionResponse = self
            .exchange(self.client.post(url).bearer_auth(token).json(&payload))
            .await?;
        info!(
            reference_number = %response.reference_number,
            valid_until = %response.valid_until,
            "upload session opened"
        );
        Ok(UploadSession {
            reference_number: response.reference_number,
            valid_until: response.valid_until,
            key: SessionKey::generate(),
            state: SessionState::Open,
            uploaded: 0,
            ordinals_used: 0,
        })
    }

    /// Encrypt and upload one invoice; returns the invoice reference number.
    ///
    /// # Errors
    /// Session state, expiry and payload size are checked before anything is
    /// sent: [`KsefError::SessionNotOpen`], [`KsefError::SessionExpired`] and
    /// [`ValidationError::PayloadTooLarge`]. Once encryption starts the ordinal
    /// is spent; a failed send is retried under the next one.
    pub async fn upload_invoice(
        &self,
        session: &mut UploadSession,
        invoice: &[u8],
    ) -> Result<String, KsefError> {
        if session.state != SessionState::Open {
            return Err(KsefError::SessionNotOpen(session.state));
        }
        if session.is_expired_at(Utc::now()) {
            return Err(session.expired());
        }
        let limit = self.config.max_invoice_size();
        if invoice.len() > limit {
            return Err(ValidationError::PayloadTooLarge {
                size: invoice.len(),
                limit,
            }
            .into());
        }
        let token = self.bearer()?;

        let ordinal = session.take_ordinal()?;
        let encrypted = session.key.encrypt(ordinal, invoice)?;
        let payload = SendInvoiceRequest {
            ordinal_number: ordinal,
            invoice_hash: sha256_base64(invoice),
            invoice_size: invoice.len(),
            encrypted_invoice_hash: sha256_base64(&encrypted),
            encrypted_invoice_size: encrypted.len(),
            encrypted_invoice_content: Base64::encode_string(&encrypted),
        };
        let url = self.build_endpoint(&["sessions", session.reference_number(), "invoices"])?;
        let response: SendInvoiceResponse = self
            .exchange(self.client.post(url).bearer_auth(token).json(&payload))
            .await?;
        session.uploaded += 1;
        debug!(
            session = %session.reference_number,
            ordinal,
            reference_number = %response.reference_number,
            "invoice uploaded"
        );
        Ok(response.reference_number)
    }

    /// Close the session; the Registry starts processing the batch.
    pub async fn finish_upload(&self, session: &mut UploadSession) -> Result<(), KsefError> {
        if session.state != SessionState::Open {
            return Err(KsefError::SessionNotOpen(session.state));
        }
        let token = self.bearer()?;
        let url = self.build_endpoint(&["sessions", session.reference_number(), "close"])?;
        self.exchange_empty(self.client.post(url).bearer_auth(token))
            .await?;
        session.state = SessionState::Closed;
        info!(
            session = %session.reference_number,
            invoices = session.uploaded,
            "upload session closed"
        );
        Ok(())
    }

    async fn fetch_session_status(&self, reference_number: &str) -> Result<BatchStatus, KsefError> {
        let token = self.bearer()?;
        let url = self.build_endpoint(&["sessions", reference_number, "status"])?;
        self.exchange(self.client.get(url).bearer_auth(token)).await
    }

    /// Single status check of a closed session. A terminal status resolves it.
    pub async fn session_status(&self, session: &mut UploadSession) -> Result<BatchStatus, KsefError> {
        ensure_closed(session)?;
        let status = self.fetch_session_status(&session.reference_number).await?;
        if status.is_terminal() {
            session.state = SessionState::Resolved;
        }
        Ok(status)
    }

    /// Poll the batch status with the configured batch policy until it turns
    /// terminal. Unbounded by default; stops with [`KsefError::SessionExpired`]
    /// and abandons the session once its validity has passed.
    pub async fn await_processing(&self, session: &mut UploadSession) -> Result<BatchStatus, KsefError> {
        ensure_closed(session)?;
        let policy = *self.config.batch_polling();
        let reference_number = session.reference_number.as_str();
        let valid_until = session.valid_until;
        let result = policy
            .run(&self.cancel, move |attempt| async move {
                let status = self.fetch_session_status(reference_number).await?;
                debug!(
                    session = reference_number,
                    attempt,
                    code = status.status().code(),
                    "batch status"
                );
                if status.is_terminal() {
                    return Ok(PollOutcome::Ready(status));
                }
                if Utc::now() >= valid_until {
                    return Err(KsefError::SessionExpired {
                        reference_number: reference_number.to_string(),
                        valid_until,
                    });
                }
                Ok(PollOutcome::Pending)
            })
            .await
            .map_err(KsefError::from);
        match result {
            Ok(status) => {
                session.state = SessionState::Resolved;
                info!(
                    session = %session.reference_number,
                    code = status.status().code(),
                    successful = status.successful_count(),
                    failed = status.failed_count(),
                    "batch processing resolved"
                );
                Ok(status)
            }
            Err(err) => {
                if matches!(err, KsefError::SessionExpired { .. }) {
                    session.state = SessionState::Abandoned;
                    warn!(session = %session.reference_number, "session expired before processing resolved");
                }
                Err(err)
            }
        }
    }

    /// Invoices of a resolved session that were assigned a KSeF number.
    pub async fn list_uploaded_invoices(
        &self,
        session: &UploadSession,
    ) -> Result<Vec<UploadedInvoiceRecord>, KsefError> {
        let records = self
            .session_invoices(session, &["sessions", session.reference_number(), "invoices"])
            .await?;
        Ok(records
            .into_iter()
            .filter(|record| record.ksef_number().is_some_and(|n| !n.is_empty()))
            .collect())
    }

    /// Invoices of a resolved session that the Registry rejected, with diagnostics.
    pub async fn list_failed_uploads(
        &self,
        session: &UploadSession,
    ) -> Result<Vec<UploadedInvoiceRecord>, KsefError> {
        self.session_invoices(
            session,
            &["sessions", session.reference_number(), "invoices", "failed"],
        )
        .await
    }

    async fn session_invoices(
        &self,
        session: &UploadSession,
        segments: &[&str],
    ) -> Result<Vec<UploadedInvoiceRecord>, KsefError> {
        if session.state != SessionState::Resolved {
            return Err(KsefError::SessionNotResolved(session.state));
        }
        let token = self.bearer()?;
        let url = self.build_endpoint(segments)?;
        let mut records = Vec::new();
        let mut continuation: Option<String> = None;
        let mut seen = HashSet::new();
        loop {
            let mut request = self.client.get(url.clone()).bearer_auth(token);
            if let Some(next) = continuation.as_deref() {
                request = request.header(CONTINUATION_HEADER, next);
            }
            let page: InvoicePage = self.exchange(request).await?;
            records.extend(page.invoices);
            match page.continuation_token {
                Some(next) if !next.is_empty() => {
                    if !seen.insert(next.clone()) {
                        return Err(KsefError::InvalidResponse(format!(
                            "continuation token {next} repeated while listing session invoices"
                        )));
                    }
                    continuation = Some(next);
                }
                _ => break,
            }
        }
        Ok(records)
    }
}

fn ensure_closed(session: &UploadSession) -> Result<(), KsefError> {
    match session.state {
        SessionState::Closed | SessionState::Resolved => Ok(()),
        other => Err(KsefError::SessionNotClosed(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(code: i32) -> BatchStatus {
        BatchStatus {
            status: StatusInfo::new(code, "x"),
            invoice_count: 0,
            successful_invoice_count: 0,
            failed_invoice_count: 0,
        }
    }

    #[test]
    fn terminal_codes() {
        assert!(!batch(100).is_terminal());
        assert!(!batch(150).is_terminal());
        assert!(batch(200).is_terminal());
        assert!(!batch(300).is_terminal());
        assert!(batch(400).is_terminal());
        assert!(batch(445).is_terminal());
    }

    #[test]
    fn invoice_page_parses_records() {
        let body = r#"{
          "continuationToken": "abc",
          "invoices": [{
            "ordinalNumber": 1,
            "referenceNumber": "20250101-EE-1",
            "ksefNumber": "1234567890-20250101-ABCDEF-01",
            "invoiceHash": "mkht+3m5trnfxlTYhq3QFn74LkEO69MFNlsMAkCDSPA=",
            "invoicingDate": "2025-01-01T10:00:00+00:00",
            "status": {"code": 200, "description": "Sukces"}
          }]
        }"#;
        let page: InvoicePage = serde_json::from_str(body).unwrap();
        assert_eq!(page.continuation_token.as_deref(), Some("abc"));
        let record = &page.invoices[0];
        assert_eq!(record.ordinal_number(), 1);
        assert_eq!(record.ksef_number(), Some("1234567890-20250101-ABCDEF-01"));
        assert_eq!(record.status().code(), 200);
    }

    #[test]
    fn session_expiry_is_inclusive() {
        let now = Utc::now();
        let session = UploadSession {
            reference_number: "ref".into(),
            valid_until: now,
            key: SessionKey::generate(),
            state: SessionState::Open,
            uploaded: 0,
            ordinals_used: 0,
        };
        assert!(session.is_expired_at(now));
        assert!(!session.is_expired_at(now - chrono::Duration::seconds(1)));
    }
}

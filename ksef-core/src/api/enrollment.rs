//! Certificate enrollment, retrieval and revocation.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use tracing::{debug, info, warn};

use super::{KsefClient, KsefError, StatusInfo, ValidationError};
use crate::{csr::CertificateEnrollmentData, poll::PollOutcome};

/// Registry status code of a request still being processed.
pub const STATUS_PENDING: i32 = 100;
/// Registry status code of a successfully completed request.
pub const STATUS_SUCCESS: i32 = 200;

/// Purpose a certificate is issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CertificateType {
    /// Authenticates the holder against the Registry.
    Authentication,
    /// Signs QR codes of invoices issued in offline mode.
    Offline,
}

impl CertificateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertificateType::Authentication => "Authentication",
            CertificateType::Offline => "Offline",
        }
    }
}

impl fmt::Display for CertificateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CertificateType {
    type Err = ValidationError;
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "authentication" => Ok(CertificateType::Authentication),
            "offline" => Ok(CertificateType::Offline),
            _ => Err(ValidationError::InvalidCertificateType(value.to_string())),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnrollmentRequest<'a> {
    certificate_name: &'a str,
    certificate_type: CertificateType,
    csr: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    valid_from: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnrollmentResponse {
    reference_number: String,
}

/// State of a submitted enrollment request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentStatus {
    #[serde(default)]
    request_date: Option<DateTime<Utc>>,
    status: StatusInfo,
    #[serde(default)]
    certificate_serial_number: Option<String>,
}

impl EnrollmentStatus {
    pub fn request_date(&self) -> Option<DateTime<Utc>> {
        self.request_date
    }

    pub fn status(&self) -> &StatusInfo {
        &self.status
    }

    pub fn certificate_serial_number(&self) -> Option<&str> {
        self.certificate_serial_number.as_deref()
    }

    pub fn is_pending(&self) -> bool {
        self.status.code() == STATUS_PENDING
    }
}

/// Decide what one enrollment status check means for the waiting caller.
pub(crate) fn classify_enrollment(
    status: EnrollmentStatus,
) -> Result<PollOutcome<EnrollmentStatus>, KsefError> {
    match status.status.code() {
        STATUS_SUCCESS => {
            if status.certificate_serial_number().map_or(true, str::is_empty) {
                return Err(KsefError::InvalidResponse(
                    "enrollment succeeded without a certificate serial number".into(),
                ));
            }
            Ok(PollOutcome::Ready(status))
        }
        STATUS_PENDING => Ok(PollOutcome::Pending),
        code => Err(KsefError::TerminalFailure {
            code,
            description: status.status.description().to_string(),
        }),
    }
}

/// Issued certificate as returned by `POST /certificates/retrieve`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedCertificate {
    /// Base64 DER.
    pub certificate: String,
    pub certificate_name: String,
    pub certificate_serial_number: String,
    pub certificate_type: CertificateType,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveRequest<'a> {
    certificate_serial_numbers: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveResponse {
    #[serde(default)]
    certificates: Vec<RetrievedCertificate>,
}

impl KsefClient {
    /// Subject data the Registry wants in the CSR for the authenticated identity.
    pub async fn fetch_enrollment_data(&self) -> Result<CertificateEnrollmentData, KsefError> {
        let token = self.bearer()?;
        let url = self.build_endpoint(&["certificates", "enrollments", "data"])?;
        self.exchange(self.client.get(url).bearer_auth(token)).await
    }

    /// Submit a CSR and return the enrollment reference number.
    pub async fn submit_enrollment(
        &self,
        certificate_name: &str,
        certificate_type: CertificateType,
        csr: &str,
        valid_from: Option<DateTime<Utc>>,
    ) -> Result<String, KsefError> {
        if certificate_name.trim().is_empty() {
            return Err(ValidationError::MissingRequiredField("certificateName").into());
        }
        if csr.trim().is_empty() {
            return Err(ValidationError::MissingCsr.into());
        }
        let token = self.bearer()?;
        let payload = EnrollmentRequest {
            certificate_name,
            certificate_type,
            csr,
            valid_from,
        };
        let url = self.build_endpoint(&["certificates", "enrollments"])?;
        let response: EnrollmentResponse = self
            .exchange(self.client.post(url).bearer_auth(token).json(&payload))
            .await?;
        info!(
            reference_number = %response.reference_number,
            certificate_type = %certificate_type,
            "certificate enrollment submitted"
        );
        Ok(response.reference_number)
    }

    /// Single status check of an enrollment request.
    pub async fn enrollment_status(&self, reference_number: &str) -> Result<EnrollmentStatus, KsefError> {
        let token = self.bearer()?;
        let url = self.build_endpoint(&["certificates", "enrollments", reference_number])?;
        self.exchange(self.client.get(url).bearer_auth(token)).await
    }

    /// Poll an enrollment until it succeeds, fails, or the configured attempt
    /// budget runs out. The returned status always carries a serial number.
    pub async fn await_enrollment(&self, reference_number: &str) -> Result<EnrollmentStatus, KsefError> {
        let policy = *self.config.enrollment_polling();
        let result = policy
            .run(&self.cancel, move |attempt| async move {
                let status = self.enrollment_status(reference_number).await?;
                debug!(
                    reference_number,
                    attempt,
                    code = status.status().code(),
                    "enrollment status"
                );
                classify_enrollment(status)
            })
            .await;
        match result {
            Ok(status) => {
                info!(
                    reference_number,
                    serial = status.certificate_serial_number().unwrap_or_default(),
                    "certificate enrolled"
                );
                Ok(status)
            }
            Err(err) => {
                let err = KsefError::from(err);
                warn!(reference_number, error = %err, "certificate enrollment did not complete");
                Err(err)
            }
        }
    }

    /// Fetch the issued certificate by serial number. Exactly one match is required.
    pub async fn retrieve_certificate(&self, serial_number: &str) -> Result<RetrievedCertificate, KsefError> {
        if serial_number.trim().is_empty() {
            return Err(ValidationError::MissingRequiredField("certificateSerialNumber").into());
        }
        let token = self.bearer()?;
        let payload = RetrieveRequest {
            certificate_serial_numbers: [serial_number],
        };
        let url = self.build_endpoint(&["certificates", "retrieve"])?;
        let response: RetrieveResponse = self
            .exchange(self.client.post(url).bearer_auth(token).json(&payload))
            .await?;
        let mut certificates = response.certificates;
        if certificates.len() != 1 {
            return Err(KsefError::AmbiguousOrMissingCertificate {
                found: certificates.len(),
            });
        }
        Ok(certificates.remove(0))
    }

    /// Revoke a certificate. Single attempt.
    pub async fn revoke_certificate(&self, serial_number: &str) -> Result<(), KsefError> {
        if serial_number.trim().is_empty() {
            return Err(ValidationError::MissingRequiredField("certificateSerialNumber").into());
        }
        let token = self.bearer()?;
        let url = self.build_endpoint(&["certificates", serial_number, "revoke"])?;
        self.exchange_empty(self.client.post(url).bearer_auth(token))
            .await?;
        info!(serial = serial_number, "certificate revoked");
        Ok(())
    }

    /// Fetch data, build the CSR, submit, wait, retrieve. The first failing step
    /// aborts the sequence and its error is returned unchanged; a submitted
    /// request is not withdrawn.
    pub async fn create_certificate(
        &self,
        certificate_name: &str,
        certificate_type: CertificateType,
        key: &p256::ecdsa::SigningKey,
        valid_from: Option<DateTime<Utc>>,
    ) -> Result<RetrievedCertificate, KsefError> {
        let data = self.fetch_enrollment_data().await?;
        let csr = data.generate_csr(key)?;
        let reference_number = self
            .submit_enrollment(certificate_name, certificate_type, &csr, valid_from)
            .await?;
        let status = self.await_enrollment(&reference_number).await?;
        let serial = status
            .certificate_serial_number()
            .ok_or_else(|| KsefError::InvalidResponse("missing certificate serial number".into()))?;
        self.retrieve_certificate(serial).await
    }
}

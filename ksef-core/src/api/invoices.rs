//! Invoice search by metadata and download by KSeF number.
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{KsefClient, KsefError, ValidationError};

/// Results requested per metadata page; the Registry caps it at 250.
const PAGE_SIZE: u32 = 100;

/// Role the authenticated context plays on the invoices searched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvoiceSubjectType {
    /// Issued by the context, as seller.
    #[serde(rename = "Subject1")]
    Supplier,
    /// Received by the context, as buyer.
    #[serde(rename = "Subject2")]
    Customer,
    /// The context appears as a third party (factor, recipient, payer).
    #[serde(rename = "Subject3")]
    ThirdParty,
    #[serde(rename = "SubjectAuthorized")]
    Authorized,
}

/// Which date the search range applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InvoiceDateType {
    Issue,
    #[default]
    Invoicing,
    PermanentStorage,
}

/// Search criteria for [`KsefClient::list_invoices`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListInvoicesParams {
    pub subject_type: InvoiceSubjectType,
    pub from: DateTime<Utc>,
    /// Open-ended when absent.
    pub to: Option<DateTime<Utc>>,
    pub date_type: InvoiceDateType,
}

impl ListInvoicesParams {
    pub fn new(subject_type: InvoiceSubjectType, from: DateTime<Utc>) -> Self {
        Self {
            subject_type,
            from,
            to: None,
            date_type: InvoiceDateType::default(),
        }
    }

    pub fn with_to(mut self, to: DateTime<Utc>) -> Self {
        self.to = Some(to);
        self
    }

    pub fn with_date_type(mut self, date_type: InvoiceDateType) -> Self {
        self.date_type = date_type;
        self
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest {
    subject_type: InvoiceSubjectType,
    date_range: DateRange,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DateRange {
    date_type: InvoiceDateType,
    from: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    to: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    invoices: Vec<InvoiceMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InvoiceParty {
    #[serde(default)]
    pub nip: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// One search hit. Amounts are kept as the decimal text the Registry sent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceMetadata {
    ksef_number: String,
    #[serde(default)]
    invoice_number: String,
    #[serde(default)]
    issue_date: Option<NaiveDate>,
    #[serde(default)]
    invoicing_date: Option<DateTime<Utc>>,
    #[serde(default)]
    seller: Option<InvoiceParty>,
    #[serde(default)]
    gross_amount: Option<serde_json::Number>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    invoice_hash: Option<String>,
}

impl InvoiceMetadata {
    pub fn ksef_number(&self) -> &str {
        &self.ksef_number
    }

    pub fn invoice_number(&self) -> &str {
        &self.invoice_number
    }

    pub fn issue_date(&self) -> Option<NaiveDate> {
        self.issue_date
    }

    pub fn invoicing_date(&self) -> Option<DateTime<Utc>> {
        self.invoicing_date
    }

    pub fn seller(&self) -> Option<&InvoiceParty> {
        self.seller.as_ref()
    }

    pub fn gross_amount(&self) -> Option<&serde_json::Number> {
        self.gross_amount.as_ref()
    }

    pub fn currency(&self) -> Option<&str> {
        self.currency.as_deref()
    }

    pub fn invoice_hash(&self) -> Option<&str> {
        self.invoice_hash.as_deref()
    }
}

impl KsefClient {
    /// Metadata of every invoice matching `params`, following pages until the
    /// Registry reports no more.
    pub async fn list_invoices(
        &self,
        params: &ListInvoicesParams,
    ) -> Result<Vec<InvoiceMetadata>, KsefError> {
        if params.to.is_some_and(|to| to < params.from) {
            return Err(ValidationError::InvalidDateRange.into());
        }
        let token = self.bearer()?;
        let payload = QueryRequest {
            subject_type: params.subject_type,
            date_range: DateRange {
                date_type: params.date_type,
                from: params.from,
                to: params.to,
            },
        };

        let mut invoices = Vec::new();
        let mut page_offset = 0u32;
        loop {
            let mut url = self.build_endpoint(&["invoices", "query", "metadata"])?;
            url.query_pairs_mut()
                .append_pair("pageOffset", &page_offset.to_string())
                .append_pair("pageSize", &PAGE_SIZE.to_string());
            let page: QueryResponse = self
                .exchange(self.client.post(url).bearer_auth(token).json(&payload))
                .await?;
            debug!(page_offset, hits = page.invoices.len(), has_more = page.has_more, "invoice metadata page");
            if page.has_more && page.invoices.is_empty() {
                return Err(KsefError::InvalidResponse(format!(
                    "invoice metadata page {page_offset} is empty but more were promised"
                )));
            }
            invoices.extend(page.invoices);
            if !page.has_more {
                break;
            }
            page_offset += 1;
        }
        info!(count = invoices.len(), "invoice metadata listed");
        Ok(invoices)
    }

    /// The invoice XML exactly as stored by the Registry.
    pub async fn get_invoice(&self, ksef_number: &str) -> Result<Vec<u8>, KsefError> {
        if ksef_number.trim().is_empty() {
            return Err(ValidationError::MissingRequiredField("ksefNumber").into());
        }
        let token = self.bearer()?;
        let url = self.build_endpoint(&["invoices", "ksef", ksef_number])?;
        let (status, body) = self
            .execute(
                self.client
                    .get(url)
                    .bearer_auth(token)
                    .header("Accept", "application/xml"),
            )
            .await?;
        if !status.is_success() {
            return Err(Self::reject(status, &body));
        }
        debug!(ksef_number, bytes = body.len(), "invoice downloaded");
        Ok(body.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_serializes_registry_names() {
        let from = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let payload = QueryRequest {
            subject_type: InvoiceSubjectType::Supplier,
            date_range: DateRange {
                date_type: InvoiceDateType::Invoicing,
                from,
                to: None,
            },
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["subjectType"], "Subject1");
        assert_eq!(json["dateRange"]["dateType"], "Invoicing");
        assert!(json["dateRange"].get("to").is_none());
    }

    #[test]
    fn metadata_parses_with_sparse_fields() {
        let hit: InvoiceMetadata = serde_json::from_str(
            r#"{"ksefNumber":"8126178616-20260117-010020CE337D-CD","invoiceNumber":"FV/1/2026","issueDate":"2026-01-17","grossAmount":123.45,"seller":{"nip":"8126178616"},"unknown":true}"#,
        )
        .unwrap();
        assert_eq!(hit.ksef_number(), "8126178616-20260117-010020CE337D-CD");
        assert_eq!(hit.issue_date(), NaiveDate::from_ymd_opt(2026, 1, 17));
        assert_eq!(hit.gross_amount().map(ToString::to_string).as_deref(), Some("123.45"));
        assert_eq!(hit.seller().and_then(|s| s.nip.as_deref()), Some("8126178616"));
        assert!(hit.currency().is_none());
    }
}

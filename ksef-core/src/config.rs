//! Configuration and environment selection.
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};
use thiserror::Error;

use crate::poll::RetryPolicy;

/// KSeF environment selection.
/// This determines both the API base URL used by the client and the host embedded in
/// QR verification URLs.
/// - Test: the open integration environment, accepts self-issued test certificates.
/// - Demo: the pre-production environment mirroring production rules.
/// - Production: the live Registry.
/// # Examples
/// ```rust
/// use std::str::FromStr;
/// use ksef_core::config::EnvironmentType;
///
/// let env = EnvironmentType::from_str("demo")?;
/// assert_eq!(env, EnvironmentType::Demo);
/// # Ok::<(), ksef_core::config::EnvironmentParseError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvironmentType {
    Test,
    Demo,
    Production,
}

/// Error returned when parsing an [`EnvironmentType`] from a string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentParseError {
    #[error("invalid environment type: {input}")]
    Invalid { input: String },
}

impl FromStr for EnvironmentType {
    type Err = EnvironmentParseError;
    fn from_str(env: &str) -> Result<EnvironmentType, EnvironmentParseError> {
        match env.to_ascii_lowercase().as_str() {
            "test" => Ok(EnvironmentType::Test),
            "demo" => Ok(EnvironmentType::Demo),
            "production" => Ok(EnvironmentType::Production),
            _ => Err(EnvironmentParseError::Invalid {
                input: env.to_string(),
            }),
        }
    }
}

impl EnvironmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentType::Test => "test",
            EnvironmentType::Demo => "demo",
            EnvironmentType::Production => "production",
        }
    }

    pub fn endpoint_url(&self) -> &'static str {
        match self {
            EnvironmentType::Test => "https://ksef-test.mf.gov.pl/api/v2/",
            EnvironmentType::Demo => "https://ksef-demo.mf.gov.pl/api/v2/",
            EnvironmentType::Production => "https://ksef.mf.gov.pl/api/v2/",
        }
    }

    /// Host name used in invoice and certificate verification URLs.
    pub fn qr_host(&self) -> &'static str {
        match self {
            EnvironmentType::Test => "qr-test.ksef.mf.gov.pl",
            EnvironmentType::Demo => "qr-demo.ksef.mf.gov.pl",
            EnvironmentType::Production => "qr.ksef.mf.gov.pl",
        }
    }
}

/// Invoice schema the upload session is opened for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormCode {
    pub system_code: String,
    pub schema_version: String,
    pub value: String,
}

impl Default for FormCode {
    fn default() -> Self {
        Self {
            system_code: "FA (3)".into(),
            schema_version: "1-0E".into(),
            value: "FA".into(),
        }
    }
}

/// Largest plaintext invoice the Registry accepts without attachments.
pub const DEFAULT_MAX_INVOICE_SIZE: usize = 1_000_000;

/// Configuration for the API client.
///
/// # Examples
/// ```rust
/// use std::time::Duration;
/// use ksef_core::config::{Config, EnvironmentType};
///
/// let config = Config::new(EnvironmentType::Test).with_timeout(Duration::from_secs(10));
/// assert_eq!(config.env(), EnvironmentType::Test);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    env: EnvironmentType,
    base_url: Option<String>,
    timeout: Duration,
    enrollment_polling: RetryPolicy,
    batch_polling: RetryPolicy,
    max_invoice_size: usize,
    form_code: FormCode,
    debug: bool,
}

impl Config {
    pub fn new(env: EnvironmentType) -> Self {
        Self {
            env,
            base_url: None,
            timeout: Duration::from_secs(30),
            enrollment_polling: RetryPolicy::enrollment(),
            batch_polling: RetryPolicy::batch(),
            max_invoice_size: DEFAULT_MAX_INVOICE_SIZE,
            form_code: FormCode::default(),
            debug: false,
        }
    }

    /// Point the client at a different API root, e.g. a mock server.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let value = base_url.into();
        self.base_url = Some(if value.ends_with('/') {
            value
        } else {
            format!("{value}/")
        });
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_enrollment_polling(mut self, policy: RetryPolicy) -> Self {
        self.enrollment_polling = policy;
        self
    }

    pub fn with_batch_polling(mut self, policy: RetryPolicy) -> Self {
        self.batch_polling = policy;
        self
    }

    pub fn with_max_invoice_size(mut self, bytes: usize) -> Self {
        self.max_invoice_size = bytes;
        self
    }

    pub fn with_form_code(mut self, form_code: FormCode) -> Self {
        self.form_code = form_code;
        self
    }

    /// Trace every request and response (method, URL, status, body) at `debug`
    /// level under the `ksef_core::http` target. Bearer tokens are redacted.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn env(&self) -> EnvironmentType {
        self.env
    }

    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.env.endpoint_url())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn enrollment_polling(&self) -> &RetryPolicy {
        &self.enrollment_polling
    }

    pub fn batch_polling(&self) -> &RetryPolicy {
        &self.batch_polling
    }

    pub fn max_invoice_size(&self) -> usize {
        self.max_invoice_size
    }

    pub fn form_code(&self) -> &FormCode {
        &self.form_code
    }

    pub fn debug(&self) -> bool {
        self.debug
    }
}

// static function to get default config
impl Default for Config {
    fn default() -> Self {
        Config::new(EnvironmentType::Test)
    }
}

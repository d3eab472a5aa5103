//! Rust client for the Polish National e-Invoice System (KSeF): authentication,
//! certificate enrollment, encrypted batch uploads and QR verification URLs.
//!
//! # Examples
//! ```rust
//! use ksef_core::config::{Config, EnvironmentType};
//!
//! let config = Config::new(EnvironmentType::Test);
//! # let _ = config;
//! ```
pub mod api;
pub mod config;
pub mod csr;
pub mod encryption;
pub mod pkcs12;
pub mod poll;
pub mod qr;
pub mod sign;

use thiserror::Error;

pub use api::{ClientIdentity, ContextIdentifier, KsefClient, KsefError, ValidationError};
pub use config::{Config, EnvironmentParseError, EnvironmentType};
pub use csr::CsrError;
pub use pkcs12::Pkcs12Error;
pub use qr::QrError;
pub use sign::{HolderCredentials, SigningError, SigningKey};

/// Top-level error wrapper for core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Api(#[from] api::KsefError),
    #[error(transparent)]
    Signing(#[from] sign::SigningError),
    #[error(transparent)]
    Csr(#[from] csr::CsrError),
    #[error(transparent)]
    Pkcs12(#[from] pkcs12::Pkcs12Error),
    #[error(transparent)]
    Qr(#[from] qr::QrError),
    #[error(transparent)]
    Encryption(#[from] encryption::EncryptionError),
    #[error(transparent)]
    Environment(#[from] config::EnvironmentParseError),
}

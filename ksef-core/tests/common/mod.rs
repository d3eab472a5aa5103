use base64ct::{Base64, Encoding};
use httpmock::MockServer;
use ksef_core::api::{ClientIdentity, ContextIdentifier, KsefClient};
use ksef_core::config::Config;
use ksef_core::poll::RetryPolicy;
use ksef_core::sign::{HolderCredentials, SigningKey};
use rand::rngs::OsRng;
use std::str::FromStr;
use std::time::Duration;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::der::{Decode, Encode};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::Validity;
use x509_cert::Certificate;

#[allow(dead_code)]
pub const TOKEN: &str = "test-access-token";

/// Certificate for `subject_key`, issued by `issuer` (self-signed when they match).
#[allow(dead_code)]
pub fn issue_certificate(subject_key: &SigningKey, issuer: &p256::ecdsa::SigningKey) -> Certificate {
    let spki_der = subject_key.public_key_der().expect("spki der");
    let spki = SubjectPublicKeyInfoOwned::from_der(&spki_der).expect("spki");
    CertificateBuilder::new(
        Profile::Root,
        SerialNumber::from(42u32),
        Validity::from_now(Duration::from_secs(3600)).expect("validity"),
        Name::from_str("CN=Jan Kowalski,O=Test,C=PL").expect("subject"),
        spki,
        issuer,
    )
    .expect("builder")
    .build::<p256::ecdsa::DerSignature>()
    .expect("certificate")
}

#[allow(dead_code)]
pub fn ec_credentials() -> (HolderCredentials, p256::ecdsa::SigningKey) {
    let key = p256::ecdsa::SigningKey::random(&mut OsRng);
    let signing_key = SigningKey::from(key.clone());
    let cert = issue_certificate(&signing_key, &key);
    (
        HolderCredentials::new(cert, signing_key).expect("credentials"),
        key,
    )
}

/// RSA holder whose certificate is issued by a throwaway P-256 authority.
#[allow(dead_code)]
pub fn rsa_credentials() -> (HolderCredentials, rsa::RsaPrivateKey) {
    let key = rsa::RsaPrivateKey::new(&mut OsRng, 1024).expect("rsa key");
    let signing_key = SigningKey::from(key.clone());
    let authority = p256::ecdsa::SigningKey::random(&mut OsRng);
    let cert = issue_certificate(&signing_key, &authority);
    (
        HolderCredentials::new(cert, signing_key).expect("credentials"),
        key,
    )
}

#[allow(dead_code)]
pub fn certificate_base64(cert: &Certificate) -> String {
    Base64::encode_string(&cert.to_der().expect("cert der"))
}

#[allow(dead_code)]
pub fn nip_identity() -> ClientIdentity {
    let (credentials, _) = ec_credentials();
    ClientIdentity::new(ContextIdentifier::Nip("1234567890".into()), credentials).expect("identity")
}

/// Config pointed at the mock server with zero polling delays.
#[allow(dead_code)]
pub fn mock_config(server: &MockServer) -> Config {
    Config::default()
        .with_base_url(server.base_url())
        .with_enrollment_polling(RetryPolicy::bounded(30, Duration::ZERO))
        .with_batch_polling(RetryPolicy::unbounded(Duration::ZERO))
}

#[allow(dead_code)]
pub fn client(server: &MockServer) -> KsefClient {
    KsefClient::new(mock_config(server), nip_identity()).expect("client")
}

/// Mounts the challenge and token endpoints so `authenticate` succeeds.
#[allow(dead_code)]
pub fn mock_auth(server: &MockServer) {
    server.mock(|when, then| {
        when.method(httpmock::Method::GET).path("/auth/challenge");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"challenge":"20250101-CR-0000000000-0000000000-00","timestamp":"2025-01-01T00:00:00Z"}"#);
    });
    server.mock(|when, then| {
        when.method(httpmock::Method::POST).path("/auth/token");
        then.status(200)
            .header("content-type", "application/json")
            .body(format!(r#"{{"token":"{TOKEN}","validUntil":"2099-01-01T00:00:00Z"}}"#));
    });
}

#[allow(dead_code)]
pub fn try_start_server() -> Option<MockServer> {
    std::panic::catch_unwind(MockServer::start).ok()
}

#[allow(dead_code)]
pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().expect("runtime")
}

mod common;

use httpmock::Method::{GET, POST};
use ksef_core::api::enrollment::CertificateType;
use ksef_core::api::{KsefError, ValidationError};
use ksef_core::config::Config;
use ksef_core::poll::RetryPolicy;
use ksef_core::sign::SigningKey;
use rand::rngs::OsRng;
use std::time::Duration;

const ENROLLMENT_DATA: &str = r#"{
  "commonName": "Jan Kowalski",
  "countryName": "PL",
  "givenName": "Jan",
  "surname": "Kowalski",
  "serialNumber": "TINPL-1234567890",
  "uniqueIdentifier": "d3f1c2a0-0000-4000-8000-000000000001"
}"#;

#[test]
fn await_enrollment_exhausts_exact_attempt_budget() {
    let server = match common::try_start_server() {
        Some(server) => server,
        None => return,
    };
    common::mock_auth(&server);
    let status = server.mock(|when, then| {
        when.method(GET)
            .path("/certificates/enrollments/20250101-EH-PENDING")
            .header("authorization", format!("Bearer {}", common::TOKEN));
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"requestDate":"2025-01-01T00:00:00Z","status":{"code":100,"description":"Wniosek przyjęty do realizacji"}}"#);
    });

    common::runtime().block_on(async {
        let mut client = common::client(&server);
        client.authenticate().await.expect("authenticate");
        let err = client
            .await_enrollment("20250101-EH-PENDING")
            .await
            .expect_err("never completes");
        assert!(matches!(err, KsefError::PollingExhausted { attempts: 30 }));
    });
    status.assert_hits(30);
}

#[test]
fn custom_attempt_budget_is_honored() {
    let server = match common::try_start_server() {
        Some(server) => server,
        None => return,
    };
    common::mock_auth(&server);
    let status = server.mock(|when, then| {
        when.method(GET).path("/certificates/enrollments/REF");
        then.status(200).body(r#"{"status":{"code":100}}"#);
    });

    common::runtime().block_on(async {
        let config = Config::default()
            .with_base_url(server.base_url())
            .with_enrollment_polling(RetryPolicy::bounded(3, Duration::ZERO));
        let mut client =
            ksef_core::KsefClient::new(config, common::nip_identity()).expect("client");
        client.authenticate().await.expect("authenticate");
        assert!(matches!(
            client.await_enrollment("REF").await,
            Err(KsefError::PollingExhausted { attempts: 3 })
        ));
    });
    status.assert_hits(3);
}

#[test]
fn await_enrollment_stops_on_first_terminal_status() {
    let server = match common::try_start_server() {
        Some(server) => server,
        None => return,
    };
    common::mock_auth(&server);
    let success = server.mock(|when, then| {
        when.method(GET).path("/certificates/enrollments/OK");
        then.status(200)
            .body(r#"{"status":{"code":200,"description":"Sukces"},"certificateSerialNumber":"01F20A5D352AE590"}"#);
    });
    let failure = server.mock(|when, then| {
        when.method(GET).path("/certificates/enrollments/BAD");
        then.status(200)
            .body(r#"{"status":{"code":400,"description":"Wniosek odrzucony"}}"#);
    });

    common::runtime().block_on(async {
        let mut client = common::client(&server);
        client.authenticate().await.expect("authenticate");

        let status = client.await_enrollment("OK").await.expect("enrolled");
        assert_eq!(status.certificate_serial_number(), Some("01F20A5D352AE590"));

        match client.await_enrollment("BAD").await {
            Err(KsefError::TerminalFailure { code, description }) => {
                assert_eq!(code, 400);
                assert_eq!(description, "Wniosek odrzucony");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    });
    success.assert_hits(1);
    failure.assert_hits(1);
}

#[test]
fn submit_validates_before_sending() {
    let server = match common::try_start_server() {
        Some(server) => server,
        None => return,
    };
    common::mock_auth(&server);
    let submit = server.mock(|when, then| {
        when.method(POST).path("/certificates/enrollments");
        then.status(202).body(r#"{"referenceNumber":"never"}"#);
    });

    common::runtime().block_on(async {
        let mut client = common::client(&server);
        client.authenticate().await.expect("authenticate");
        assert!(matches!(
            client
                .submit_enrollment("", CertificateType::Authentication, "MIIB", None)
                .await,
            Err(KsefError::Validation(ValidationError::MissingRequiredField("certificateName")))
        ));
        assert!(matches!(
            client
                .submit_enrollment("main", CertificateType::Offline, " ", None)
                .await,
            Err(KsefError::Validation(ValidationError::MissingCsr))
        ));
    });
    submit.assert_hits(0);
}

#[test]
fn retrieve_requires_exactly_one_certificate() {
    let server = match common::try_start_server() {
        Some(server) => server,
        None => return,
    };
    common::mock_auth(&server);
    server.mock(|when, then| {
        when.method(POST)
            .path("/certificates/retrieve")
            .body_contains("NONE");
        then.status(200).body(r#"{"certificates":[]}"#);
    });
    server.mock(|when, then| {
        when.method(POST)
            .path("/certificates/retrieve")
            .body_contains("TWO");
        then.status(200).body(
            r#"{"certificates":[
                {"certificate":"AA==","certificateName":"a","certificateSerialNumber":"TWO","certificateType":"Offline"},
                {"certificate":"AA==","certificateName":"b","certificateSerialNumber":"TWO","certificateType":"Offline"}
            ]}"#,
        );
    });

    common::runtime().block_on(async {
        let mut client = common::client(&server);
        client.authenticate().await.expect("authenticate");
        assert!(matches!(
            client.retrieve_certificate("NONE").await,
            Err(KsefError::AmbiguousOrMissingCertificate { found: 0 })
        ));
        assert!(matches!(
            client.retrieve_certificate("TWO").await,
            Err(KsefError::AmbiguousOrMissingCertificate { found: 2 })
        ));
    });
}

#[test]
fn revoke_is_attempted_once() {
    let server = match common::try_start_server() {
        Some(server) => server,
        None => return,
    };
    common::mock_auth(&server);
    let revoke = server.mock(|when, then| {
        when.method(POST).path("/certificates/01F20A/revoke");
        then.status(500).body("temporarily unavailable");
    });

    common::runtime().block_on(async {
        let mut client = common::client(&server);
        client.authenticate().await.expect("authenticate");
        let err = client.revoke_certificate("01F20A").await.expect_err("server error");
        assert!(matches!(err, KsefError::ServerRejected(ref r) if r.status() == 500));
    });
    revoke.assert_hits(1);
}

#[test]
fn create_certificate_runs_full_enrollment() {
    let server = match common::try_start_server() {
        Some(server) => server,
        None => return,
    };
    common::mock_auth(&server);

    let key = p256::ecdsa::SigningKey::random(&mut OsRng);
    let issued = common::issue_certificate(&SigningKey::from(key.clone()), &key);
    let issued_b64 = common::certificate_base64(&issued);

    let data = server.mock(|when, then| {
        when.method(GET).path("/certificates/enrollments/data");
        then.status(200).body(ENROLLMENT_DATA);
    });
    let submit = server.mock(|when, then| {
        when.method(POST)
            .path("/certificates/enrollments")
            .body_contains(r#""certificateName":"main""#)
            .body_contains(r#""certificateType":"Authentication""#)
            .body_contains(r#""csr":""#);
        then.status(202).body(r#"{"referenceNumber":"20250101-EH-1","timestamp":"2025-01-01T00:00:00Z"}"#);
    });
    let status = server.mock(|when, then| {
        when.method(GET).path("/certificates/enrollments/20250101-EH-1");
        then.status(200)
            .body(r#"{"status":{"code":200,"description":"Sukces"},"certificateSerialNumber":"0123ABCD"}"#);
    });
    let retrieve = server.mock(|when, then| {
        when.method(POST)
            .path("/certificates/retrieve")
            .body_contains("0123ABCD");
        then.status(200).body(format!(
            r#"{{"certificates":[{{"certificate":"{issued_b64}","certificateName":"main","certificateSerialNumber":"0123ABCD","certificateType":"Authentication"}}]}}"#
        ));
    });

    common::runtime().block_on(async {
        let mut client = common::client(&server);
        client.authenticate().await.expect("authenticate");
        let certificate = client
            .create_certificate("main", CertificateType::Authentication, &key, None)
            .await
            .expect("certificate");
        assert_eq!(certificate.certificate_serial_number, "0123ABCD");
        assert_eq!(certificate.certificate, issued_b64);
    });
    data.assert();
    submit.assert();
    status.assert();
    retrieve.assert();
}

#[test]
fn create_certificate_stops_at_first_failure() {
    let server = match common::try_start_server() {
        Some(server) => server,
        None => return,
    };
    common::mock_auth(&server);
    server.mock(|when, then| {
        when.method(GET).path("/certificates/enrollments/data");
        then.status(200).body(r#"{"commonName":"Jan Kowalski","countryName":"PL"}"#);
    });
    let submit = server.mock(|when, then| {
        when.method(POST).path("/certificates/enrollments");
        then.status(202).body(r#"{"referenceNumber":"never"}"#);
    });

    common::runtime().block_on(async {
        let mut client = common::client(&server);
        client.authenticate().await.expect("authenticate");
        let key = p256::ecdsa::SigningKey::random(&mut OsRng);
        let err = client
            .create_certificate("main", CertificateType::Offline, &key, None)
            .await
            .expect_err("missing uniqueIdentifier");
        assert!(matches!(
            err,
            KsefError::Csr(ksef_core::CsrError::MissingRequiredField("uniqueIdentifier"))
        ));
    });
    submit.assert_hits(0);
}

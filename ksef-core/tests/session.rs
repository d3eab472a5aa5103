mod common;

use httpmock::Method::{GET, POST};
use httpmock::prelude::HttpMockRequest;
use httpmock::MockServer;
use ksef_core::api::session::SessionState;
use ksef_core::api::{KsefClient, KsefError, ValidationError};
use ksef_core::poll::RetryPolicy;
use std::time::Duration;

const SESSION_REF: &str = "20250101-SO-0000000001";

fn mock_open_session<'a>(server: &'a MockServer, valid_until: &str) -> httpmock::Mock<'a> {
    server.mock(|when, then| {
        when.method(POST)
            .path("/sessions")
            .body_contains(r#""formCode":{"systemCode":"FA (3)","schemaVersion":"1-0E","value":"FA"}"#);
        then.status(201).body(format!(
            r#"{{"referenceNumber":"{SESSION_REF}","validUntil":"{valid_until}"}}"#
        ));
    })
}

async fn authenticated(server: &MockServer) -> KsefClient {
    let mut client = common::client(server);
    client.authenticate().await.expect("authenticate");
    client
}

#[test]
fn upload_lifecycle_resolves_and_lists_results() {
    let server = match common::try_start_server() {
        Some(server) => server,
        None => return,
    };
    common::mock_auth(&server);
    let open = mock_open_session(&server, "2099-01-01T00:00:00Z");
    let upload = server.mock(|when, then| {
        when.method(POST)
            .path(format!("/sessions/{SESSION_REF}/invoices"))
            .body_contains(r#""invoiceSize":21"#)
            .body_contains(r#""encryptedInvoiceSize":37"#)
            .body_contains(r#""encryptedInvoiceHash":"#)
            .body_contains(r#""encryptedInvoiceContent":"#);
        then.status(202).body(r#"{"referenceNumber":"20250101-EE-INV"}"#);
    });
    let close = server.mock(|when, then| {
        when.method(POST).path(format!("/sessions/{SESSION_REF}/close"));
        then.status(204);
    });
    let status = server.mock(|when, then| {
        when.method(GET).path(format!("/sessions/{SESSION_REF}/status"));
        then.status(200).body(
            r#"{"status":{"code":200,"description":"Sesja przetworzona pomyślnie"},"invoiceCount":2,"successfulInvoiceCount":1,"failedInvoiceCount":1}"#,
        );
    });
    let uploaded = server.mock(|when, then| {
        when.method(GET).path(format!("/sessions/{SESSION_REF}/invoices"));
        then.status(200).body(
            r#"{"invoices":[
              {"ordinalNumber":1,"referenceNumber":"20250101-EE-1","ksefNumber":"1234567890-20250101-0000000000AB-CD","invoiceHash":"h1","invoicingDate":"2025-01-01T10:00:00Z","status":{"code":200,"description":"Sukces"}},
              {"ordinalNumber":2,"referenceNumber":"20250101-EE-2","status":{"code":450,"description":"Błąd weryfikacji semantyki dokumentu faktury"}}
            ]}"#,
        );
    });
    let failed = server.mock(|when, then| {
        when.method(GET).path(format!("/sessions/{SESSION_REF}/invoices/failed"));
        then.status(200).body(
            r#"{"invoices":[
              {"ordinalNumber":2,"referenceNumber":"20250101-EE-2","status":{"code":450,"description":"Błąd weryfikacji semantyki dokumentu faktury","details":["P_2: wymagane"]}}
            ]}"#,
        );
    });

    common::runtime().block_on(async {
        let client = authenticated(&server).await;
        let mut session = client.create_session().await.expect("session");
        assert_eq!(session.reference_number(), SESSION_REF);
        assert_eq!(session.state(), SessionState::Open);

        let first = client
            .upload_invoice(&mut session, b"<Faktura>1</Faktura>\n")
            .await
            .expect("first upload");
        assert_eq!(first, "20250101-EE-INV");
        client
            .upload_invoice(&mut session, b"<Faktura>2</Faktura>\n")
            .await
            .expect("second upload");
        assert_eq!(session.uploaded(), 2);

        assert!(matches!(
            client.list_uploaded_invoices(&session).await,
            Err(KsefError::SessionNotResolved(SessionState::Open))
        ));

        client.finish_upload(&mut session).await.expect("close");
        assert_eq!(session.state(), SessionState::Closed);

        let batch = client.session_status(&mut session).await.expect("status");
        assert!(batch.is_terminal());
        assert_eq!(batch.successful_count(), 1);
        assert_eq!(session.state(), SessionState::Resolved);

        let accepted = client.list_uploaded_invoices(&session).await.expect("list");
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].ordinal_number(), 1);

        let rejected = client.list_failed_uploads(&session).await.expect("failed");
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].ordinal_number(), 2);
        assert_eq!(rejected[0].status().code(), 450);
        assert_eq!(rejected[0].status().details(), &["P_2: wymagane".to_string()]);
    });

    open.assert();
    upload.assert_hits(2);
    close.assert();
    status.assert();
    uploaded.assert();
    failed.assert();
}

#[test]
fn uploads_are_refused_after_close_without_network() {
    let server = match common::try_start_server() {
        Some(server) => server,
        None => return,
    };
    common::mock_auth(&server);
    mock_open_session(&server, "2099-01-01T00:00:00Z");
    server.mock(|when, then| {
        when.method(POST).path(format!("/sessions/{SESSION_REF}/close"));
        then.status(204);
    });
    let upload = server.mock(|when, then| {
        when.method(POST).path(format!("/sessions/{SESSION_REF}/invoices"));
        then.status(202).body(r#"{"referenceNumber":"never"}"#);
    });

    common::runtime().block_on(async {
        let client = authenticated(&server).await;
        let mut session = client.create_session().await.expect("session");
        client.finish_upload(&mut session).await.expect("close");

        assert!(matches!(
            client.upload_invoice(&mut session, b"<Faktura/>").await,
            Err(KsefError::SessionNotOpen(SessionState::Closed))
        ));
        assert!(matches!(
            client.finish_upload(&mut session).await,
            Err(KsefError::SessionNotOpen(SessionState::Closed))
        ));
    });
    upload.assert_hits(0);
}

#[test]
fn oversized_and_expired_uploads_fail_locally() {
    let server = match common::try_start_server() {
        Some(server) => server,
        None => return,
    };
    common::mock_auth(&server);
    let upload = server.mock(|when, then| {
        when.method(POST).path(format!("/sessions/{SESSION_REF}/invoices"));
        then.status(202).body(r#"{"referenceNumber":"never"}"#);
    });

    // Limit + 1 is refused.
    let mut open = mock_open_session(&server, "2099-01-01T00:00:00Z");
    common::runtime().block_on(async {
        let config = common::mock_config(&server).with_max_invoice_size(16);
        let mut client = KsefClient::new(config, common::nip_identity()).expect("client");
        client.authenticate().await.expect("authenticate");
        let mut session = client.create_session().await.expect("session");
        let err = client
            .upload_invoice(&mut session, &[b'x'; 17])
            .await
            .expect_err("too large");
        assert!(matches!(
            err,
            KsefError::Validation(ValidationError::PayloadTooLarge { size: 17, limit: 16 })
        ));
        assert_eq!(session.uploaded(), 0);
    });
    open.delete();

    mock_open_session(&server, "2000-01-01T00:00:00Z");
    common::runtime().block_on(async {
        let client = authenticated(&server).await;
        let mut session = client.create_session().await.expect("session");
        assert!(matches!(
            client.upload_invoice(&mut session, b"<Faktura/>").await,
            Err(KsefError::SessionExpired { .. })
        ));
    });
    upload.assert_hits(0);
}

#[test]
fn await_processing_abandons_expired_session() {
    let server = match common::try_start_server() {
        Some(server) => server,
        None => return,
    };
    common::mock_auth(&server);
    let valid_until = (chrono::Utc::now() + chrono::Duration::milliseconds(300)).to_rfc3339();
    mock_open_session(&server, &valid_until);
    server.mock(|when, then| {
        when.method(POST).path(format!("/sessions/{SESSION_REF}/close"));
        then.status(204);
    });
    let status = server.mock(|when, then| {
        when.method(GET).path(format!("/sessions/{SESSION_REF}/status"));
        then.status(200).body(r#"{"status":{"code":150,"description":"Trwa przetwarzanie"}}"#);
    });

    common::runtime().block_on(async {
        let config = common::mock_config(&server)
            .with_batch_polling(RetryPolicy::unbounded(Duration::from_millis(50)));
        let mut client = KsefClient::new(config, common::nip_identity()).expect("client");
        client.authenticate().await.expect("authenticate");
        let mut session = client.create_session().await.expect("session");
        client.finish_upload(&mut session).await.expect("close");

        let err = client
            .await_processing(&mut session)
            .await
            .expect_err("expires");
        assert!(matches!(err, KsefError::SessionExpired { .. }));
        assert_eq!(session.state(), SessionState::Abandoned);
    });
    assert!(status.hits() >= 1);
}

#[test]
fn await_processing_returns_terminal_failure_status() {
    let server = match common::try_start_server() {
        Some(server) => server,
        None => return,
    };
    common::mock_auth(&server);
    mock_open_session(&server, "2099-01-01T00:00:00Z");
    server.mock(|when, then| {
        when.method(POST).path(format!("/sessions/{SESSION_REF}/close"));
        then.status(204);
    });
    let status = server.mock(|when, then| {
        when.method(GET).path(format!("/sessions/{SESSION_REF}/status"));
        then.status(200)
            .body(r#"{"status":{"code":445,"description":"Błąd weryfikacji, brak poprawnych faktur"},"invoiceCount":1,"failedInvoiceCount":1}"#);
    });

    common::runtime().block_on(async {
        let client = authenticated(&server).await;
        let mut session = client.create_session().await.expect("session");
        client.finish_upload(&mut session).await.expect("close");
        let batch = client
            .await_processing(&mut session)
            .await
            .expect("terminal");
        assert_eq!(batch.status().code(), 445);
        assert_eq!(batch.failed_count(), 1);
        assert_eq!(session.state(), SessionState::Resolved);
    });
    status.assert_hits(1);
}

#[test]
fn failed_upload_spends_its_ordinal() {
    let server = match common::try_start_server() {
        Some(server) => server,
        None => return,
    };
    common::mock_auth(&server);
    mock_open_session(&server, "2099-01-01T00:00:00Z");
    let first = server.mock(|when, then| {
        when.method(POST)
            .path(format!("/sessions/{SESSION_REF}/invoices"))
            .body_contains(r#""ordinalNumber":1,"#);
        then.status(503).body("Service Unavailable");
    });
    let second = server.mock(|when, then| {
        when.method(POST)
            .path(format!("/sessions/{SESSION_REF}/invoices"))
            .body_contains(r#""ordinalNumber":2,"#);
        then.status(202).body(r#"{"referenceNumber":"20250101-EE-2"}"#);
    });

    common::runtime().block_on(async {
        let client = authenticated(&server).await;
        let mut session = client.create_session().await.expect("session");

        let err = client
            .upload_invoice(&mut session, b"<Faktura>AAAA</Faktura>")
            .await
            .expect_err("server unavailable");
        assert!(matches!(err, KsefError::ServerRejected(_)));
        assert_eq!(session.uploaded(), 0);
        assert_eq!(session.last_ordinal(), 1);

        let reference = client
            .upload_invoice(&mut session, b"<Faktura>BBBB</Faktura>")
            .await
            .expect("retry under a fresh ordinal");
        assert_eq!(reference, "20250101-EE-2");
        assert_eq!(session.uploaded(), 1);
        assert_eq!(session.last_ordinal(), 2);
    });
    first.assert_hits(1);
    second.assert_hits(1);
}

#[test]
fn status_of_open_session_is_refused() {
    let server = match common::try_start_server() {
        Some(server) => server,
        None => return,
    };
    common::mock_auth(&server);
    mock_open_session(&server, "2099-01-01T00:00:00Z");
    let status = server.mock(|when, then| {
        when.method(GET).path(format!("/sessions/{SESSION_REF}/status"));
        then.status(200).body(r#"{"status":{"code":200,"description":"Sukces"}}"#);
    });

    common::runtime().block_on(async {
        let client = authenticated(&server).await;
        let mut session = client.create_session().await.expect("session");
        assert!(matches!(
            client.session_status(&mut session).await,
            Err(KsefError::SessionNotClosed(SessionState::Open))
        ));
        assert!(matches!(
            client.await_processing(&mut session).await,
            Err(KsefError::SessionNotClosed(SessionState::Open))
        ));
        assert_eq!(session.state(), SessionState::Open);
    });
    status.assert_hits(0);
}

/// Close a fresh session and resolve it with a successful batch status.
async fn resolved_session(
    client: &KsefClient,
) -> ksef_core::api::session::UploadSession {
    let mut session = client.create_session().await.expect("session");
    client.finish_upload(&mut session).await.expect("close");
    client.session_status(&mut session).await.expect("status");
    assert_eq!(session.state(), SessionState::Resolved);
    session
}

fn mock_close_and_resolve(server: &MockServer) {
    server.mock(|when, then| {
        when.method(POST).path(format!("/sessions/{SESSION_REF}/close"));
        then.status(204);
    });
    server.mock(|when, then| {
        when.method(GET).path(format!("/sessions/{SESSION_REF}/status"));
        then.status(200).body(r#"{"status":{"code":200,"description":"Sukces"}}"#);
    });
}

fn without_continuation_token(request: &HttpMockRequest) -> bool {
    request.headers.as_ref().map_or(true, |headers| {
        !headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("x-continuation-token"))
    })
}

#[test]
fn invoice_listing_follows_continuation_token() {
    let server = match common::try_start_server() {
        Some(server) => server,
        None => return,
    };
    common::mock_auth(&server);
    mock_open_session(&server, "2099-01-01T00:00:00Z");
    mock_close_and_resolve(&server);
    let first_page = server.mock(|when, then| {
        when.method(GET)
            .path(format!("/sessions/{SESSION_REF}/invoices"))
            .matches(without_continuation_token);
        then.status(200).body(
            r#"{"continuationToken":"page-2","invoices":[
              {"ordinalNumber":1,"referenceNumber":"20250101-EE-1","ksefNumber":"1234567890-20250101-0000000000AB-01","status":{"code":200,"description":"Sukces"}}
            ]}"#,
        );
    });
    let second_page = server.mock(|when, then| {
        when.method(GET)
            .path(format!("/sessions/{SESSION_REF}/invoices"))
            .header("x-continuation-token", "page-2");
        then.status(200).body(
            r#"{"invoices":[
              {"ordinalNumber":2,"referenceNumber":"20250101-EE-2","ksefNumber":"1234567890-20250101-0000000000AB-02","status":{"code":200,"description":"Sukces"}}
            ]}"#,
        );
    });

    common::runtime().block_on(async {
        let client = authenticated(&server).await;
        let session = resolved_session(&client).await;
        let records = client.list_uploaded_invoices(&session).await.expect("list");
        let ordinals: Vec<u32> = records.iter().map(|r| r.ordinal_number()).collect();
        assert_eq!(ordinals, vec![1, 2]);
    });
    first_page.assert_hits(1);
    second_page.assert_hits(1);
}

#[test]
fn repeated_continuation_token_stops_listing() {
    let server = match common::try_start_server() {
        Some(server) => server,
        None => return,
    };
    common::mock_auth(&server);
    mock_open_session(&server, "2099-01-01T00:00:00Z");
    mock_close_and_resolve(&server);
    let pages = server.mock(|when, then| {
        when.method(GET)
            .path(format!("/sessions/{SESSION_REF}/invoices/failed"));
        then.status(200).body(r#"{"continuationToken":"same","invoices":[]}"#);
    });

    common::runtime().block_on(async {
        let client = authenticated(&server).await;
        let session = resolved_session(&client).await;
        assert!(matches!(
            client.list_failed_uploads(&session).await,
            Err(KsefError::InvalidResponse(_))
        ));
    });
    pages.assert_hits(2);
}

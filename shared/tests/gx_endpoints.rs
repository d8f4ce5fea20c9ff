use httpmock::prelude::*;
use serial_test::serial;
use tokio::runtime::Builder;
use uuid::Uuid;

use shared::config::GxSettings;
use shared::gx::{GxClient, GxError};

fn client_for(server: &MockServer) -> GxClient {
    let settings = GxSettings {
        base_url: server.base_url(),
        api_key_header: "X-API-Key".to_string(),
        api_key: "test-key".to_string(),
        max_process: 10,
        request_timeout_secs: 5,
    };
    GxClient::from_settings(&settings).expect("client builds")
}

#[serial]
#[test]
fn ingest_returns_process_id_and_status() -> anyhow::Result<()> {
    let rt = Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(anyhow::Error::new)?;
    rt.block_on(async {
        let server = MockServer::start_async().await;
        let process_id = Uuid::new_v4();
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/ingest/upload")
                    .header("X-API-Key", "test-key")
                    .body_contains("\"bucketId\":7")
                    .body_contains("\"fileName\":\"doc.pdf\"");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(format!(
                        r#"{{"ingest":{{"processId":"{process_id}","status":"queued"}}}}"#
                    ));
            })
            .await;

        let client = client_for(&server);
        let response = client
            .ingest_remote(7, "doc.pdf", "pdf", "https://store/presigned")
            .await
            .expect("ingest succeeds");
        let receipt = response.ingest.expect("receipt present");
        assert_eq!(receipt.process_id, Some(process_id));
        assert_eq!(receipt.status.as_deref(), Some("queued"));

        mock.assert_async().await;
        Ok(())
    })
}

#[serial]
#[test]
fn ingest_without_receipt_carries_message() -> anyhow::Result<()> {
    let rt = Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(anyhow::Error::new)?;
    rt.block_on(async {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/ingest/upload");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"message":"bucket does not exist"}"#);
            })
            .await;

        let client = client_for(&server);
        let response = client
            .ingest_remote(99, "doc.pdf", "pdf", "https://store/presigned")
            .await
            .expect("response decodes");
        assert!(response.ingest.is_none());
        assert_eq!(response.message.as_deref(), Some("bucket does not exist"));
        Ok(())
    })
}

#[serial]
#[test]
fn client_errors_are_permanent_rejections() -> anyhow::Result<()> {
    let rt = Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(anyhow::Error::new)?;
    rt.block_on(async {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/ingest/upload");
                then.status(400).body("bad document");
            })
            .await;

        let client = client_for(&server);
        let err = client
            .ingest_remote(7, "doc.pdf", "pdf", "https://store/presigned")
            .await
            .expect_err("400 surfaces as error");
        match err {
            GxError::Rejected { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "bad document");
            }
            other => panic!("expected rejection, got {other}"),
        }
        Ok(())
    })
}

#[serial]
#[test]
fn server_errors_are_transient() -> anyhow::Result<()> {
    let rt = Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(anyhow::Error::new)?;
    rt.block_on(async {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path_contains("/ingest/status/");
                then.status(503);
            })
            .await;

        let client = client_for(&server);
        let err = client
            .get_status(Uuid::new_v4())
            .await
            .expect_err("503 surfaces as error");
        assert!(matches!(err, GxError::Transient(_)));
        Ok(())
    })
}

#[serial]
#[test]
fn status_endpoint_decodes_progress() -> anyhow::Result<()> {
    let rt = Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(anyhow::Error::new)?;
    rt.block_on(async {
        let server = MockServer::start_async().await;
        let process_id = Uuid::new_v4();
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path(format!("/ingest/status/{process_id}"))
                    .header("X-API-Key", "test-key");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(format!(
                        r#"{{"ingest":{{"processId":"{process_id}","status":"complete","statusMessage":"done","progress":100.0}}}}"#
                    ));
            })
            .await;

        let client = client_for(&server);
        let response = client.get_status(process_id).await.expect("status decodes");
        let status = response.ingest.expect("ingest present");
        assert_eq!(status.process_id, Some(process_id));
        assert_eq!(status.status.as_deref(), Some("complete"));
        assert_eq!(status.status_message.as_deref(), Some("done"));
        Ok(())
    })
}

#[serial]
#[test]
fn create_bucket_returns_bucket_id() -> anyhow::Result<()> {
    let rt = Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(anyhow::Error::new)?;
    rt.block_on(async {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/bucket")
                    .body_contains("\"name\":\"invoices\"");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"bucket":{"bucketId":12,"name":"invoices"}}"#);
            })
            .await;

        let client = client_for(&server);
        let bucket = client.create_bucket("invoices").await.expect("bucket");
        assert_eq!(bucket.bucket_id, 12);
        assert_eq!(bucket.name.as_deref(), Some("invoices"));
        Ok(())
    })
}

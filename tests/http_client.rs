use std::time::Duration;

use httpmock::MockServer;
use serde_json::json;
use uuid::Uuid;

use render_lease::application::coordinator::StatusUpdate;
use render_lease::application::worker::{ClientError, CoordinatorClient};
use render_lease::domain::types::JobStatus;
use render_lease::infra::client::HttpCoordinatorClient;

fn client(server: &MockServer, token: Option<&str>) -> HttpCoordinatorClient {
    HttpCoordinatorClient::new(&server.base_url(), token, Duration::from_secs(5))
        .expect("client should build")
}

#[tokio::test]
async fn list_queued_sends_filter_and_bearer() {
    let server = MockServer::start();
    let id = Uuid::new_v4();
    let mock = server.mock(|when, then| {
        when.method("GET")
            .path("/render-jobs")
            .query_param("status", "queued")
            .query_param("kind", "render_part")
            .query_param("limit", "3")
            .header("authorization", "Bearer s3cret");
        then.status(200)
            .header("content-type", "application/json")
            .body(
                json!([{
                    "id": id,
                    "kind": "render_part",
                    "status": "queued",
                    "payload": { "scene": 4 },
                    "retries": 2,
                    "created_at": "2025-01-01T00:00:00Z"
                }])
                .to_string(),
            );
    });

    let tickets = client(&server, Some("s3cret"))
        .list_queued(3)
        .await
        .expect("list");
    mock.assert();

    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].id, id);
    assert_eq!(tickets[0].retries, 2);
    assert_eq!(tickets[0].payload["scene"], 4);
}

#[tokio::test]
async fn claim_posts_lease_seconds() {
    let server = MockServer::start();
    let id = Uuid::new_v4();
    let token = Uuid::new_v4();
    let mock = server.mock(|when, then| {
        when.method("POST")
            .path(format!("/render-jobs/{id}/claim"))
            .json_body(json!({ "lease_seconds": 90 }));
        then.status(200)
            .header("content-type", "application/json")
            .body(
                json!({
                    "id": id,
                    "lease_expires_at": "2025-01-01T00:01:30Z",
                    "lease_token": token,
                    "lease_seconds": 90
                })
                .to_string(),
            );
    });

    let grant = client(&server, None).claim(id, 90).await.expect("claim");
    mock.assert();

    assert_eq!(grant.lease_token, token);
    assert_eq!(grant.lease_seconds, 90);
}

#[tokio::test]
async fn ownership_statuses_map_to_lease_lost_errors() {
    let server = MockServer::start();
    let missing = Uuid::new_v4();
    let taken = Uuid::new_v4();
    let fenced = Uuid::new_v4();

    for (id, status) in [(missing, 404), (taken, 409), (fenced, 410)] {
        server.mock(|when, then| {
            when.method("POST")
                .path(format!("/render-jobs/{id}/heartbeat"));
            then.status(status)
                .header("content-type", "application/json")
                .body(r#"{"error":{"code":"x","message":"nope"}}"#);
        });
    }

    let client = client(&server, None);
    let token = Uuid::new_v4();

    let err = client.heartbeat(missing, token).await.expect_err("404");
    assert!(matches!(err, ClientError::NotFound(_)));
    let err = client.heartbeat(taken, token).await.expect_err("409");
    assert!(matches!(err, ClientError::Conflict(_)));
    let err = client.heartbeat(fenced, token).await.expect_err("410");
    assert!(matches!(err, ClientError::Gone(_)));
    assert!(err.is_lease_lost());
}

#[tokio::test]
async fn server_errors_are_not_lease_loss() {
    let server = MockServer::start();
    let id = Uuid::new_v4();
    server.mock(|when, then| {
        when.method("POST").path(format!("/render-jobs/{id}/status"));
        then.status(503).body("store unavailable");
    });

    let err = client(&server, None)
        .set_status(id, StatusUpdate::new(JobStatus::Rendering))
        .await
        .expect_err("503");

    match err {
        ClientError::Rejected { status, ref body } => {
            assert_eq!(status, 503);
            assert_eq!(body, "store unavailable");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!err.is_lease_lost());
}

#[tokio::test]
async fn set_status_sends_flattened_result() {
    let server = MockServer::start();
    let id = Uuid::new_v4();
    let mock = server.mock(|when, then| {
        when.method("POST")
            .path(format!("/render-jobs/{id}/status"))
            .json_body_includes(r#"{"status":"errored","error_class":"JobTimeout","error_message":"timeout"}"#);
        then.status(200)
            .header("content-type", "application/json")
            .body("{}");
    });

    client(&server, None)
        .set_status(id, StatusUpdate::errored("JobTimeout", "timeout"))
        .await
        .expect("status");
    mock.assert();
}

#[tokio::test]
async fn healthz_accepts_no_content() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method("GET").path("/healthz");
        then.status(204);
    });

    client(&server, None).healthz().await.expect("healthy");
    mock.assert();
}

#[tokio::test]
async fn garbage_body_is_a_decode_error() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method("GET").path("/render-jobs");
        then.status(200).body("<html>");
    });

    let err = client(&server, None)
        .list_queued(1)
        .await
        .expect_err("decode");
    assert!(matches!(err, ClientError::Decode(_)));
}

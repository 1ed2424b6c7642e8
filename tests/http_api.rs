use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header},
};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use render_lease::application::coordinator::{CoordinatorConfig, LeaseCoordinator};
use render_lease::application::repos::NewRenderJob;
use render_lease::infra::http::{CoordinatorState, REQUEST_ID_HEADER, build_router};
use render_lease::infra::memory::MemoryJobStore;

struct Harness {
    router: Router,
    coordinator: Arc<LeaseCoordinator>,
}

fn harness(auth_token: Option<&str>) -> Harness {
    let coordinator = Arc::new(LeaseCoordinator::new(
        Arc::new(MemoryJobStore::new()),
        CoordinatorConfig::default(),
    ));
    let state = CoordinatorState::new(coordinator.clone())
        .with_auth_token(auth_token.map(str::to_string));
    Harness {
        router: build_router(state),
        coordinator,
    }
}

impl Harness {
    async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        self.send_with(method, uri, body, None).await
    }

    async fn send_with(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        bearer: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request should build");

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should read");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn queued(&self) -> Uuid {
        self.coordinator
            .enqueue(NewRenderJob::render_part(json!({ "scene": "intro" })))
            .await
            .expect("enqueue")
            .id
    }
}

#[tokio::test]
async fn enqueue_then_list_and_get() {
    let h = harness(None);

    let (status, created) = h
        .send(
            Method::POST,
            "/render-jobs",
            Some(json!({ "payload": { "scene": "outro" } })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "queued");
    assert_eq!(created["kind"], "render_part");
    assert!(created.get("lease_token").is_none());

    let (status, listed) = h.send(Method::GET, "/render-jobs?limit=10", None).await;
    assert_eq!(status, StatusCode::OK);
    let listed = listed.as_array().expect("array");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["id"], created["id"]);

    let id = created["id"].as_str().expect("id");
    let (status, fetched) = h.send(Method::GET, &format!("/render-jobs/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["payload"]["scene"], "outro");
}

#[tokio::test]
async fn claim_returns_lease_then_conflicts() {
    let h = harness(None);
    let id = h.queued().await;

    let (status, grant) = h
        .send(
            Method::POST,
            &format!("/render-jobs/{id}/claim"),
            Some(json!({ "lease_seconds": 45 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(grant["lease_expires_at"].is_string());
    assert!(grant["lease_token"].is_string());
    assert_eq!(grant["lease_seconds"], 45);

    let (status, body) = h
        .send(Method::POST, &format!("/render-jobs/{id}/claim"), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "conflict");
}

#[tokio::test]
async fn claim_without_body_uses_default_lease() {
    let h = harness(None);
    let id = h.queued().await;

    let (status, grant) = h
        .send(Method::POST, &format!("/render-jobs/{id}/claim"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(grant["lease_seconds"], 180);
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let h = harness(None);
    let id = Uuid::new_v4();

    for path in [
        format!("/render-jobs/{id}/claim"),
        format!("/render-jobs/{id}/heartbeat"),
    ] {
        let (status, body) = h.send(Method::POST, &path, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{path}");
        assert_eq!(body["error"]["code"], "not_found");
    }

    let (status, _) = h
        .send(
            Method::POST,
            &format!("/render-jobs/{id}/status"),
            Some(json!({ "status": "rendering" })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn heartbeat_on_queued_job_conflicts() {
    let h = harness(None);
    let id = h.queued().await;

    let (status, body) = h
        .send(Method::POST, &format!("/render-jobs/{id}/heartbeat"), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "conflict");
}

#[tokio::test]
async fn stale_token_is_gone() {
    let h = harness(None);
    let id = h.queued().await;
    h.send(Method::POST, &format!("/render-jobs/{id}/claim"), None)
        .await;

    let (status, body) = h
        .send(
            Method::POST,
            &format!("/render-jobs/{id}/heartbeat"),
            Some(json!({ "lease_token": Uuid::new_v4() })),
        )
        .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["error"]["code"], "lease_lost");
}

#[tokio::test]
async fn status_walks_the_transition_table() {
    let h = harness(None);
    let id = h.queued().await;
    let (_, grant) = h
        .send(Method::POST, &format!("/render-jobs/{id}/claim"), None)
        .await;
    let token = grant["lease_token"].clone();
    let status_path = format!("/render-jobs/{id}/status");

    let (status, _) = h
        .send(
            Method::POST,
            &status_path,
            Some(json!({ "status": "rendered", "lease_token": token })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, job) = h
        .send(
            Method::POST,
            &status_path,
            Some(json!({ "status": "rendering", "lease_token": token })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "rendering");

    let (status, heartbeat) = h
        .send(
            Method::POST,
            &format!("/render-jobs/{id}/heartbeat"),
            Some(json!({ "lease_token": token })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(heartbeat["lease_expires_at"].is_string());

    let (status, job) = h
        .send(
            Method::POST,
            &status_path,
            Some(json!({
                "status": "rendered",
                "lease_token": token,
                "artifact_path": "output/videos/x.mp4",
                "bytes": 10,
                "duration_ms": 1200,
                "sha256": "00",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "rendered");
    assert_eq!(job["lease_expires_at"], Value::Null);
    assert_eq!(job["result"]["duration_ms"], 1200);
}

#[tokio::test]
async fn error_fields_outside_errored_are_bad_requests() {
    let h = harness(None);
    let id = h.queued().await;
    h.send(Method::POST, &format!("/render-jobs/{id}/claim"), None)
        .await;

    let (status, body) = h
        .send(
            Method::POST,
            &format!("/render-jobs/{id}/status"),
            Some(json!({ "status": "rendering", "error_message": "nope" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn bearer_token_guards_job_routes() {
    let h = harness(Some("s3cret"));
    let id = h.queued().await;
    let claim = format!("/render-jobs/{id}/claim");

    let (status, body) = h.send(Method::GET, "/render-jobs", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthorized");

    let (status, _) = h
        .send_with(Method::POST, &claim, None, Some("wrong"))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = h
        .send_with(Method::POST, &claim, None, Some("s3cret"))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = h.send(Method::GET, "/healthz", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn healthz_reports_store_health() {
    let h = harness(None);
    let (status, body) = h.send(Method::GET, "/healthz", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, Value::Null);
}

#[tokio::test]
async fn every_response_carries_a_request_id() {
    let h = harness(None);
    let id = h.queued().await;

    let mut seen = Vec::new();
    for uri in [
        "/healthz".to_string(),
        format!("/render-jobs/{id}/heartbeat"),
        format!("/render-jobs/{}/claim", Uuid::new_v4()),
    ] {
        let request = Request::builder()
            .method(if uri == "/healthz" { Method::GET } else { Method::POST })
            .uri(&uri)
            .body(Body::empty())
            .expect("request should build");
        let response = h.router.clone().oneshot(request).await.expect("respond");
        let id = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Uuid::parse_str(value).ok())
            .expect("request id header");
        seen.push(id);
    }

    seen.dedup();
    assert_eq!(seen.len(), 3, "request ids are unique per request");
}

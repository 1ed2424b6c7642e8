//! `/render-jobs` handlers.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::application::coordinator::{LeaseGrant, StatusUpdate};
use crate::application::error::ErrorReport;
use crate::application::repos::{JobQueryFilter, NewRenderJob};
use crate::domain::entities::RenderJob;
use crate::domain::types::{JobKind, JobStatus};

use super::error::ApiError;
use super::state::CoordinatorState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<JobStatus>,
    pub kind: Option<JobKind>,
    pub limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClaimRequest {
    pub lease_seconds: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatRequest {
    pub lease_token: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    #[serde(default)]
    pub kind: JobKind,
    #[serde(default)]
    pub payload: Value,
}

pub async fn list_jobs(
    State(state): State<CoordinatorState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<RenderJob>>, ApiError> {
    let jobs = state
        .coordinator
        .list(JobQueryFilter {
            status: query.status,
            kind: query.kind,
            limit: query.limit,
        })
        .await?;
    Ok(Json(jobs))
}

pub async fn enqueue_job(
    State(state): State<CoordinatorState>,
    Json(payload): Json<EnqueueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .coordinator
        .enqueue(NewRenderJob {
            id: Uuid::new_v4(),
            kind: payload.kind,
            payload: payload.payload,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn get_job(
    State(state): State<CoordinatorState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RenderJob>, ApiError> {
    Ok(Json(state.coordinator.get(id).await?))
}

pub async fn claim_job(
    State(state): State<CoordinatorState>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<Json<LeaseGrant>, ApiError> {
    let request: ClaimRequest = optional_body(&body)?;
    let grant = state.coordinator.claim(id, request.lease_seconds).await?;
    Ok(Json(grant))
}

pub async fn heartbeat_job(
    State(state): State<CoordinatorState>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<Json<LeaseGrant>, ApiError> {
    let request: HeartbeatRequest = optional_body(&body)?;
    let grant = state.coordinator.heartbeat(id, request.lease_token).await?;
    Ok(Json(grant))
}

pub async fn set_job_status(
    State(state): State<CoordinatorState>,
    Path(id): Path<Uuid>,
    Json(update): Json<StatusUpdate>,
) -> Result<Json<RenderJob>, ApiError> {
    Ok(Json(state.coordinator.set_status(id, update).await?))
}

pub async fn healthz(State(state): State<CoordinatorState>) -> Response {
    match state.coordinator.health().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            ErrorReport::from_error(
                "infra::http::healthz",
                StatusCode::SERVICE_UNAVAILABLE,
                &err,
            )
            .attach(&mut response);
            response
        }
    }
}

/// Claim and heartbeat bodies may be omitted entirely.
fn optional_body<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|err| ApiError::bad_request("Malformed JSON body", Some(err.to_string())))
}

use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::application::error::ErrorReport;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// How a finished request is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Ok,
    /// 409 and 410: another worker holds the job or fenced this one out.
    LeaseRace,
    ClientError,
    ServerError,
}

impl Outcome {
    fn of(status: StatusCode) -> Self {
        match status {
            StatusCode::CONFLICT | StatusCode::GONE => Self::LeaseRace,
            s if s.is_server_error() => Self::ServerError,
            s if s.is_client_error() => Self::ClientError,
            _ => Self::Ok,
        }
    }
}

/// The `{id}` segment of `/render-jobs/{id}[/action]`, when it is a job id.
fn job_id_from_path(path: &str) -> Option<Uuid> {
    let rest = path.strip_prefix("/render-jobs/")?;
    let segment = rest.split('/').next()?;
    Uuid::parse_str(segment).ok()
}

/// Tags the response with a request id and logs it by outcome, keyed by job where the route
/// names one.
pub async fn trace_requests(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let job_id = job_id_from_path(&path);
    let request_id = Uuid::new_v4();
    let start = Instant::now();

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis() as u64;
    let job_id = job_id.map(|id| id.to_string()).unwrap_or_default();
    let detail = response
        .extensions_mut()
        .remove::<ErrorReport>()
        .map(|report| (report.source, report.messages));

    match Outcome::of(status) {
        Outcome::Ok => debug!(
            target = "render_lease::http::response",
            status = status.as_u16(),
            method = %method,
            path = %path,
            job_id = %job_id,
            elapsed_ms,
            request_id = %request_id,
            "request served",
        ),
        Outcome::LeaseRace => debug!(
            target = "render_lease::http::response",
            status = status.as_u16(),
            method = %method,
            job_id = %job_id,
            elapsed_ms,
            detail = ?detail.as_ref().and_then(|(_, messages)| messages.first()),
            request_id = %request_id,
            "lease race rejected",
        ),
        Outcome::ClientError => warn!(
            target = "render_lease::http::response",
            status = status.as_u16(),
            method = %method,
            path = %path,
            job_id = %job_id,
            elapsed_ms,
            detail = ?detail.as_ref().and_then(|(_, messages)| messages.first()),
            request_id = %request_id,
            "client request error",
        ),
        Outcome::ServerError => {
            let (source, chain) = detail.unwrap_or(("unknown", Vec::new()));
            error!(
                target = "render_lease::http::response",
                status = status.as_u16(),
                method = %method,
                path = %path,
                job_id = %job_id,
                elapsed_ms,
                source,
                chain = ?chain,
                request_id = %request_id,
                "request failed",
            );
        }
    }

    response
}

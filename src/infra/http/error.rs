use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::application::coordinator::CoordinatorError;
use crate::application::error::ErrorReport;
use crate::application::repos::RepoError;

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const NOT_FOUND: &str = "not_found";
    pub const CONFLICT: &str = "conflict";
    pub const LEASE_LOST: &str = "lease_lost";
    pub const STORE: &str = "store_error";
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    hint: Option<String>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        hint: Option<String>,
    ) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            hint,
        }
    }

    pub fn bad_request(message: impl Into<String>, hint: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message, hint)
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            codes::UNAUTHORIZED,
            "Bearer token required",
            None,
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        match &err {
            CoordinatorError::NotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, codes::NOT_FOUND, err.to_string(), None)
            }
            CoordinatorError::Conflict { current, .. } => Self::new(
                StatusCode::CONFLICT,
                codes::CONFLICT,
                err.to_string(),
                Some(format!("current status is `{current}`")),
            ),
            CoordinatorError::LeaseLost(_) => Self::new(
                StatusCode::GONE,
                codes::LEASE_LOST,
                err.to_string(),
                Some("stop working on this job".to_string()),
            ),
            CoordinatorError::BadRequest(message) => Self::bad_request(message.clone(), None),
            CoordinatorError::Store(repo) => {
                let (status, code) = match repo {
                    RepoError::Timeout => (StatusCode::SERVICE_UNAVAILABLE, codes::STORE),
                    RepoError::Duplicate { .. } => (StatusCode::CONFLICT, codes::CONFLICT),
                    RepoError::InvalidInput { .. } => (StatusCode::BAD_REQUEST, codes::BAD_REQUEST),
                    _ => (StatusCode::INTERNAL_SERVER_ERROR, codes::STORE),
                };
                Self::new(status, code, "Job store request failed", Some(repo.to_string()))
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let detail = format!(
            "{}: {}",
            self.code,
            self.hint.as_deref().unwrap_or(&self.message)
        );
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code.to_string(),
                message: self.message,
                hint: self.hint,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        ErrorReport::from_message("infra::http::render_jobs", self.status, detail)
            .attach(&mut response);
        response
    }
}

//! HTTP surface of the lease coordinator.

mod auth;
pub mod error;
pub mod handlers;
mod middleware;
mod state;

pub use error::{ApiError, ApiErrorBody, codes};
pub use middleware::REQUEST_ID_HEADER;
pub use state::CoordinatorState;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

use self::middleware::trace_requests;

pub fn build_router(state: CoordinatorState) -> Router {
    let jobs = Router::new()
        .route(
            "/render-jobs",
            get(handlers::list_jobs).post(handlers::enqueue_job),
        )
        .route("/render-jobs/{id}", get(handlers::get_job))
        .route("/render-jobs/{id}/claim", post(handlers::claim_job))
        .route("/render-jobs/{id}/heartbeat", post(handlers::heartbeat_job))
        .route("/render-jobs/{id}/status", post(handlers::set_job_status))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    Router::new()
        .merge(jobs)
        .route("/healthz", get(handlers::healthz))
        .with_state(state)
        .layer(axum_middleware::from_fn(trace_requests))
}

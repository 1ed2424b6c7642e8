use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the coordinator and workers emit.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_gauge!(
            "render_worker_queue_depth",
            Unit::Count,
            "Queued jobs returned by the most recent worker poll."
        );
        describe_counter!(
            "render_worker_claims_total",
            Unit::Count,
            "Total number of successful claims made by this worker."
        );
        describe_counter!(
            "render_worker_claim_conflicts_total",
            Unit::Count,
            "Total number of claims lost to another worker."
        );
        describe_counter!(
            "render_worker_jobs_total",
            Unit::Count,
            "Total number of finished job executions, labelled by outcome."
        );
        describe_counter!(
            "render_worker_disk_low_total",
            Unit::Count,
            "Total number of claims skipped because the workspace disk was low."
        );
        describe_histogram!(
            "render_worker_job_duration_ms",
            Unit::Milliseconds,
            "Wall-clock duration of one job execution in milliseconds."
        );
        describe_counter!(
            "render_coordinator_transitions_total",
            Unit::Count,
            "Total number of applied status transitions, labelled by target status."
        );
        describe_counter!(
            "render_coordinator_reaped_total",
            Unit::Count,
            "Total number of jobs requeued after their lease expired."
        );
    });
}

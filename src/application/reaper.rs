//! Cron job that returns jobs with expired leases to the queue.

use std::str::FromStr;
use std::sync::Arc;

use apalis::prelude::*;
use apalis_cron::Schedule;
use time::OffsetDateTime;

use crate::application::coordinator::LeaseCoordinator;

pub const DEFAULT_REAPER_SCHEDULE: &str = "*/15 * * * * *";
const REAP_BATCH: u32 = 100;

/// Marker struct for the cron-triggered reaper.
/// Must implement `From<chrono::DateTime<chrono::Utc>>` for apalis-cron compatibility.
#[derive(Default, Debug, Clone)]
pub struct ReapExpiredLeasesJob;

impl From<chrono::DateTime<chrono::Utc>> for ReapExpiredLeasesJob {
    fn from(_: chrono::DateTime<chrono::Utc>) -> Self {
        Self
    }
}

#[derive(Clone)]
pub struct ReaperContext {
    pub coordinator: Arc<LeaseCoordinator>,
}

pub async fn process_reap_expired_leases_job(
    _job: ReapExpiredLeasesJob,
    ctx: Data<ReaperContext>,
) -> Result<(), apalis::prelude::Error> {
    match ctx
        .coordinator
        .reap_expired(OffsetDateTime::now_utc(), REAP_BATCH)
        .await
    {
        Ok(count) if count > 0 => {
            tracing::info!(
                target = "render_lease::reaper",
                requeued = count,
                "Requeued render jobs with expired leases"
            );
        }
        Err(err) => {
            tracing::warn!(
                target = "render_lease::reaper",
                error = %err,
                "Failed to reap expired leases"
            );
        }
        _ => {}
    }
    Ok(())
}

/// Parse a six-field cron expression (seconds first).
pub fn reaper_schedule(expression: &str) -> Result<Schedule, String> {
    Schedule::from_str(expression)
        .map_err(|err| format!("invalid cron expression `{expression}`: {err}"))
}

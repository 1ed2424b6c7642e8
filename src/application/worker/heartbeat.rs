//! Lease renewal loop that runs beside each render.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::client::CoordinatorClient;

pub const DEFAULT_HEARTBEAT_CAP: Duration = Duration::from_secs(10);
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Half the lease, but never longer than `cap`.
pub fn heartbeat_interval(lease_seconds: u32, cap: Duration) -> Duration {
    let half_lease = Duration::from_millis(u64::from(lease_seconds) * 500);
    half_lease.min(cap).max(MIN_HEARTBEAT_INTERVAL)
}

/// Beats every `interval` until `stop` fires. A 404/409/410 answer cancels `lease_lost`
/// and ends the loop; transport failures are retried on the next beat.
pub fn spawn_heartbeat(
    client: Arc<dyn CoordinatorClient>,
    job_id: Uuid,
    lease_token: Uuid,
    interval: Duration,
    lease_lost: CancellationToken,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            match client.heartbeat(job_id, lease_token).await {
                Ok(grant) => {
                    debug!(
                        target = "render_lease::worker::heartbeat",
                        job_id = %job_id,
                        lease_expires_at = %grant.lease_expires_at,
                        "Lease renewed"
                    );
                }
                Err(err) if err.is_lease_lost() => {
                    warn!(
                        target = "render_lease::worker::heartbeat",
                        job_id = %job_id,
                        error = %err,
                        "Lease lost"
                    );
                    lease_lost.cancel();
                    break;
                }
                Err(err) => {
                    warn!(
                        target = "render_lease::worker::heartbeat",
                        job_id = %job_id,
                        error = %err,
                        "Heartbeat failed; retrying"
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_is_half_lease_capped() {
        let cap = Duration::from_secs(10);
        assert_eq!(heartbeat_interval(180, cap), cap);
        assert_eq!(heartbeat_interval(6, cap), Duration::from_secs(3));
        assert_eq!(heartbeat_interval(0, cap), MIN_HEARTBEAT_INTERVAL);
    }
}

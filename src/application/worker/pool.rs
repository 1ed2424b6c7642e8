use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics::{counter, gauge};
use time::OffsetDateTime;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::WorkerConfig;
use super::backoff::Backoff;
use super::client::{ClientError, CoordinatorClient};
use super::disk::{DiskCheck, DiskProbe, check_disk};
use super::job::{JobContext, run_claimed_job};
use crate::application::coordinator::LeaseGrant;
use crate::application::render::RenderFunction;
use crate::domain::entities::JobTicket;
use crate::util::bytes::format_bytes;

/// What one poll cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub listed: usize,
    pub claimed: usize,
    pub conflicts: usize,
    pub disk_low: bool,
    /// Every slot was occupied, so nothing was requested.
    pub busy: bool,
}

/// Bounded pool of concurrent job executions fed by polling the coordinator.
pub struct WorkerPool {
    ctx: Arc<JobContext>,
    disk: Arc<dyn DiskProbe>,
    slots: Arc<Semaphore>,
    running: Arc<DashMap<Uuid, Instant>>,
    tasks: TaskTracker,
}

impl WorkerPool {
    pub fn new(
        client: Arc<dyn CoordinatorClient>,
        renderer: Arc<dyn RenderFunction>,
        disk: Arc<dyn DiskProbe>,
        config: WorkerConfig,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            ctx: Arc::new(JobContext {
                client,
                renderer,
                config,
            }),
            disk,
            slots,
            running: Arc::new(DashMap::new()),
            tasks: TaskTracker::new(),
        }
    }

    /// Ids of the jobs this process is executing right now.
    pub fn running_jobs(&self) -> Vec<Uuid> {
        self.running.iter().map(|entry| *entry.key()).collect()
    }

    /// One poll/claim cycle. Claimed jobs are spawned and keep running after this returns.
    pub async fn poll_once(&self) -> Result<PollSummary, ClientError> {
        self.touch_liveness().await;

        let config = &self.ctx.config;
        let free_slots = self.slots.available_permits();
        if free_slots == 0 {
            return Ok(PollSummary {
                busy: true,
                ..PollSummary::default()
            });
        }

        let want = free_slots.min(config.max_claim.max(1) as usize);
        let candidates = self.ctx.client.list_queued(want as u32).await?;
        gauge!("render_worker_queue_depth").set(candidates.len() as f64);

        let mut summary = PollSummary {
            listed: candidates.len(),
            ..PollSummary::default()
        };

        for job in candidates {
            if self.running.contains_key(&job.id) {
                continue;
            }

            if !self.disk_has_room() {
                summary.disk_low = true;
                break;
            }

            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                break;
            };

            match self.ctx.client.claim(job.id, config.lease_seconds).await {
                Ok(grant) => {
                    counter!("render_worker_claims_total").increment(1);
                    summary.claimed += 1;
                    self.spawn_job(job, grant, permit);
                }
                Err(err) if err.is_lease_lost() => {
                    // Another worker won the race.
                    counter!("render_worker_claim_conflicts_total").increment(1);
                    summary.conflicts += 1;
                    debug!(
                        target = "render_lease::worker",
                        job_id = %job.id,
                        error = %err,
                        "Claim lost"
                    );
                }
                Err(err) => {
                    warn!(
                        target = "render_lease::worker",
                        job_id = %job.id,
                        error = %err,
                        "Claim failed"
                    );
                    break;
                }
            }
        }

        Ok(summary)
    }

    /// Poll until `shutdown` fires, then wait up to the configured grace for in-flight jobs.
    pub async fn run(&self, shutdown: CancellationToken) {
        let config = &self.ctx.config;
        let mut backoff = Backoff::new(
            config.poll_interval,
            config.poll_backoff_factor,
            config.poll_max_interval,
        );

        info!(
            target = "render_lease::worker",
            max_concurrent = config.max_concurrent,
            max_claim = config.max_claim,
            lease_seconds = config.lease_seconds,
            "Worker pool started"
        );

        while !shutdown.is_cancelled() {
            let summary = match self.poll_once().await {
                Ok(summary) => Some(summary),
                Err(err) => {
                    warn!(
                        target = "render_lease::worker",
                        error = %err,
                        "Poll failed"
                    );
                    None
                }
            };
            let delay = next_poll_delay(summary.as_ref(), &mut backoff, config.poll_interval);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.tasks.close();
        let in_flight = self.running.len();
        if in_flight > 0 {
            info!(
                target = "render_lease::worker",
                in_flight,
                "Waiting for in-flight render jobs"
            );
        }
        if tokio::time::timeout(config.shutdown_grace, self.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                target = "render_lease::worker",
                in_flight = self.running.len(),
                "Shutdown grace elapsed with render jobs still running"
            );
        }
    }

    /// Wait for every job spawned so far to finish.
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    fn spawn_job(&self, job: JobTicket, grant: LeaseGrant, permit: OwnedSemaphorePermit) {
        self.running.insert(job.id, Instant::now());
        let ctx = self.ctx.clone();
        let running = self.running.clone();

        self.tasks.spawn(async move {
            let id = job.id;
            let outcome = run_claimed_job(&ctx, job, grant).await;
            running.remove(&id);
            drop(permit);
            outcome
        });
    }

    fn disk_has_room(&self) -> bool {
        let config = &self.ctx.config;
        match check_disk(
            self.disk.as_ref(),
            &config.tmp_dir,
            config.disk_min_free_bytes,
        ) {
            Ok(DiskCheck::Ok { .. }) => true,
            Ok(DiskCheck::Low {
                free_bytes,
                floor_bytes,
            }) => {
                counter!("render_worker_disk_low_total").increment(1);
                warn!(
                    target = "render_lease::worker",
                    event = "disk_low",
                    free_bytes,
                    floor_bytes,
                    free = %format_bytes(free_bytes),
                    "disk_low"
                );
                false
            }
            Err(err) => {
                warn!(
                    target = "render_lease::worker",
                    dir = %config.tmp_dir.display(),
                    error = %err,
                    "Disk probe failed; not claiming"
                );
                false
            }
        }
    }

    async fn touch_liveness(&self) {
        let Some(path) = self.ctx.config.liveness_file.as_ref() else {
            return;
        };

        if let Some(parent) = path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                debug!(
                    target = "render_lease::worker",
                    path = %parent.display(),
                    error = %err,
                    "Failed to create liveness directory"
                );
            }
        }
        let stamp = OffsetDateTime::now_utc().unix_timestamp().to_string();
        if let Err(err) = tokio::fs::write(path, stamp).await {
            debug!(
                target = "render_lease::worker",
                path = %path.display(),
                error = %err,
                "Failed to touch liveness file"
            );
        }
    }
}

/// Claims and full slots poll again at the base interval; a busy pool frees a slot as soon as
/// a render ends. Idle cycles and failures back off.
fn next_poll_delay(
    summary: Option<&PollSummary>,
    backoff: &mut Backoff,
    interval: Duration,
) -> Duration {
    match summary {
        Some(summary) if summary.claimed > 0 => {
            backoff.reset();
            interval
        }
        Some(summary) if summary.busy => interval,
        _ => backoff.next_delay(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff::new(
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(30),
        )
    }

    #[test]
    fn busy_cycle_keeps_base_interval_and_streak() {
        let mut backoff = backoff();
        backoff.next_delay();
        backoff.next_delay();

        let busy = PollSummary {
            busy: true,
            ..PollSummary::default()
        };
        let delay = next_poll_delay(Some(&busy), &mut backoff, Duration::from_millis(100));
        assert_eq!(delay, Duration::from_millis(100));
        assert_eq!(backoff.attempt(), 2);
    }

    #[test]
    fn claim_resets_and_idle_or_failure_advances() {
        let mut backoff = backoff();
        next_poll_delay(Some(&PollSummary::default()), &mut backoff, Duration::ZERO);
        next_poll_delay(None, &mut backoff, Duration::ZERO);
        assert_eq!(backoff.attempt(), 2);

        let claimed = PollSummary {
            claimed: 1,
            ..PollSummary::default()
        };
        let delay = next_poll_delay(Some(&claimed), &mut backoff, Duration::from_millis(100));
        assert_eq!(delay, Duration::from_millis(100));
        assert_eq!(backoff.attempt(), 0);
    }
}

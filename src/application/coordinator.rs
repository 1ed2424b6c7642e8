//! Lease coordinator: claim, heartbeat and status transitions over a [`JobStore`].

use std::sync::Arc;

use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::repos::{
    CasOutcome, Expectation, JobPatch, JobQueryFilter, JobStore, LeaseChange, NewRenderJob,
    RepoError,
};
use crate::domain::entities::RenderJob;
use crate::domain::types::{JobKind, JobStatus};
use crate::util::bytes::truncate_utf8;

pub const DEFAULT_LEASE_SECONDS: u32 = 180;
pub const DEFAULT_MAX_LEASE_SECONDS: u32 = 3600;
pub const STDERR_SNIPPET_MAX_BYTES: usize = 400;
const HEARTBEAT_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("render job `{0}` not found")]
    NotFound(Uuid),
    #[error("render job `{id}` is `{current}`; cannot {action}")]
    Conflict {
        id: Uuid,
        current: JobStatus,
        action: String,
    },
    #[error("lease on render job `{0}` is held by another worker")]
    LeaseLost(Uuid),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Store(#[from] RepoError),
}

impl CoordinatorError {
    fn conflict(id: Uuid, current: JobStatus, action: impl Into<String>) -> Self {
        Self::Conflict {
            id,
            current,
            action: action.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    pub default_lease_seconds: u32,
    pub max_lease_seconds: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_lease_seconds: DEFAULT_LEASE_SECONDS,
            max_lease_seconds: DEFAULT_MAX_LEASE_SECONDS,
        }
    }
}

/// What a successful claim or heartbeat hands back to the lease holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseGrant {
    pub id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub lease_expires_at: OffsetDateTime,
    pub lease_token: Uuid,
    pub lease_seconds: u32,
}

/// Result fields a worker reports together with `rendered`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl RenderResult {
    fn into_fields(self) -> Option<Map<String, Value>> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) if !map.is_empty() => Some(map),
            _ => None,
        }
    }
}

/// A requested status transition plus the fields to merge with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_token: Option<Uuid>,
    #[serde(flatten)]
    pub result: RenderResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_snippet: Option<String>,
}

impl StatusUpdate {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            lease_token: None,
            result: RenderResult::default(),
            error_class: None,
            error_message: None,
            stderr_snippet: None,
        }
    }

    pub fn errored(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_class: Some(class.into()),
            error_message: Some(message.into()),
            ..Self::new(JobStatus::Errored)
        }
    }

    pub fn with_token(mut self, token: Option<Uuid>) -> Self {
        self.lease_token = token;
        self
    }

    fn carries_error_fields(&self) -> bool {
        self.error_class.is_some() || self.error_message.is_some() || self.stderr_snippet.is_some()
    }
}

pub struct LeaseCoordinator {
    store: Arc<dyn JobStore>,
    config: CoordinatorConfig,
}

impl LeaseCoordinator {
    pub fn new(store: Arc<dyn JobStore>, config: CoordinatorConfig) -> Self {
        Self { store, config }
    }

    pub async fn enqueue(&self, job: NewRenderJob) -> Result<RenderJob, CoordinatorError> {
        let job = self.store.insert(job).await?;
        info!(
            target = "render_lease::coordinator",
            job_id = %job.id,
            kind = %job.kind,
            "Render job enqueued"
        );
        Ok(job)
    }

    pub async fn get(&self, id: Uuid) -> Result<RenderJob, CoordinatorError> {
        self.store
            .find(id)
            .await?
            .ok_or(CoordinatorError::NotFound(id))
    }

    /// Lists jobs oldest first. Without an explicit status only queued `render_part` jobs
    /// are returned.
    pub async fn list(
        &self,
        mut filter: JobQueryFilter,
    ) -> Result<Vec<RenderJob>, CoordinatorError> {
        filter.status.get_or_insert(JobStatus::Queued);
        filter.kind.get_or_insert(JobKind::RenderPart);
        Ok(self.store.list(&filter).await?)
    }

    pub fn effective_lease_seconds(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.config.default_lease_seconds)
            .clamp(1, self.config.max_lease_seconds.max(1))
    }

    /// Claims a queued job. Of several concurrent claimers exactly one succeeds.
    pub async fn claim(
        &self,
        id: Uuid,
        lease_seconds: Option<u32>,
    ) -> Result<LeaseGrant, CoordinatorError> {
        let seconds = self.effective_lease_seconds(lease_seconds);
        let token = Uuid::new_v4();
        let expires_at = OffsetDateTime::now_utc() + Duration::seconds(i64::from(seconds));

        let patch = JobPatch::to_status(JobStatus::Claimed).with_lease(LeaseChange::Set {
            expires_at,
            token,
            seconds,
        });

        match self
            .store
            .compare_and_set(id, Expectation::status(JobStatus::Queued), patch)
            .await?
        {
            CasOutcome::Applied(job) => {
                record_transition(JobStatus::Claimed);
                debug!(
                    target = "render_lease::coordinator",
                    job_id = %id,
                    lease_seconds = seconds,
                    "Render job claimed"
                );
                Ok(LeaseGrant {
                    id,
                    lease_expires_at: job.lease_expires_at.unwrap_or(expires_at),
                    lease_token: token,
                    lease_seconds: seconds,
                })
            }
            CasOutcome::StatusMismatch { current } => {
                Err(CoordinatorError::conflict(id, current, "claim"))
            }
            CasOutcome::LeaseMismatch => Err(CoordinatorError::conflict(
                id,
                JobStatus::Queued,
                "claim",
            )),
            CasOutcome::Missing => Err(CoordinatorError::NotFound(id)),
        }
    }

    /// Extends a held lease. The returned expiry is strictly later than the previous one.
    pub async fn heartbeat(
        &self,
        id: Uuid,
        lease_token: Option<Uuid>,
    ) -> Result<LeaseGrant, CoordinatorError> {
        for _ in 0..HEARTBEAT_ATTEMPTS {
            let job = self.get(id).await?;
            if !job.status.is_leased() {
                return Err(CoordinatorError::conflict(id, job.status, "heartbeat"));
            }
            if lease_token.is_some() && lease_token != job.lease_token {
                return Err(CoordinatorError::LeaseLost(id));
            }

            let seconds = job
                .lease_seconds
                .unwrap_or(self.config.default_lease_seconds);
            let renewed = OffsetDateTime::now_utc() + Duration::seconds(i64::from(seconds));
            let expires_at = match job.lease_expires_at {
                Some(previous) => renewed.max(previous + Duration::milliseconds(1)),
                None => renewed,
            };

            let expect = Expectation::status(job.status).with_token(job.lease_token);
            let patch = JobPatch::default().with_lease(LeaseChange::Extend { expires_at });

            match self.store.compare_and_set(id, expect, patch).await? {
                CasOutcome::Applied(updated) => {
                    return Ok(LeaseGrant {
                        id,
                        lease_expires_at: updated.lease_expires_at.unwrap_or(expires_at),
                        lease_token: updated.lease_token.unwrap_or_default(),
                        lease_seconds: seconds,
                    });
                }
                CasOutcome::Missing => return Err(CoordinatorError::NotFound(id)),
                // The job moved underneath us (claimed -> rendering, or requeued); re-read.
                CasOutcome::StatusMismatch { .. } | CasOutcome::LeaseMismatch => continue,
            }
        }

        let job = self.get(id).await?;
        Err(CoordinatorError::conflict(id, job.status, "heartbeat"))
    }

    /// Applies a transition from the settable table and merges its extra fields.
    pub async fn set_status(
        &self,
        id: Uuid,
        update: StatusUpdate,
    ) -> Result<RenderJob, CoordinatorError> {
        let target = update.status;
        if target != JobStatus::Errored && update.carries_error_fields() {
            return Err(CoordinatorError::BadRequest(format!(
                "error fields are only accepted with status `errored`, not `{target}`"
            )));
        }

        let job = self.get(id).await?;
        job.status.ensure_transition(target).map_err(|_| {
            CoordinatorError::conflict(id, job.status, format!("move to `{target}`"))
        })?;
        if update.lease_token.is_some() && update.lease_token != job.lease_token {
            return Err(CoordinatorError::LeaseLost(id));
        }

        let lease = if target.is_terminal() {
            LeaseChange::Clear
        } else {
            LeaseChange::Keep
        };
        let patch = JobPatch {
            status: Some(target),
            lease,
            result: update.result.into_fields(),
            error_class: update.error_class,
            error_message: update.error_message,
            stderr_snippet: update
                .stderr_snippet
                .map(|snippet| truncate_utf8(&snippet, STDERR_SNIPPET_MAX_BYTES).to_string()),
            increment_retries: false,
        };
        let expect = Expectation::status(job.status).with_token(update.lease_token);

        match self.store.compare_and_set(id, expect, patch).await? {
            CasOutcome::Applied(updated) => {
                record_transition(target);
                info!(
                    target = "render_lease::coordinator",
                    job_id = %id,
                    from = %job.status,
                    to = %target,
                    "Render job status updated"
                );
                Ok(updated)
            }
            CasOutcome::StatusMismatch { current } => Err(CoordinatorError::conflict(
                id,
                current,
                format!("move to `{target}`"),
            )),
            CasOutcome::LeaseMismatch => Err(CoordinatorError::LeaseLost(id)),
            CasOutcome::Missing => Err(CoordinatorError::NotFound(id)),
        }
    }

    /// Requeues leased jobs whose lease ran out at or before `now`. Returns how many moved.
    pub async fn reap_expired(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> Result<usize, CoordinatorError> {
        let expired = self.store.expired_leases(now, limit).await?;
        let mut reaped = 0;

        for job in expired {
            let expect = Expectation::status(job.status).with_token(job.lease_token);
            let patch = JobPatch {
                increment_retries: true,
                ..JobPatch::to_status(JobStatus::Queued).with_lease(LeaseChange::Clear)
            };

            match self.store.compare_and_set(job.id, expect, patch).await? {
                CasOutcome::Applied(updated) => {
                    reaped += 1;
                    record_transition(JobStatus::Queued);
                    warn!(
                        target = "render_lease::coordinator",
                        job_id = %job.id,
                        previous = %job.status,
                        retries = updated.retries,
                        "Lease expired; render job requeued"
                    );
                }
                // Heartbeat or completion won the race; leave it.
                _ => continue,
            }
        }

        if reaped > 0 {
            counter!("render_coordinator_reaped_total").increment(reaped as u64);
        }
        Ok(reaped)
    }

    pub async fn health(&self) -> Result<(), CoordinatorError> {
        Ok(self.store.health_check().await?)
    }
}

fn record_transition(to: JobStatus) {
    counter!("render_coordinator_transitions_total", "to" => to.as_str()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::memory::MemoryJobStore;

    fn coordinator() -> LeaseCoordinator {
        LeaseCoordinator::new(
            Arc::new(MemoryJobStore::default()),
            CoordinatorConfig {
                default_lease_seconds: 180,
                max_lease_seconds: 600,
            },
        )
    }

    #[test]
    fn lease_seconds_are_clamped() {
        let coordinator = coordinator();
        assert_eq!(coordinator.effective_lease_seconds(None), 180);
        assert_eq!(coordinator.effective_lease_seconds(Some(0)), 1);
        assert_eq!(coordinator.effective_lease_seconds(Some(10_000)), 600);
    }

    #[test]
    fn status_update_flattens_result_fields() {
        let update: StatusUpdate = serde_json::from_value(serde_json::json!({
            "status": "rendered",
            "artifact_path": "output/videos/a.mp4",
            "bytes": 12,
        }))
        .expect("parse update");

        assert_eq!(update.status, JobStatus::Rendered);
        assert_eq!(update.result.bytes, Some(12));
        let fields = update.result.into_fields().expect("fields");
        assert_eq!(fields.len(), 2);
    }

    #[tokio::test]
    async fn error_fields_require_errored_target() {
        let coordinator = coordinator();
        let job = coordinator
            .enqueue(NewRenderJob::render_part(serde_json::json!({})))
            .await
            .expect("enqueue");

        let update = StatusUpdate {
            error_message: Some("boom".into()),
            ..StatusUpdate::new(JobStatus::Rendering)
        };
        let err = coordinator
            .set_status(job.id, update)
            .await
            .expect_err("error fields on rendering");
        assert!(matches!(err, CoordinatorError::BadRequest(_)));
    }

    #[tokio::test]
    async fn stderr_snippet_is_truncated() {
        let coordinator = coordinator();
        let job = coordinator
            .enqueue(NewRenderJob::render_part(serde_json::json!({})))
            .await
            .expect("enqueue");
        let grant = coordinator.claim(job.id, None).await.expect("claim");
        coordinator
            .set_status(
                job.id,
                StatusUpdate::new(JobStatus::Rendering).with_token(Some(grant.lease_token)),
            )
            .await
            .expect("rendering");

        let update = StatusUpdate {
            stderr_snippet: Some("x".repeat(1000)),
            ..StatusUpdate::errored("RenderCommandFailed", "exit 1")
        };
        let done = coordinator.set_status(job.id, update).await.expect("errored");

        assert_eq!(done.stderr_snippet.map(|s| s.len()), Some(400));
        assert_eq!(done.lease_expires_at, None);
        assert_eq!(done.lease_token, None);
    }
}

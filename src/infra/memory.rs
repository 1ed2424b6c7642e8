//! In-process job store for development runs and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::application::repos::{
    CasOutcome, Expectation, JobPatch, JobQueryFilter, JobStore, NewRenderJob, RepoError,
};
use crate::domain::entities::RenderJob;
use crate::domain::types::JobStatus;

/// Every conditional update runs inside one lock critical section.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, RenderJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a stored job, bypassing the conditional-update path.
    ///
    /// Only meant for fixtures that need states a real producer cannot create (an already
    /// expired lease, for instance).
    pub async fn put(&self, job: RenderJob) {
        self.jobs.lock().await.insert(job.id, job);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: NewRenderJob) -> Result<RenderJob, RepoError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.id) {
            return Err(RepoError::Duplicate {
                constraint: "render_jobs_pkey".to_string(),
            });
        }

        let now = OffsetDateTime::now_utc();
        let record = RenderJob {
            id: job.id,
            kind: job.kind,
            status: JobStatus::Queued,
            lease_expires_at: None,
            lease_token: None,
            lease_seconds: None,
            retries: 0,
            error_class: None,
            error_message: None,
            stderr_snippet: None,
            payload: job.payload,
            result: None,
            created_at: now,
            updated_at: now,
        };
        jobs.insert(record.id, record.clone());
        Ok(record)
    }

    async fn find(&self, id: Uuid) -> Result<Option<RenderJob>, RepoError> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn list(&self, filter: &JobQueryFilter) -> Result<Vec<RenderJob>, RepoError> {
        let jobs = self.jobs.lock().await;
        let mut matching: Vec<RenderJob> = jobs
            .values()
            .filter(|job| filter.status.is_none_or(|status| job.status == status))
            .filter(|job| filter.kind.is_none_or(|kind| job.kind == kind))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        matching.truncate(filter.effective_limit() as usize);
        Ok(matching)
    }

    async fn compare_and_set(
        &self,
        id: Uuid,
        expect: Expectation,
        patch: JobPatch,
    ) -> Result<CasOutcome, RepoError> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(CasOutcome::Missing);
        };

        if job.status != expect.status {
            return Ok(CasOutcome::StatusMismatch {
                current: job.status,
            });
        }
        if expect
            .lease_token
            .is_some_and(|token| job.lease_token != Some(token))
        {
            return Ok(CasOutcome::LeaseMismatch);
        }

        let mut candidate = job.clone();
        patch.apply_to(&mut candidate, OffsetDateTime::now_utc());
        candidate
            .check_lease()
            .map_err(|err| RepoError::Integrity {
                message: format!("job `{id}`: {err}"),
            })?;

        *job = candidate.clone();
        Ok(CasOutcome::Applied(candidate))
    }

    async fn expired_leases(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<RenderJob>, RepoError> {
        let jobs = self.jobs.lock().await;
        let mut expired: Vec<RenderJob> = jobs
            .values()
            .filter(|job| job.status.is_leased())
            .filter(|job| job.lease_expires_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        expired.sort_by_key(|job| (job.lease_expires_at, job.id));
        expired.truncate(limit.max(1) as usize);
        Ok(expired)
    }

    async fn health_check(&self) -> Result<(), RepoError> {
        Ok(())
    }
}

use std::convert::TryFrom;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Postgres, QueryBuilder};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    application::repos::{
        CasOutcome, Expectation, JobPatch, JobQueryFilter, JobStore, LeaseChange, NewRenderJob,
        RepoError,
    },
    domain::{
        entities::RenderJob,
        types::{JobKind, JobStatus},
    },
};

use super::{PostgresRepositories, map_sqlx_error};

const JOB_COLUMNS: &str = "id, kind, status, lease_expires_at, lease_token, lease_seconds, \
    retries, error_class, error_message, stderr_snippet, payload, result, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    kind: JobKind,
    status: JobStatus,
    lease_expires_at: Option<OffsetDateTime>,
    lease_token: Option<Uuid>,
    lease_seconds: Option<i32>,
    retries: i32,
    error_class: Option<String>,
    error_message: Option<String>,
    stderr_snippet: Option<String>,
    payload: Value,
    result: Option<Value>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<JobRow> for RenderJob {
    type Error = RepoError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let retries = u32::try_from(row.retries).map_err(|_| RepoError::Integrity {
            message: format!("job `{}` has negative retries `{}`", row.id, row.retries),
        })?;
        let lease_seconds = row
            .lease_seconds
            .map(u32::try_from)
            .transpose()
            .map_err(|_| RepoError::Integrity {
                message: format!("job `{}` has a negative lease duration", row.id),
            })?;

        Ok(Self {
            id: row.id,
            kind: row.kind,
            status: row.status,
            lease_expires_at: row.lease_expires_at,
            lease_token: row.lease_token,
            lease_seconds,
            retries,
            error_class: row.error_class,
            error_message: row.error_message,
            stderr_snippet: row.stderr_snippet,
            payload: row.payload,
            result: row.result,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CurrentStateRow {
    status: JobStatus,
    lease_token: Option<Uuid>,
}

fn push_patch(qb: &mut QueryBuilder<'_, Postgres>, patch: JobPatch) -> Result<(), RepoError> {
    qb.push("updated_at = now()");

    if let Some(status) = patch.status {
        qb.push(", status = ");
        qb.push_bind(status);
    }

    match patch.lease {
        LeaseChange::Keep => {}
        LeaseChange::Set {
            expires_at,
            token,
            seconds,
        } => {
            let seconds = i32::try_from(seconds).map_err(|_| RepoError::InvalidInput {
                message: format!("lease of {seconds}s is out of range"),
            })?;
            qb.push(", lease_expires_at = ");
            qb.push_bind(expires_at);
            qb.push(", lease_token = ");
            qb.push_bind(token);
            qb.push(", lease_seconds = ");
            qb.push_bind(seconds);
        }
        LeaseChange::Extend { expires_at } => {
            qb.push(", lease_expires_at = ");
            qb.push_bind(expires_at);
        }
        LeaseChange::Clear => {
            qb.push(", lease_expires_at = NULL, lease_token = NULL");
        }
    }

    if let Some(fields) = patch.result {
        qb.push(", result = COALESCE(result, '{}'::jsonb) || ");
        qb.push_bind(Value::Object(fields));
    }
    if let Some(value) = patch.error_class {
        qb.push(", error_class = ");
        qb.push_bind(value);
    }
    if let Some(value) = patch.error_message {
        qb.push(", error_message = ");
        qb.push_bind(value);
    }
    if let Some(value) = patch.stderr_snippet {
        qb.push(", stderr_snippet = ");
        qb.push_bind(value);
    }
    if patch.increment_retries {
        qb.push(", retries = retries + 1");
    }

    Ok(())
}

impl PostgresRepositories {
    /// Explains why a conditional update matched no row.
    async fn diagnose_mismatch(
        &self,
        id: Uuid,
        expect: Expectation,
    ) -> Result<CasOutcome, RepoError> {
        let current = sqlx::query_as::<_, CurrentStateRow>(
            "SELECT status, lease_token FROM render_jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        let Some(current) = current else {
            return Ok(CasOutcome::Missing);
        };

        if current.status != expect.status {
            return Ok(CasOutcome::StatusMismatch {
                current: current.status,
            });
        }

        match expect.lease_token {
            Some(token) if current.lease_token != Some(token) => Ok(CasOutcome::LeaseMismatch),
            // Matched by the time we looked; another writer moved it in between.
            _ => Ok(CasOutcome::StatusMismatch {
                current: current.status,
            }),
        }
    }
}

#[async_trait]
impl JobStore for PostgresRepositories {
    async fn insert(&self, job: NewRenderJob) -> Result<RenderJob, RepoError> {
        let sql = format!(
            "INSERT INTO render_jobs (id, kind, payload) VALUES ($1, $2, $3) RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job.id)
            .bind(job.kind)
            .bind(job.payload)
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        RenderJob::try_from(row)
    }

    async fn find(&self, id: Uuid) -> Result<Option<RenderJob>, RepoError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM render_jobs WHERE id = $1");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        row.map(RenderJob::try_from).transpose()
    }

    async fn list(&self, filter: &JobQueryFilter) -> Result<Vec<RenderJob>, RepoError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT ");
        qb.push(JOB_COLUMNS);
        qb.push(" FROM render_jobs WHERE 1=1");

        if let Some(status) = filter.status {
            qb.push(" AND status = ");
            qb.push_bind(status);
        }

        if let Some(kind) = filter.kind {
            qb.push(" AND kind = ");
            qb.push_bind(kind);
        }

        qb.push(" ORDER BY created_at ASC, id ASC LIMIT ");
        qb.push_bind(i64::from(filter.effective_limit()));

        let rows = qb
            .build_query_as::<JobRow>()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        rows.into_iter().map(RenderJob::try_from).collect()
    }

    async fn compare_and_set(
        &self,
        id: Uuid,
        expect: Expectation,
        patch: JobPatch,
    ) -> Result<CasOutcome, RepoError> {
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE render_jobs SET ");
        push_patch(&mut qb, patch)?;

        qb.push(" WHERE id = ");
        qb.push_bind(id);
        qb.push(" AND status = ");
        qb.push_bind(expect.status);
        if let Some(token) = expect.lease_token {
            qb.push(" AND lease_token = ");
            qb.push_bind(token);
        }
        qb.push(" RETURNING ");
        qb.push(JOB_COLUMNS);

        let row = qb
            .build_query_as::<JobRow>()
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        match row {
            Some(row) => RenderJob::try_from(row).map(CasOutcome::Applied),
            None => self.diagnose_mismatch(id, expect).await,
        }
    }

    async fn expired_leases(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<RenderJob>, RepoError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM render_jobs \
              WHERE status IN ('claimed', 'rendering') AND lease_expires_at <= $1 \
              ORDER BY lease_expires_at ASC, id ASC LIMIT $2"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(now)
            .bind(i64::from(limit.max(1)))
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        rows.into_iter().map(RenderJob::try_from).collect()
    }

    async fn health_check(&self) -> Result<(), RepoError> {
        self.ping().await.map_err(map_sqlx_error)
    }
}

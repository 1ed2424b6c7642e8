//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::entities::RenderJob;
use crate::domain::types::{JobKind, JobStatus};

pub const DEFAULT_LIST_LIMIT: u32 = 100;
pub const MAX_LIST_LIMIT: u32 = 500;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct NewRenderJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub payload: Value,
}

impl NewRenderJob {
    pub fn render_part(payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: JobKind::RenderPart,
            payload,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobQueryFilter {
    pub status: Option<JobStatus>,
    pub kind: Option<JobKind>,
    pub limit: Option<u32>,
}

impl JobQueryFilter {
    pub fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }
}

/// Precondition of a conditional update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expectation {
    pub status: JobStatus,
    /// When set, the stored lease token must match as well.
    pub lease_token: Option<Uuid>,
}

impl Expectation {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status,
            lease_token: None,
        }
    }

    pub fn with_token(mut self, token: Option<Uuid>) -> Self {
        self.lease_token = token;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseChange {
    Keep,
    Set {
        expires_at: OffsetDateTime,
        token: Uuid,
        seconds: u32,
    },
    /// Move the expiry only; token and duration stay as stored.
    Extend { expires_at: OffsetDateTime },
    Clear,
}

/// Field changes applied when the expectation holds. Every applied patch touches `updated_at`.
#[derive(Debug, Clone)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub lease: LeaseChange,
    pub result: Option<Map<String, Value>>,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
    pub stderr_snippet: Option<String>,
    pub increment_retries: bool,
}

impl Default for JobPatch {
    fn default() -> Self {
        Self {
            status: None,
            lease: LeaseChange::Keep,
            result: None,
            error_class: None,
            error_message: None,
            stderr_snippet: None,
            increment_retries: false,
        }
    }
}

impl JobPatch {
    pub fn to_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_lease(mut self, lease: LeaseChange) -> Self {
        self.lease = lease;
        self
    }

    /// Apply the patch to an in-memory record. Result fields merge key by key.
    pub fn apply_to(&self, job: &mut RenderJob, now: OffsetDateTime) {
        if let Some(status) = self.status {
            job.status = status;
        }
        match self.lease {
            LeaseChange::Keep => {}
            LeaseChange::Set {
                expires_at,
                token,
                seconds,
            } => {
                job.lease_expires_at = Some(expires_at);
                job.lease_token = Some(token);
                job.lease_seconds = Some(seconds);
            }
            LeaseChange::Extend { expires_at } => job.lease_expires_at = Some(expires_at),
            LeaseChange::Clear => {
                job.lease_expires_at = None;
                job.lease_token = None;
            }
        }
        if let Some(fields) = &self.result {
            let mut merged = match job.result.take() {
                Some(Value::Object(existing)) => existing,
                _ => Map::new(),
            };
            merged.extend(fields.clone());
            job.result = Some(Value::Object(merged));
        }
        if let Some(value) = &self.error_class {
            job.error_class = Some(value.clone());
        }
        if let Some(value) = &self.error_message {
            job.error_message = Some(value.clone());
        }
        if let Some(value) = &self.stderr_snippet {
            job.stderr_snippet = Some(value.clone());
        }
        if self.increment_retries {
            job.retries = job.retries.saturating_add(1);
        }
        job.updated_at = now;
    }
}

/// Outcome of [`JobStore::compare_and_set`].
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    Applied(RenderJob),
    StatusMismatch { current: JobStatus },
    LeaseMismatch,
    Missing,
}

/// Durable storage for render jobs.
///
/// `compare_and_set` must be atomic under concurrent callers: of several callers racing on the
/// same expectation, exactly one observes `Applied`.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: NewRenderJob) -> Result<RenderJob, RepoError>;

    async fn find(&self, id: Uuid) -> Result<Option<RenderJob>, RepoError>;

    /// Oldest first (`created_at`, then `id`).
    async fn list(&self, filter: &JobQueryFilter) -> Result<Vec<RenderJob>, RepoError>;

    async fn compare_and_set(
        &self,
        id: Uuid,
        expect: Expectation,
        patch: JobPatch,
    ) -> Result<CasOutcome, RepoError>;

    /// Leased jobs whose expiry is at or before `now`, oldest expiry first.
    async fn expired_leases(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<RenderJob>, RepoError>;

    async fn health_check(&self) -> Result<(), RepoError>;
}

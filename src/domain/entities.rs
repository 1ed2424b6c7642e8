//! Domain entities mirrored from persistent storage.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::error::DomainError;
use crate::domain::types::{JobKind, JobStatus};

/// A unit of leasable render work as stored in `render_jobs`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub lease_expires_at: Option<OffsetDateTime>,
    /// Fencing token of the current lease holder. Never exposed through listings.
    #[serde(skip_serializing)]
    pub lease_token: Option<Uuid>,
    pub lease_seconds: Option<u32>,
    pub retries: u32,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
    pub stderr_snippet: Option<String>,
    pub payload: Value,
    pub result: Option<Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl RenderJob {
    /// Checks the "lease set iff claimed or rendering" rule.
    pub fn lease_consistent(&self) -> bool {
        self.status.is_leased() == self.lease_expires_at.is_some()
    }

    pub fn check_lease(&self) -> Result<(), DomainError> {
        if self.lease_consistent() {
            return Ok(());
        }
        Err(DomainError::LeaseInvariant {
            status: self.status,
            lease_expires_at: self.lease_expires_at,
        })
    }
}

/// The slice of a job a worker needs to claim and render it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTicket {
    pub id: Uuid,
    #[serde(default)]
    pub kind: JobKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub retries: u32,
}

impl From<&RenderJob> for JobTicket {
    fn from(job: &RenderJob) -> Self {
        Self {
            id: job.id,
            kind: job.kind,
            payload: job.payload.clone(),
            retries: job.retries,
        }
    }
}

use thiserror::Error;
use time::OffsetDateTime;

use crate::domain::types::JobStatus;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("illegal transition from `{from}` to `{to}`")]
    IllegalTransition { from: JobStatus, to: JobStatus },
    #[error("lease on a `{status}` job is inconsistent (lease_expires_at = {lease_expires_at:?})")]
    LeaseInvariant {
        status: JobStatus,
        lease_expires_at: Option<OffsetDateTime>,
    },
}

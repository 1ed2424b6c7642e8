//! The worker's view of the lease coordinator.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::application::coordinator::{
    CoordinatorError, LeaseCoordinator, LeaseGrant, StatusUpdate,
};
use crate::application::repos::JobQueryFilter;
use crate::domain::entities::JobTicket;
use crate::domain::types::{JobKind, JobStatus};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("render job not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("lease gone: {0}")]
    Gone(String),
    #[error("coordinator rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to decode coordinator response: {0}")]
    Decode(String),
}

impl ClientError {
    /// 404, 409 and 410 all mean this worker no longer owns the job.
    pub fn is_lease_lost(&self) -> bool {
        matches!(
            self,
            ClientError::NotFound(_) | ClientError::Conflict(_) | ClientError::Gone(_)
        )
    }
}

#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    /// Up to `limit` queued jobs, oldest first.
    async fn list_queued(&self, limit: u32) -> Result<Vec<JobTicket>, ClientError>;

    async fn claim(&self, id: Uuid, lease_seconds: u32) -> Result<LeaseGrant, ClientError>;

    async fn heartbeat(&self, id: Uuid, lease_token: Uuid) -> Result<LeaseGrant, ClientError>;

    async fn set_status(&self, id: Uuid, update: StatusUpdate) -> Result<(), ClientError>;
}

/// Calls a [`LeaseCoordinator`] in the same process.
#[derive(Clone)]
pub struct InProcessClient {
    coordinator: Arc<LeaseCoordinator>,
}

impl InProcessClient {
    pub fn new(coordinator: Arc<LeaseCoordinator>) -> Self {
        Self { coordinator }
    }
}

impl From<CoordinatorError> for ClientError {
    fn from(err: CoordinatorError) -> Self {
        let message = err.to_string();
        match err {
            CoordinatorError::NotFound(_) => ClientError::NotFound(message),
            CoordinatorError::Conflict { .. } => ClientError::Conflict(message),
            CoordinatorError::LeaseLost(_) => ClientError::Gone(message),
            CoordinatorError::BadRequest(_) => ClientError::Rejected {
                status: 400,
                body: message,
            },
            CoordinatorError::Store(_) => ClientError::Transport(message),
        }
    }
}

#[async_trait]
impl CoordinatorClient for InProcessClient {
    async fn list_queued(&self, limit: u32) -> Result<Vec<JobTicket>, ClientError> {
        let jobs = self
            .coordinator
            .list(JobQueryFilter {
                status: Some(JobStatus::Queued),
                kind: Some(JobKind::RenderPart),
                limit: Some(limit),
            })
            .await?;
        Ok(jobs.iter().map(JobTicket::from).collect())
    }

    async fn claim(&self, id: Uuid, lease_seconds: u32) -> Result<LeaseGrant, ClientError> {
        Ok(self.coordinator.claim(id, Some(lease_seconds)).await?)
    }

    async fn heartbeat(&self, id: Uuid, lease_token: Uuid) -> Result<LeaseGrant, ClientError> {
        Ok(self.coordinator.heartbeat(id, Some(lease_token)).await?)
    }

    async fn set_status(&self, id: Uuid, update: StatusUpdate) -> Result<(), ClientError> {
        self.coordinator.set_status(id, update).await?;
        Ok(())
    }
}

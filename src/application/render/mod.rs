//! Render function contract and the harness around it.
//!
//! The render itself is opaque. The harness owns the per-job scratch directory and the
//! atomic publication of the final artifact; a partial file is never visible at the
//! published location.

mod command;
mod harness;
mod types;

pub use command::{CommandRenderer, CommandRendererConfig};
pub use harness::{PublishError, PublishedArtifact, Workspace, publish_atomically};
pub use types::{RenderFailure, RenderOutput};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::entities::JobTicket;

/// One render attempt for a claimed job.
///
/// `cancel` fires when the worker gives up on the job (timeout or lease loss). Honouring
/// it is best effort; the worker never waits for the render to stop.
#[async_trait]
pub trait RenderFunction: Send + Sync {
    async fn render(
        &self,
        job: &JobTicket,
        workspace: &Workspace,
        cancel: CancellationToken,
    ) -> Result<RenderOutput, RenderFailure>;
}

//! One claimed job from `rendering` to a terminal status.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::WorkerConfig;
use super::client::CoordinatorClient;
use super::heartbeat::{heartbeat_interval, spawn_heartbeat};
use crate::application::coordinator::{LeaseGrant, RenderResult, StatusUpdate};
use crate::application::render::{RenderFailure, RenderFunction, RenderOutput, Workspace};
use crate::domain::entities::JobTicket;
use crate::domain::types::JobStatus;

pub const TIMEOUT_MESSAGE: &str = "timeout";
pub const LEASE_LOST_MESSAGE: &str = "lease_lost";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Rendered,
    Failed,
    TimedOut,
    LeaseLost,
    /// Never reached `rendering`; nothing was posted after the claim.
    Abandoned,
}

impl JobOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            JobOutcome::Rendered => "rendered",
            JobOutcome::Failed => "failed",
            JobOutcome::TimedOut => "timed_out",
            JobOutcome::LeaseLost => "lease_lost",
            JobOutcome::Abandoned => "abandoned",
        }
    }
}

pub(crate) struct JobContext {
    pub client: Arc<dyn CoordinatorClient>,
    pub renderer: Arc<dyn RenderFunction>,
    pub config: WorkerConfig,
}

enum Resolution {
    LeaseLost,
    Finished(Result<Result<RenderOutput, RenderFailure>, JoinError>),
    TimedOut,
}

/// Heartbeat, render and report one claimed job. The workspace is removed and the
/// heartbeat stopped on every path out.
pub(crate) async fn run_claimed_job(
    ctx: &JobContext,
    job: JobTicket,
    grant: LeaseGrant,
) -> JobOutcome {
    let started = Instant::now();
    let lease_lost = CancellationToken::new();
    let stop_heartbeat = CancellationToken::new();
    let heartbeat = spawn_heartbeat(
        ctx.client.clone(),
        job.id,
        grant.lease_token,
        heartbeat_interval(grant.lease_seconds, ctx.config.heartbeat_cap),
        lease_lost.clone(),
        stop_heartbeat.clone(),
    );

    let outcome = execute(ctx, &job, &grant, &lease_lost, started).await;

    stop_heartbeat.cancel();
    if let Err(err) = heartbeat.await {
        warn!(
            target = "render_lease::worker",
            job_id = %job.id,
            error = %err,
            "Heartbeat task ended abnormally"
        );
    }

    if let Err(err) = Workspace::discard(&ctx.config.tmp_dir, job.id).await {
        warn!(
            target = "render_lease::worker",
            job_id = %job.id,
            workspace = %Workspace::path_for(&ctx.config.tmp_dir, job.id).display(),
            error = %err,
            "Failed to remove job workspace"
        );
    }

    let elapsed_ms = started.elapsed().as_millis() as f64;
    counter!("render_worker_jobs_total", "outcome" => outcome.as_str()).increment(1);
    histogram!("render_worker_job_duration_ms").record(elapsed_ms);
    info!(
        target = "render_lease::worker",
        job_id = %job.id,
        outcome = outcome.as_str(),
        elapsed_ms,
        "Render job finished"
    );

    outcome
}

async fn execute(
    ctx: &JobContext,
    job: &JobTicket,
    grant: &LeaseGrant,
    lease_lost: &CancellationToken,
    started: Instant,
) -> JobOutcome {
    let token = Some(grant.lease_token);

    if let Err(err) = ctx
        .client
        .set_status(job.id, StatusUpdate::new(JobStatus::Rendering).with_token(token))
        .await
    {
        warn!(
            target = "render_lease::worker",
            job_id = %job.id,
            error = %err,
            "Could not start rendering; abandoning job"
        );
        return JobOutcome::Abandoned;
    }

    let workspace = match Workspace::create(&ctx.config.tmp_dir, job.id).await {
        Ok(workspace) => workspace,
        Err(err) => {
            let update = StatusUpdate::errored(
                "WorkspaceError",
                format!("failed to create workspace: {err}"),
            );
            report(ctx, job, update.with_token(token)).await;
            return JobOutcome::Failed;
        }
    };

    let cancel_render = CancellationToken::new();
    let mut render_task = {
        let renderer = ctx.renderer.clone();
        let job = job.clone();
        let cancel = cancel_render.clone();
        tokio::spawn(async move { renderer.render(&job, &workspace, cancel).await })
    };
    let deadline = tokio::time::sleep(ctx.config.job_timeout);

    let resolution = tokio::select! {
        biased;
        _ = lease_lost.cancelled() => Resolution::LeaseLost,
        joined = &mut render_task => Resolution::Finished(joined),
        _ = deadline => Resolution::TimedOut,
    };

    let (outcome, update) = match resolution {
        Resolution::Finished(Ok(Ok(output))) => {
            let result = RenderResult {
                artifact_path: Some(output.artifact_path.display().to_string()),
                bytes: Some(output.bytes),
                duration_ms: Some(started.elapsed().as_millis() as u64),
                sha256: Some(output.sha256),
            };
            let update = StatusUpdate {
                result,
                ..StatusUpdate::new(JobStatus::Rendered)
            };
            (JobOutcome::Rendered, update)
        }
        Resolution::Finished(Ok(Err(failure))) => {
            let update = StatusUpdate {
                stderr_snippet: failure.stderr_tail,
                ..StatusUpdate::errored(failure.class, failure.message)
            };
            (JobOutcome::Failed, update)
        }
        Resolution::Finished(Err(join_err)) => (
            JobOutcome::Failed,
            StatusUpdate::errored("RenderPanicked", join_err.to_string()),
        ),
        Resolution::TimedOut => {
            // The render may keep running; only the bookkeeping is final.
            cancel_render.cancel();
            (
                JobOutcome::TimedOut,
                StatusUpdate::errored("JobTimeout", TIMEOUT_MESSAGE),
            )
        }
        Resolution::LeaseLost => {
            cancel_render.cancel();
            (
                JobOutcome::LeaseLost,
                StatusUpdate::errored("LeaseLost", LEASE_LOST_MESSAGE),
            )
        }
    };

    report(ctx, job, update.with_token(token)).await;
    outcome
}

async fn report(ctx: &JobContext, job: &JobTicket, update: StatusUpdate) {
    let status = update.status;
    if let Err(err) = ctx.client.set_status(job.id, update).await {
        warn!(
            target = "render_lease::worker",
            job_id = %job.id,
            status = %status,
            error = %err,
            "Failed to report render job status"
        );
    }
}

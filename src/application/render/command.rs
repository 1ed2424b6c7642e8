use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::harness::{Workspace, publish_atomically};
use super::types::{RenderFailure, RenderOutput};
use super::RenderFunction;
use crate::domain::entities::JobTicket;

const PAYLOAD_FILE: &str = "job.json";

#[derive(Debug, Clone)]
pub struct CommandRendererConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub output_dir: PathBuf,
    pub output_extension: String,
}

/// Runs an external program inside the job workspace and publishes what it writes to
/// `$RENDER_OUTPUT`.
///
/// The program sees `RENDER_JOB_ID`, `RENDER_WORKSPACE`, `RENDER_OUTPUT` and
/// `RENDER_PAYLOAD` (a JSON file holding the job payload).
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    config: CommandRendererConfig,
}

impl CommandRenderer {
    pub fn new(config: CommandRendererConfig) -> Self {
        Self { config }
    }

    fn output_name(&self, job: &JobTicket) -> String {
        format!("{}.{}", job.id, self.config.output_extension)
    }

    async fn discard_partial(workspace: &Workspace) {
        if let Err(err) = workspace.clear().await {
            warn!(
                target = "render_lease::render",
                workspace = %workspace.path().display(),
                error = %err,
                "Failed to discard partial render output"
            );
        }
    }
}

#[async_trait]
impl RenderFunction for CommandRenderer {
    async fn render(
        &self,
        job: &JobTicket,
        workspace: &Workspace,
        cancel: CancellationToken,
    ) -> Result<RenderOutput, RenderFailure> {
        let payload_path = workspace.file(PAYLOAD_FILE);
        let payload = serde_json::to_vec(&job.payload)
            .map_err(|err| RenderFailure::new("RenderPayloadInvalid", err.to_string()))?;
        fs::write(&payload_path, payload)
            .await
            .map_err(|err| RenderFailure::io("failed to write job payload", &err))?;

        let staged_output = workspace.file(&format!("output.{}", self.config.output_extension));

        let child = Command::new(&self.config.program)
            .args(&self.config.args)
            .current_dir(workspace.path())
            .env("RENDER_JOB_ID", job.id.to_string())
            .env("RENDER_WORKSPACE", workspace.path())
            .env("RENDER_OUTPUT", &staged_output)
            .env("RENDER_PAYLOAD", &payload_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                RenderFailure::new(
                    "RenderCommandSpawnFailed",
                    format!("failed to start `{}`: {err}", self.config.program.display()),
                )
            })?;

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            output = child.wait_with_output() => output,
            _ = cancel.cancelled() => {
                Self::discard_partial(workspace).await;
                return Err(RenderFailure::cancelled());
            }
        };

        let output = match output {
            Ok(output) => output,
            Err(err) => {
                Self::discard_partial(workspace).await;
                return Err(RenderFailure::io("failed to wait for render command", &err));
            }
        };

        if !output.status.success() {
            Self::discard_partial(workspace).await;
            return Err(RenderFailure::command_failed(
                output.status.code(),
                &output.stderr,
            ));
        }

        if !fs::try_exists(&staged_output).await.unwrap_or(false) {
            Self::discard_partial(workspace).await;
            return Err(RenderFailure::new(
                "RenderOutputMissing",
                format!(
                    "render command succeeded but wrote nothing to {}",
                    staged_output.display()
                ),
            ));
        }

        let published = publish_atomically(
            &staged_output,
            &self.config.output_dir,
            &self.output_name(job),
        )
        .await
        .map_err(|err| RenderFailure::new("PublishFailed", err.to_string()))?;

        debug!(
            target = "render_lease::render",
            job_id = %job.id,
            artifact = %published.path.display(),
            bytes = published.bytes,
            "Render artifact published"
        );

        Ok(RenderOutput {
            artifact_path: published.path,
            bytes: published.bytes,
            sha256: published.sha256,
        })
    }
}

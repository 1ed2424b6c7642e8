use std::path::PathBuf;

use thiserror::Error;

use crate::util::bytes::tail_utf8;

pub const STDERR_TAIL_BYTES: usize = 400;

/// A published artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOutput {
    pub artifact_path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
}

/// Structured render failure, recorded on the job as `error_*` fields.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class}: {message}")]
pub struct RenderFailure {
    pub class: String,
    pub message: String,
    pub exit_code: Option<i32>,
    pub stderr_tail: Option<String>,
}

impl RenderFailure {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            exit_code: None,
            stderr_tail: None,
        }
    }

    pub fn command_failed(exit_code: Option<i32>, stderr: &[u8]) -> Self {
        let message = match exit_code {
            Some(code) => format!("render command exited with status {code}"),
            None => "render command terminated by signal".to_string(),
        };
        let tail = tail_utf8(stderr, STDERR_TAIL_BYTES);
        Self {
            class: "RenderCommandFailed".to_string(),
            message,
            exit_code,
            stderr_tail: (!tail.is_empty()).then_some(tail),
        }
    }

    pub fn io(context: &str, err: &std::io::Error) -> Self {
        Self::new("RenderIoError", format!("{context}: {err}"))
    }

    pub fn cancelled() -> Self {
        Self::new("RenderCancelled", "render cancelled by worker")
    }
}

//! Shared domain enumerations aligned with persisted database enums.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::error::DomainError;

/// Lifecycle state of a render job (mirrors Postgres enum `render_job_status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "render_job_status", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Claimed,
    Rendering,
    Rendered,
    Errored,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Claimed,
        JobStatus::Rendering,
        JobStatus::Rendered,
        JobStatus::Errored,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Claimed => "claimed",
            JobStatus::Rendering => "rendering",
            JobStatus::Rendered => "rendered",
            JobStatus::Errored => "errored",
        }
    }

    /// Targets reachable through an explicit status update.
    ///
    /// `queued -> claimed` is deliberately absent: it only happens through a claim.
    pub fn settable_targets(self) -> &'static [JobStatus] {
        match self {
            JobStatus::Claimed => &[JobStatus::Rendering],
            JobStatus::Rendering => &[JobStatus::Rendered, JobStatus::Errored],
            JobStatus::Queued | JobStatus::Rendered | JobStatus::Errored => &[],
        }
    }

    pub fn can_transition_to(self, target: JobStatus) -> bool {
        self.settable_targets().contains(&target)
    }

    pub fn ensure_transition(self, target: JobStatus) -> Result<(), DomainError> {
        if self.can_transition_to(target) {
            Ok(())
        } else {
            Err(DomainError::IllegalTransition {
                from: self,
                to: target,
            })
        }
    }

    /// Whether a job in this status holds a lease.
    pub fn is_leased(self) -> bool {
        matches!(self, JobStatus::Claimed | JobStatus::Rendering)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Rendered | JobStatus::Errored)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| UnknownVariant::new("job status", value))
    }
}

/// Kind of leasable work (mirrors Postgres enum `render_job_kind`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "render_job_kind", rename_all = "snake_case")]
pub enum JobKind {
    #[default]
    RenderPart,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::RenderPart => "render_part",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "render_part" => Ok(JobKind::RenderPart),
            other => Err(UnknownVariant::new("job kind", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {what} `{value}`")]
pub struct UnknownVariant {
    what: &'static str,
    value: String,
}

impl UnknownVariant {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_documented_edges_are_settable() {
        let mut edges = Vec::new();
        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                if from.can_transition_to(to) {
                    edges.push((from, to));
                }
            }
        }

        assert_eq!(
            edges,
            vec![
                (JobStatus::Claimed, JobStatus::Rendering),
                (JobStatus::Rendering, JobStatus::Rendered),
                (JobStatus::Rendering, JobStatus::Errored),
            ]
        );
    }

    #[test]
    fn lease_is_held_only_while_claimed_or_rendering() {
        let leased: Vec<_> = JobStatus::ALL
            .into_iter()
            .filter(|status| status.is_leased())
            .collect();
        assert_eq!(leased, vec![JobStatus::Claimed, JobStatus::Rendering]);
    }

    #[test]
    fn status_parses_from_wire_names() {
        assert_eq!("rendering".parse::<JobStatus>(), Ok(JobStatus::Rendering));
        assert!("Rendering".parse::<JobStatus>().is_err());
        assert_eq!("render_part".parse::<JobKind>(), Ok(JobKind::RenderPart));
    }
}

//! Worker pool: polls the coordinator, claims jobs and runs them under a lease.

mod backoff;
mod client;
mod disk;
mod heartbeat;
mod job;
mod pool;

pub use backoff::{Backoff, backoff_delay};
pub use client::{ClientError, CoordinatorClient, InProcessClient};
pub use disk::{
    DEFAULT_DISK_MIN_FREE_BYTES, DiskCheck, DiskProbe, FixedDiskProbe, FsDiskProbe, check_disk,
};
pub use heartbeat::{DEFAULT_HEARTBEAT_CAP, heartbeat_interval, spawn_heartbeat};
pub use job::JobOutcome;
pub use pool::{PollSummary, WorkerPool};

use std::path::PathBuf;
use std::time::Duration;

use crate::application::coordinator::DEFAULT_LEASE_SECONDS;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub poll_backoff_factor: f64,
    pub poll_max_interval: Duration,
    pub max_concurrent: usize,
    pub max_claim: u32,
    pub lease_seconds: u32,
    pub job_timeout: Duration,
    pub heartbeat_cap: Duration,
    pub disk_min_free_bytes: u64,
    pub tmp_dir: PathBuf,
    pub liveness_file: Option<PathBuf>,
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            poll_backoff_factor: 2.0,
            poll_max_interval: Duration::from_secs(30),
            max_concurrent: 2,
            max_claim: 4,
            lease_seconds: DEFAULT_LEASE_SECONDS,
            job_timeout: Duration::from_secs(1800),
            heartbeat_cap: DEFAULT_HEARTBEAT_CAP,
            disk_min_free_bytes: DEFAULT_DISK_MIN_FREE_BYTES,
            tmp_dir: std::env::temp_dir().join("render-lease"),
            liveness_file: None,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

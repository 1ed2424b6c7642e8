use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the render-lease binary.
#[derive(Debug, Parser)]
#[command(
    name = "render-lease",
    version,
    about = "Lease coordinator and worker pool for render jobs"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "RENDER_LEASE_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the lease coordinator HTTP service.
    Serve(Box<ServeArgs>),
    /// Run a render worker pool against a coordinator.
    Work(Box<WorkArgs>),
    /// Exit non-zero when the coordinator or the local worker looks unhealthy.
    Healthcheck(HealthcheckArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the database connection URL. Without one the coordinator keeps jobs in memory.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,

    /// Override the lease granted when a claim does not ask for one.
    #[arg(long = "default-lease-seconds", value_name = "SECONDS")]
    pub default_lease_seconds: Option<u32>,

    /// Override the longest lease a claim may ask for.
    #[arg(long = "max-lease-seconds", value_name = "SECONDS")]
    pub max_lease_seconds: Option<u32>,

    /// Enable or disable the expired-lease reaper.
    #[arg(
        long = "reaper-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub reaper_enabled: Option<bool>,

    /// Override the reaper cron expression (six fields, seconds first).
    #[arg(long = "reaper-schedule", value_name = "CRON")]
    pub reaper_schedule: Option<String>,

    /// Require this bearer token on `/render-jobs` routes.
    #[arg(long = "auth-token", env = "RENDER_LEASE_AUTH_TOKEN", value_name = "TOKEN")]
    pub auth_token: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct WorkArgs {
    #[command(flatten)]
    pub overrides: WorkOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct WorkOverrides {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Override the coordinator base URL.
    #[arg(long = "api-base-url", value_name = "URL")]
    pub api_base_url: Option<String>,

    /// Bearer token sent to the coordinator.
    #[arg(long = "api-token", env = "RENDER_LEASE_API_TOKEN", value_name = "TOKEN")]
    pub api_token: Option<String>,

    /// Override the number of jobs rendered at once.
    #[arg(long = "max-concurrent", value_name = "COUNT")]
    pub max_concurrent: Option<u32>,

    /// Override the number of jobs requested per poll.
    #[arg(long = "max-claim", value_name = "COUNT")]
    pub max_claim: Option<u32>,

    /// Override the lease requested on claim.
    #[arg(long = "lease-seconds", value_name = "SECONDS")]
    pub lease_seconds: Option<u32>,

    /// Override the wall-clock limit of one job.
    #[arg(long = "job-timeout-seconds", value_name = "SECONDS")]
    pub job_timeout_seconds: Option<u64>,

    /// Override the free-space floor checked before each claim.
    #[arg(long = "disk-min-free-bytes", value_name = "BYTES")]
    pub disk_min_free_bytes: Option<u64>,

    /// Override the workspace root.
    #[arg(long = "tmp-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub tmp_dir: Option<PathBuf>,

    /// Override the file touched on every poll cycle.
    #[arg(long = "liveness-file", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub liveness_file: Option<PathBuf>,

    /// Override the render program.
    #[arg(long = "render-program", value_name = "PATH", value_hint = ValueHint::CommandName)]
    pub render_program: Option<PathBuf>,

    /// Override where finished artifacts are published.
    #[arg(long = "output-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct HealthcheckArgs {
    /// Override the coordinator base URL.
    #[arg(long = "api-base-url", value_name = "URL")]
    pub api_base_url: Option<String>,

    /// Override the worker liveness file to inspect.
    #[arg(long = "liveness-file", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub liveness_file: Option<PathBuf>,

    /// Oldest acceptable liveness file modification.
    #[arg(long = "max-age-seconds", default_value_t = 60)]
    pub max_age_seconds: u64,
}

//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

pub use cli::{
    CliArgs, Command, HealthcheckArgs, LoggingOverrides, ServeArgs, ServeOverrides, WorkArgs,
    WorkOverrides,
};

use std::{net::SocketAddr, num::NonZeroU32, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::application::coordinator::{
    CoordinatorConfig, DEFAULT_LEASE_SECONDS, DEFAULT_MAX_LEASE_SECONDS,
};
use crate::application::reaper::{DEFAULT_REAPER_SCHEDULE, reaper_schedule};
use crate::application::render::CommandRendererConfig;
use crate::application::worker::{DEFAULT_DISK_MIN_FREE_BYTES, WorkerConfig};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "render-lease";
const ENV_PREFIX: &str = "RENDER_LEASE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_POLL_BACKOFF_FACTOR: f64 = 2.0;
const DEFAULT_POLL_MAX_INTERVAL_MS: u64 = 30_000;
const DEFAULT_MAX_CONCURRENT: u32 = 2;
const DEFAULT_MAX_CLAIM: u32 = 4;
const DEFAULT_JOB_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_HEARTBEAT_CAP_SECS: u64 = 10;
const DEFAULT_TMP_DIR: &str = "/tmp/render-lease";
const DEFAULT_RENDER_PROGRAM: &str = "render-part";
const DEFAULT_OUTPUT_DIR: &str = "output/videos";
const DEFAULT_OUTPUT_EXTENSION: &str = "mp4";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub coordinator: CoordinatorSettings,
    pub worker: WorkerSettings,
    pub render: RenderSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub default_lease_seconds: NonZeroU32,
    pub max_lease_seconds: NonZeroU32,
    pub reaper_enabled: bool,
    pub reaper_schedule: String,
    pub auth_token: Option<String>,
}

impl CoordinatorSettings {
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            default_lease_seconds: self.default_lease_seconds.get(),
            max_lease_seconds: self.max_lease_seconds.get(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_backoff_factor: f64,
    pub poll_max_interval: Duration,
    pub max_concurrent: NonZeroU32,
    pub max_claim: NonZeroU32,
    pub lease_seconds: NonZeroU32,
    pub job_timeout: Duration,
    pub heartbeat_cap: Duration,
    pub disk_min_free_bytes: u64,
    pub tmp_dir: PathBuf,
    pub liveness_file: Option<PathBuf>,
}

impl WorkerSettings {
    /// Pool configuration; `shutdown_grace` comes from the server section.
    pub fn worker_config(&self, shutdown_grace: Duration) -> WorkerConfig {
        WorkerConfig {
            poll_interval: self.poll_interval,
            poll_backoff_factor: self.poll_backoff_factor,
            poll_max_interval: self.poll_max_interval,
            max_concurrent: self.max_concurrent.get() as usize,
            max_claim: self.max_claim.get(),
            lease_seconds: self.lease_seconds.get(),
            job_timeout: self.job_timeout,
            heartbeat_cap: self.heartbeat_cap,
            disk_min_free_bytes: self.disk_min_free_bytes,
            tmp_dir: self.tmp_dir.clone(),
            liveness_file: self.liveness_file.clone(),
            shutdown_grace,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub output_dir: PathBuf,
    pub output_extension: String,
}

impl From<&RenderSettings> for CommandRendererConfig {
    fn from(render: &RenderSettings) -> Self {
        Self {
            program: render.program.clone(),
            args: render.args.clone(),
            output_dir: render.output_dir.clone(),
            output_extension: render.output_extension.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_command_overrides(cli.command.as_ref());

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    coordinator: RawCoordinatorSettings,
    worker: RawWorkerSettings,
    render: RawRenderSettings,
}

impl RawSettings {
    fn apply_command_overrides(&mut self, command: Option<&Command>) {
        match command {
            Some(Command::Serve(args)) => self.apply_serve_overrides(&args.overrides),
            Some(Command::Work(args)) => self.apply_work_overrides(&args.overrides),
            Some(Command::Healthcheck(args)) => self.apply_healthcheck_overrides(args),
            None => {}
        }
    }

    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        self.apply_logging_overrides(&overrides.logging);

        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(seconds) = overrides.default_lease_seconds {
            self.coordinator.default_lease_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.max_lease_seconds {
            self.coordinator.max_lease_seconds = Some(seconds);
        }
        if let Some(enabled) = overrides.reaper_enabled {
            self.coordinator.reaper_enabled = Some(enabled);
        }
        if let Some(schedule) = overrides.reaper_schedule.as_ref() {
            self.coordinator.reaper_schedule = Some(schedule.clone());
        }
        if let Some(token) = overrides.auth_token.as_ref() {
            self.coordinator.auth_token = Some(token.clone());
        }
    }

    fn apply_work_overrides(&mut self, overrides: &WorkOverrides) {
        self.apply_logging_overrides(&overrides.logging);

        if let Some(url) = overrides.api_base_url.as_ref() {
            self.worker.api_base_url = Some(url.clone());
        }
        if let Some(token) = overrides.api_token.as_ref() {
            self.worker.api_token = Some(token.clone());
        }
        if let Some(value) = overrides.max_concurrent {
            self.worker.max_concurrent = Some(value);
        }
        if let Some(value) = overrides.max_claim {
            self.worker.max_claim = Some(value);
        }
        if let Some(seconds) = overrides.lease_seconds {
            self.worker.lease_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.job_timeout_seconds {
            self.worker.job_timeout_seconds = Some(seconds);
        }
        if let Some(bytes) = overrides.disk_min_free_bytes {
            self.worker.disk_min_free_bytes = Some(bytes);
        }
        if let Some(dir) = overrides.tmp_dir.as_ref() {
            self.worker.tmp_dir = Some(dir.clone());
        }
        if let Some(path) = overrides.liveness_file.as_ref() {
            self.worker.liveness_file = Some(path.clone());
        }
        if let Some(program) = overrides.render_program.as_ref() {
            self.render.program = Some(program.clone());
        }
        if let Some(dir) = overrides.output_dir.as_ref() {
            self.render.output_dir = Some(dir.clone());
        }
    }

    fn apply_healthcheck_overrides(&mut self, args: &HealthcheckArgs) {
        if let Some(url) = args.api_base_url.as_ref() {
            self.worker.api_base_url = Some(url.clone());
        }
        if let Some(path) = args.liveness_file.as_ref() {
            self.worker.liveness_file = Some(path.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            coordinator,
            worker,
            render,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            coordinator: build_coordinator_settings(coordinator)?,
            worker: build_worker_settings(worker)?,
            render: build_render_settings(render)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url: non_blank(database.url),
        max_connections,
    })
}

fn build_coordinator_settings(
    coordinator: RawCoordinatorSettings,
) -> Result<CoordinatorSettings, LoadError> {
    let default_lease_seconds = non_zero_u32(
        coordinator
            .default_lease_seconds
            .unwrap_or(DEFAULT_LEASE_SECONDS)
            .into(),
        "coordinator.default_lease_seconds",
    )?;
    let max_lease_seconds = non_zero_u32(
        coordinator
            .max_lease_seconds
            .unwrap_or(DEFAULT_MAX_LEASE_SECONDS)
            .into(),
        "coordinator.max_lease_seconds",
    )?;
    if default_lease_seconds > max_lease_seconds {
        return Err(LoadError::invalid(
            "coordinator.default_lease_seconds",
            format!("must not exceed max_lease_seconds ({max_lease_seconds})"),
        ));
    }

    let schedule = coordinator
        .reaper_schedule
        .unwrap_or_else(|| DEFAULT_REAPER_SCHEDULE.to_string());
    reaper_schedule(&schedule)
        .map_err(|reason| LoadError::invalid("coordinator.reaper_schedule", reason))?;

    Ok(CoordinatorSettings {
        default_lease_seconds,
        max_lease_seconds,
        reaper_enabled: coordinator.reaper_enabled.unwrap_or(true),
        reaper_schedule: schedule,
        auth_token: non_blank(coordinator.auth_token),
    })
}

fn build_worker_settings(worker: RawWorkerSettings) -> Result<WorkerSettings, LoadError> {
    let api_base_url = non_blank(worker.api_base_url)
        .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());

    let poll_backoff_factor = worker
        .poll_backoff_factor
        .unwrap_or(DEFAULT_POLL_BACKOFF_FACTOR);
    if !poll_backoff_factor.is_finite() || poll_backoff_factor < 1.0 {
        return Err(LoadError::invalid(
            "worker.poll_backoff_factor",
            "must be a finite number of at least 1.0",
        ));
    }

    let poll_interval_ms = positive(
        worker.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        "worker.poll_interval_ms",
    )?;
    let poll_max_interval_ms = worker
        .poll_max_interval_ms
        .unwrap_or(DEFAULT_POLL_MAX_INTERVAL_MS);
    if poll_max_interval_ms < poll_interval_ms {
        return Err(LoadError::invalid(
            "worker.poll_max_interval_ms",
            "must not be shorter than poll_interval_ms",
        ));
    }

    let tmp_dir = worker
        .tmp_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_TMP_DIR));
    if tmp_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid("worker.tmp_dir", "path must not be empty"));
    }

    Ok(WorkerSettings {
        api_base_url,
        api_token: non_blank(worker.api_token),
        request_timeout: Duration::from_secs(positive(
            worker
                .request_timeout_seconds
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            "worker.request_timeout_seconds",
        )?),
        poll_interval: Duration::from_millis(poll_interval_ms),
        poll_backoff_factor,
        poll_max_interval: Duration::from_millis(poll_max_interval_ms),
        max_concurrent: non_zero_u32(
            worker.max_concurrent.unwrap_or(DEFAULT_MAX_CONCURRENT).into(),
            "worker.max_concurrent",
        )?,
        max_claim: non_zero_u32(
            worker.max_claim.unwrap_or(DEFAULT_MAX_CLAIM).into(),
            "worker.max_claim",
        )?,
        lease_seconds: non_zero_u32(
            worker.lease_seconds.unwrap_or(DEFAULT_LEASE_SECONDS).into(),
            "worker.lease_seconds",
        )?,
        // Zero is allowed: every render then resolves as a timeout.
        job_timeout: Duration::from_secs(
            worker.job_timeout_seconds.unwrap_or(DEFAULT_JOB_TIMEOUT_SECS),
        ),
        heartbeat_cap: Duration::from_secs(positive(
            worker
                .heartbeat_cap_seconds
                .unwrap_or(DEFAULT_HEARTBEAT_CAP_SECS),
            "worker.heartbeat_cap_seconds",
        )?),
        disk_min_free_bytes: worker
            .disk_min_free_bytes
            .unwrap_or(DEFAULT_DISK_MIN_FREE_BYTES),
        tmp_dir,
        liveness_file: worker
            .liveness_file
            .filter(|path| !path.as_os_str().is_empty()),
    })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let program = render
        .program
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RENDER_PROGRAM));
    if program.as_os_str().is_empty() {
        return Err(LoadError::invalid("render.program", "path must not be empty"));
    }

    let output_dir = render
        .output_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));
    if output_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "render.output_dir",
            "path must not be empty",
        ));
    }

    let output_extension = render
        .output_extension
        .map(|ext| ext.trim_start_matches('.').to_string())
        .unwrap_or_else(|| DEFAULT_OUTPUT_EXTENSION.to_string());
    if output_extension.is_empty() || output_extension.contains(['/', '\\']) {
        return Err(LoadError::invalid(
            "render.output_extension",
            "must be a plain file extension",
        ));
    }

    Ok(RenderSettings {
        program,
        args: render.args.unwrap_or_default(),
        output_dir,
        output_extension,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCoordinatorSettings {
    default_lease_seconds: Option<u32>,
    max_lease_seconds: Option<u32>,
    reaper_enabled: Option<bool>,
    reaper_schedule: Option<String>,
    auth_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWorkerSettings {
    api_base_url: Option<String>,
    api_token: Option<String>,
    request_timeout_seconds: Option<u64>,
    poll_interval_ms: Option<u64>,
    poll_backoff_factor: Option<f64>,
    poll_max_interval_ms: Option<u64>,
    max_concurrent: Option<u32>,
    max_claim: Option<u32>,
    lease_seconds: Option<u32>,
    job_timeout_seconds: Option<u64>,
    heartbeat_cap_seconds: Option<u64>,
    disk_min_free_bytes: Option<u64>,
    tmp_dir: Option<PathBuf>,
    liveness_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    program: Option<PathBuf>,
    args: Option<Vec<String>>,
    output_dir: Option<PathBuf>,
    output_extension: Option<String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn positive(value: u64, key: &'static str) -> Result<u64, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

#[cfg(test)]
mod tests;

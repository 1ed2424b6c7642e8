use std::{
    path::Path,
    process,
    sync::Arc,
    time::{Duration, SystemTime},
};

use apalis::prelude::{Monitor, WorkerBuilder, WorkerFactoryFn};
use apalis_cron::CronStream;
use render_lease::{
    application::{
        coordinator::LeaseCoordinator,
        error::AppError,
        reaper::{ReaperContext, process_reap_expired_leases_job, reaper_schedule},
        render::{CommandRenderer, CommandRendererConfig},
        repos::JobStore,
        worker::{FsDiskProbe, WorkerPool},
    },
    config::{self, HealthcheckArgs},
    infra::{
        client::HttpCoordinatorClient,
        db::PostgresRepositories,
        error::InfraError,
        http::{self, CoordinatorState},
        memory::MemoryJobStore,
        shutdown::install_shutdown_handler,
        telemetry,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Work(_) => run_work(settings).await,
        config::Command::Healthcheck(args) => run_healthcheck(settings, args).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let store = init_store(&settings).await?;
    let coordinator = Arc::new(LeaseCoordinator::new(
        store,
        settings.coordinator.coordinator_config(),
    ));

    let monitor_handle = if settings.coordinator.reaper_enabled {
        Some(spawn_reaper_monitor(
            coordinator.clone(),
            &settings.coordinator.reaper_schedule,
        )?)
    } else {
        info!(target = "render_lease::reaper", "Lease reaper disabled");
        None
    };

    let state = CoordinatorState::new(coordinator)
        .with_auth_token(settings.coordinator.auth_token.clone());
    let result = serve_http(&settings, state).await;

    if let Some(handle) = monitor_handle {
        handle.abort();
        let _ = handle.await;
    }

    result
}

async fn init_store(settings: &config::Settings) -> Result<Arc<dyn JobStore>, AppError> {
    let Some(database_url) = settings.database.url.as_deref() else {
        warn!(
            target = "render_lease::store",
            "No database url configured; render jobs are kept in memory and lost on restart"
        );
        return Ok(Arc::new(MemoryJobStore::new()));
    };

    let pool =
        PostgresRepositories::connect(database_url, settings.database.max_connections.get())
            .await
            .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    Ok(Arc::new(PostgresRepositories::new(pool)))
}

fn spawn_reaper_monitor(
    coordinator: Arc<LeaseCoordinator>,
    expression: &str,
) -> Result<tokio::task::JoinHandle<()>, AppError> {
    let schedule = reaper_schedule(expression).map_err(AppError::validation)?;

    let reaper_worker = WorkerBuilder::new("reap-expired-leases-worker")
        .data(ReaperContext { coordinator })
        .backend(CronStream::new(schedule))
        .build_fn(process_reap_expired_leases_job);

    let monitor = Monitor::new().register(reaper_worker);

    Ok(tokio::spawn(async move {
        if let Err(err) = monitor.run().await {
            error!(error = %err, "reaper monitor stopped");
        }
    }))
}

async fn serve_http(settings: &config::Settings, state: CoordinatorState) -> Result<(), AppError> {
    let router = http::build_router(state);
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "render_lease::http",
        addr = %settings.server.addr,
        "Coordinator listening"
    );

    let shutdown = install_shutdown_handler();
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|err| AppError::from(InfraError::server(err.to_string())))
}

async fn run_work(settings: config::Settings) -> Result<(), AppError> {
    let worker = &settings.worker;
    let client = HttpCoordinatorClient::new(
        &worker.api_base_url,
        worker.api_token.as_deref(),
        worker.request_timeout,
    )?;
    let renderer = CommandRenderer::new(CommandRendererConfig::from(&settings.render));

    tokio::fs::create_dir_all(&worker.tmp_dir)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    let pool = WorkerPool::new(
        Arc::new(client),
        Arc::new(renderer),
        Arc::new(FsDiskProbe),
        worker.worker_config(settings.server.graceful_shutdown),
    );

    info!(
        target = "render_lease::worker",
        coordinator = %worker.api_base_url,
        tmp_dir = %worker.tmp_dir.display(),
        "Worker connecting to coordinator"
    );

    let shutdown: CancellationToken = install_shutdown_handler();
    pool.run(shutdown).await;
    Ok(())
}

async fn run_healthcheck(settings: config::Settings, args: HealthcheckArgs) -> Result<(), AppError> {
    let worker = &settings.worker;
    let client = HttpCoordinatorClient::new(
        &worker.api_base_url,
        worker.api_token.as_deref(),
        Duration::from_secs(5),
    )?;

    client
        .healthz()
        .await
        .map_err(|err| AppError::unexpected(format!("coordinator unhealthy: {err}")))?;

    if let Some(path) = worker.liveness_file.as_deref() {
        check_liveness(path, Duration::from_secs(args.max_age_seconds))?;
    }

    Ok(())
}

fn check_liveness(path: &Path, max_age: Duration) -> Result<(), AppError> {
    let modified = std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|err| {
            AppError::unexpected(format!(
                "worker liveness file `{}` unreadable: {err}",
                path.display()
            ))
        })?;

    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default();
    if age > max_age {
        return Err(AppError::unexpected(format!(
            "worker liveness file `{}` is {}s old",
            path.display(),
            age.as_secs()
        )));
    }
    Ok(())
}

use super::*;

#[test]
fn defaults_are_valid() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.server.addr.port(), DEFAULT_PORT);
    assert!(settings.database.url.is_none());
    assert_eq!(settings.coordinator.default_lease_seconds.get(), 180);
    assert_eq!(settings.coordinator.max_lease_seconds.get(), 3600);
    assert!(settings.coordinator.reaper_enabled);
    assert_eq!(settings.worker.poll_max_interval, Duration::from_secs(30));
    assert_eq!(settings.worker.heartbeat_cap, Duration::from_secs(10));
    assert_eq!(settings.render.output_extension, "mp4");
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());

    let overrides = ServeOverrides {
        server_port: Some(4321),
        logging: LoggingOverrides {
            log_level: Some("debug".to_string()),
            log_json: None,
        },
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = WorkOverrides {
        logging: LoggingOverrides {
            log_level: None,
            log_json: Some(true),
        },
        ..Default::default()
    };

    raw.apply_work_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn blank_database_url_means_in_memory() {
    let mut raw = RawSettings::default();
    raw.database.url = Some("   ".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.database.url.is_none());
}

#[test]
fn default_lease_cannot_exceed_maximum() {
    let mut raw = RawSettings::default();
    raw.coordinator.default_lease_seconds = Some(600);
    raw.coordinator.max_lease_seconds = Some(300);

    let err = Settings::from_raw(raw).expect_err("lease bounds");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "coordinator.default_lease_seconds",
            ..
        }
    ));
}

#[test]
fn bad_reaper_schedule_is_rejected() {
    let mut raw = RawSettings::default();
    raw.coordinator.reaper_schedule = Some("whenever".to_string());

    let err = Settings::from_raw(raw).expect_err("cron");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "coordinator.reaper_schedule",
            ..
        }
    ));
}

#[test]
fn backoff_factor_below_one_is_rejected() {
    let mut raw = RawSettings::default();
    raw.worker.poll_backoff_factor = Some(0.5);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn zero_concurrency_is_rejected() {
    let mut raw = RawSettings::default();
    raw.worker.max_concurrent = Some(0);

    let err = Settings::from_raw(raw).expect_err("zero");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "worker.max_concurrent",
            ..
        }
    ));
}

#[test]
fn zero_job_timeout_is_accepted() {
    let mut raw = RawSettings::default();
    raw.worker.job_timeout_seconds = Some(0);
    raw.worker.lease_seconds = Some(180);

    let settings = Settings::from_raw(raw).expect("zero timeout is valid");
    let config = settings
        .worker
        .worker_config(settings.server.graceful_shutdown);
    assert_eq!(config.job_timeout, Duration::ZERO);
    assert_eq!(config.lease_seconds, 180);
}

#[test]
fn worker_config_takes_grace_from_server() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    let config = settings
        .worker
        .worker_config(settings.server.graceful_shutdown);

    assert_eq!(config.shutdown_grace, Duration::from_secs(30));
    assert_eq!(config.max_concurrent, 2);
    assert_eq!(config.lease_seconds, 180);
}

#[test]
fn output_extension_loses_leading_dot() {
    let mut raw = RawSettings::default();
    raw.render.output_extension = Some(".webm".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.render.output_extension, "webm");
}

#[test]
fn no_subcommand_parses() {
    let args = CliArgs::parse_from(["render-lease"]);
    assert!(args.command.is_none());
}

#[test]
fn parse_work_overrides() {
    let args = CliArgs::parse_from([
        "render-lease",
        "work",
        "--api-base-url",
        "http://coordinator:8080",
        "--max-concurrent",
        "3",
        "--tmp-dir",
        "/scratch",
    ]);

    match args.command.expect("work command") {
        Command::Work(work) => {
            assert_eq!(
                work.overrides.api_base_url.as_deref(),
                Some("http://coordinator:8080")
            );
            assert_eq!(work.overrides.max_concurrent, Some(3));
            assert_eq!(
                work.overrides.tmp_dir.as_deref(),
                Some(std::path::Path::new("/scratch"))
            );
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_serve_overrides() {
    let args = CliArgs::parse_from([
        "render-lease",
        "serve",
        "--server-host",
        "0.0.0.0",
        "--database-url",
        "postgres://override",
        "--reaper-enabled",
        "false",
    ]);

    match args.command.expect("serve command") {
        Command::Serve(serve) => {
            assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));
            assert_eq!(
                serve.overrides.database_url.as_deref(),
                Some("postgres://override")
            );
            assert_eq!(serve.overrides.reaper_enabled, Some(false));
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_healthcheck_defaults_to_sixty_seconds() {
    let args = CliArgs::parse_from(["render-lease", "healthcheck"]);
    match args.command.expect("healthcheck command") {
        Command::Healthcheck(check) => assert_eq!(check.max_age_seconds, 60),
        _ => panic!("wrong command parsed"),
    }
}

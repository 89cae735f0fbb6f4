use clap::Parser;

use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());

    let args = ServeArgs {
        server_port: Some(4321),
        common: CommonOverrides {
            log_level: Some("debug".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    raw.apply_serve_overrides(&args);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn defaults_match_documented_values() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.server.addr.port(), DEFAULT_PORT);
    assert_eq!(settings.queue.attempts.get(), 3);
    assert_eq!(settings.queue.backoff_base, Duration::from_millis(1_000));
    assert_eq!(settings.engine.kind, EngineKind::Raster);
    assert_eq!(settings.engine.max_sessions.get(), 2);
    assert_eq!(settings.engine.settle_delay, Duration::from_millis(150));
    assert_eq!(settings.engine.max_canvas_pixels.get(), 33_554_432);
    assert_eq!(settings.templates.root, PathBuf::from("templates"));
    assert_eq!(settings.artifacts.output_dir, PathBuf::from("out"));
    assert!(settings.artifacts.s3.is_none());
    assert!(!settings.artifacts.presign);
    assert!(settings.worker.max_jobs.is_none());
    assert!(settings.worker.idle_timeout.is_none());
    assert_eq!(settings.worker.lease, Duration::from_secs(300));
    assert_eq!(settings.worker.health_addr.port(), DEFAULT_HEALTH_PORT);
}

#[test]
fn embedded_worker_defaults_on_only_without_database() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    assert!(settings.server.embedded_worker);

    let mut raw = RawSettings::default();
    raw.database.url = Some("postgres://example".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(!settings.server.embedded_worker);
}

#[test]
fn blank_database_url_is_treated_as_absent() {
    let mut raw = RawSettings::default();
    raw.database.url = Some("   ".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.database.url.is_none());
}

#[test]
fn zero_engine_sessions_is_rejected() {
    let mut raw = RawSettings::default();
    raw.engine.max_sessions = Some(0);
    let err = Settings::from_raw(raw).expect_err("zero sessions rejected");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "engine.max_sessions",
            ..
        }
    ));
}

#[test]
fn zero_canvas_budget_and_lease_are_rejected() {
    let mut raw = RawSettings::default();
    raw.engine.max_canvas_pixels = Some(0);
    let err = Settings::from_raw(raw).expect_err("zero canvas budget rejected");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "engine.max_canvas_pixels",
            ..
        }
    ));

    let mut raw = RawSettings::default();
    raw.worker.lease_seconds = Some(0);
    let err = Settings::from_raw(raw).expect_err("zero lease rejected");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "worker.lease_seconds",
            ..
        }
    ));
}

#[test]
fn unknown_engine_kind_is_rejected() {
    let mut raw = RawSettings::default();
    raw.engine.kind = Some("webkit".to_string());
    let err = Settings::from_raw(raw).expect_err("unknown engine rejected");
    assert!(matches!(err, LoadError::Invalid { key: "engine.kind", .. }));
}

#[test]
fn s3_bucket_requires_credentials() {
    let mut raw = RawSettings::default();
    raw.artifacts.s3_bucket = Some("cards".to_string());
    let err = Settings::from_raw(raw).expect_err("missing credentials rejected");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "artifacts.s3_access_key_id",
            ..
        }
    ));
}

#[test]
fn s3_endpoint_defaults_to_regional_aws() {
    let mut raw = RawSettings::default();
    raw.artifacts.s3_bucket = Some("cards".to_string());
    raw.artifacts.s3_region = Some("eu-west-1".to_string());
    raw.artifacts.s3_access_key_id = Some("AKID".to_string());
    raw.artifacts.s3_secret_access_key = Some("secret".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    let s3 = settings.artifacts.s3.expect("s3 configured");
    assert_eq!(s3.endpoint, "https://s3.eu-west-1.amazonaws.com");
    assert_eq!(s3.region, "eu-west-1");
}

#[test]
fn presign_ttl_is_bounded() {
    let mut raw = RawSettings::default();
    raw.artifacts.presign_ttl_seconds = Some(MAX_PRESIGN_TTL_SECS + 1);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let args = ServeArgs {
        common: CommonOverrides {
            log_json: Some(true),
            ..Default::default()
        },
        ..Default::default()
    };

    raw.apply_serve_overrides(&args);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["cardsmith"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_worker_arguments() {
    let args = CliArgs::parse_from([
        "cardsmith",
        "worker",
        "--database-url",
        "postgres://example",
        "--max-jobs",
        "10",
        "--idle-timeout-seconds",
        "5",
    ]);

    match args.command.expect("worker command") {
        Command::Worker(worker) => {
            assert_eq!(
                worker.common.database_url.as_deref(),
                Some("postgres://example")
            );
            assert_eq!(worker.max_jobs, Some(10));
            assert_eq!(worker.idle_timeout_seconds, Some(5));

            let mut raw = RawSettings::default();
            raw.apply_worker_overrides(&worker);
            let settings = Settings::from_raw(raw).expect("valid settings");
            assert_eq!(settings.worker.max_jobs.map(NonZeroU64::get), Some(10));
            assert_eq!(settings.worker.idle_timeout, Some(Duration::from_secs(5)));
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_render_arguments() {
    let args = CliArgs::parse_from([
        "cardsmith",
        "render",
        "--template",
        "templates/card.json",
        "--mapping",
        "mapping.json",
        "--output",
        "/tmp/card.png",
    ]);

    match args.command.expect("render command") {
        Command::Render(render) => {
            assert_eq!(render.template, std::path::Path::new("templates/card.json"));
            assert_eq!(
                render.mapping.as_deref(),
                Some(std::path::Path::new("mapping.json"))
            );
            assert_eq!(render.output, std::path::Path::new("/tmp/card.png"));
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_enqueue_arguments() {
    let args = CliArgs::parse_from([
        "cardsmith",
        "enqueue",
        "--template",
        "card.json",
        "--presign",
    ]);

    match args.command.expect("enqueue command") {
        Command::Enqueue(enqueue) => {
            assert_eq!(enqueue.template, "card.json");
            assert!(enqueue.presign);
            assert!(enqueue.mapping.is_none());
        }
        _ => panic!("wrong command parsed"),
    }
}
